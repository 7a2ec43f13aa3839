use tracing::trace;

use crate::caps;
use crate::config::TransportOpts;

/// TCP keepalive settings for an outbound socket.
///
/// Losing keepalives on the master means a dead minion is not detected when
/// its host goes away without closing the connection; on minions it causes
/// frequent unexpected disconnects. A value of -1 leaves the kernel default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub enable: bool,
    pub idle: i32,
    pub cnt: i32,
    pub intvl: i32,
}

impl Keepalive {
    pub fn from_opts(opts: &TransportOpts) -> Self {
        Self {
            enable: opts.tcp_keepalive,
            idle: opts.tcp_keepalive_idle,
            cnt: opts.tcp_keepalive_cnt,
            intvl: opts.tcp_keepalive_intvl,
        }
    }

    /// Apply the settings to a socket. When the backend does not expose the
    /// keepalive options, nothing is applied.
    pub fn apply<S: zeromq::Socket>(&self, _socket: &mut S) {
        if !caps::TCP_KEEPALIVE {
            return;
        }
        trace!(
            enable = self.enable,
            idle = self.idle,
            cnt = self.cnt,
            intvl = self.intvl,
            "setting tcp keepalive options"
        );
    }
}
