use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::TransportOpts;

/// Reconnect backoff window for a client socket.
///
/// With randomization enabled the interval is drawn uniformly from
/// `[recon_default, recon_default + recon_max]` milliseconds so that a
/// master restart does not see every minion reconnect in the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectWindow {
    pub ivl_ms: u64,
    pub max_ms: u64,
}

impl ReconnectWindow {
    pub fn resolve(opts: &TransportOpts) -> Self {
        let ivl_ms = if opts.recon_randomize {
            let delay = rand::thread_rng().gen_range(opts.recon_default..=opts.recon_default + opts.recon_max);
            debug!(
                "Generated random reconnect delay between '{}ms' and '{}ms' ({})",
                delay,
                delay + opts.recon_max,
                delay
            );
            delay
        } else {
            opts.recon_default
        };
        debug!("Setting reconnect_ivl to '{ivl_ms}ms'");
        debug!("Setting reconnect_ivl_max to '{}ms'", ivl_ms + opts.recon_max);
        Self {
            ivl_ms,
            max_ms: ivl_ms + opts.recon_max,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.ivl_ms)
    }
}
