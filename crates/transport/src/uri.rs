use std::borrow::Cow;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::caps;
use crate::error::TransportError;

/// Longest IPC socket path the platform accepts (`sun_path` minus the
/// trailing NUL on Linux).
const IPC_PATH_MAX_LEN: usize = 107;

/// A bind or connect target for one socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Target {
    /// TCP endpoint. IPv6 literals are bracketed when rendered.
    Tcp { host: String, port: u16 },

    /// Unix domain socket. `mode` is chmod'd onto the path after bind.
    Ipc { path: PathBuf, mode: u32 },
}

impl Target {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// IPC target with the default owner-only mode.
    pub fn ipc(path: impl Into<PathBuf>) -> Self {
        Self::Ipc {
            path: path.into(),
            mode: 0o600,
        }
    }

    pub fn ipc_with_mode(path: impl Into<PathBuf>, mode: u32) -> Self {
        Self::Ipc {
            path: path.into(),
            mode,
        }
    }

    /// Render the ZeroMQ endpoint string.
    pub fn uri(&self) -> String {
        match self {
            Self::Tcp { host, port } => format!("tcp://{}:{}", ip_bracket(host), port),
            Self::Ipc { path, .. } => format!("ipc://{}", path.display()),
        }
    }

    /// Filesystem path for IPC targets, if any.
    pub fn ipc_path(&self) -> Option<&Path> {
        match self {
            Self::Ipc { path, .. } => Some(path),
            Self::Tcp { .. } => None,
        }
    }

    /// Create the directory an IPC socket lives in. No-op for TCP.
    pub fn ensure_ipc_dir(&self) -> Result<(), TransportError> {
        if let Some(parent) = self.ipc_path().and_then(Path::parent) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Remove a leftover socket file from a previous run so bind succeeds.
    pub fn remove_stale_socket(&self) -> Result<(), TransportError> {
        if let Some(path) = self.ipc_path() {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Validate that an IPC path fits the platform socket-address limit.
    /// TCP targets always pass.
    pub fn check_ipc_path_len(&self) -> Result<(), TransportError> {
        if let Self::Ipc { path, .. } = self {
            let len = path.as_os_str().len();
            if len > IPC_PATH_MAX_LEN {
                return Err(TransportError::Config(format!(
                    "ipc socket path '{}' is {} chars long, exceeding the {} char limit",
                    path.display(),
                    len,
                    IPC_PATH_MAX_LEN
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uri())
    }
}

/// Wrap bare IPv6 literals in brackets so they can carry a port suffix.
pub fn ip_bracket(host: &str) -> Cow<'_, str> {
    if host.contains(':') && !host.starts_with('[') {
        Cow::Owned(format!("[{host}]"))
    } else {
        Cow::Borrowed(host)
    }
}

/// Build the URI a minion uses to reach a master port.
///
/// When a source IP or port is configured and the backend supports the
/// dual-endpoint connect syntax, the result is `tcp://source;destination`.
/// Otherwise the source components are ignored with a warning.
pub fn master_uri(
    master_ip: &str,
    master_port: u16,
    source_ip: Option<&str>,
    source_port: Option<u16>,
) -> String {
    compose(
        master_ip,
        master_port,
        source_ip,
        source_port,
        caps::SOURCE_BIND,
    )
}

fn compose(
    master_ip: &str,
    master_port: u16,
    source_ip: Option<&str>,
    source_port: Option<u16>,
    source_bind_supported: bool,
) -> String {
    let dst = format!("{}:{}", ip_bracket(master_ip), master_port);
    if source_ip.is_none() && source_port.is_none() {
        return format!("tcp://{dst}");
    }
    if !source_bind_supported {
        warn!("Unable to connect to the master using a specific source IP / port");
        warn!("Consider a messaging backend built on libzmq >= 4.1.6");
        warn!(
            "Specific source IP / port for connecting to master returner port: \
             configuration ignored"
        );
        return format!("tcp://{dst}");
    }
    let src = match (source_ip, source_port) {
        (Some(ip), Some(port)) => format!("{}:{}", ip_bracket(ip), port),
        (Some(ip), None) => format!("{}:0", ip_bracket(ip)),
        (None, Some(port)) => {
            // Match the destination's address family for the wildcard bind.
            let any = if master_ip.contains(':') { "[::]" } else { "0.0.0.0" };
            format!("{any}:{port}")
        }
        (None, None) => unreachable!(),
    };
    format!("tcp://{src};{dst}")
}
