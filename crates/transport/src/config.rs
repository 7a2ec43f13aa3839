use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

// ── Role ────────────────────────────────────────────────────────────

/// Process role within the master/minion topology.
///
/// A syndic is an intermediary master forwarding commands downstream; it
/// subscribes to its own reserved topic instead of an identity hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Minion,
    Master,
    Syndic,
}

// ── Worker endpoint mode ────────────────────────────────────────────

/// How master workers reach the broker's back side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcMode {
    /// Unix domain socket under `sock_dir` (default).
    #[default]
    Ipc,
    /// Loopback TCP on `tcp_master_workers`.
    Tcp,
}

// ── Transport options ───────────────────────────────────────────────

/// Configuration bag consumed by the transport components.
///
/// Parsed from TOML; every field has a default so a partial file (or none at
/// all) yields a working local setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportOpts {
    /// Subscriber identity; source of the topic hash.
    #[serde(default)]
    pub id: String,

    #[serde(default, rename = "__role")]
    pub role: Role,

    /// Enables topic filtering on the publish channel (publisher and
    /// subscriber symmetric).
    #[serde(default)]
    pub zmq_filtering: bool,

    /// When filtering, also emit every targeted publish on the `syndic`
    /// topic so downstream masters can forward it.
    #[serde(default)]
    pub order_masters: bool,

    // TCP keepalive. Values mirror the platform socket options; -1 leaves
    // the kernel default.
    #[serde(default = "default_true")]
    pub tcp_keepalive: bool,
    #[serde(default = "default_keepalive_idle")]
    pub tcp_keepalive_idle: i32,
    #[serde(default = "default_minus_one")]
    pub tcp_keepalive_cnt: i32,
    #[serde(default = "default_minus_one")]
    pub tcp_keepalive_intvl: i32,

    // Reconnect backoff window, milliseconds.
    #[serde(default = "default_recon_default")]
    pub recon_default: u64,
    #[serde(default = "default_recon_max")]
    pub recon_max: u64,
    #[serde(default = "default_true")]
    pub recon_randomize: bool,

    /// Force dual-stack sockets. When unset, IPv6 is inferred from the
    /// destination address.
    #[serde(default)]
    pub ipv6: Option<bool>,

    /// Attach a lifecycle event monitor to long-lived sockets.
    #[serde(default)]
    pub zmq_monitor: bool,

    #[serde(default)]
    pub ipc_mode: IpcMode,
    #[serde(default = "default_tcp_master_workers")]
    pub tcp_master_workers: u16,
    #[serde(default = "default_sock_dir")]
    pub sock_dir: PathBuf,

    #[serde(default = "default_backlog")]
    pub zmq_backlog: i32,
    #[serde(default = "default_hwm")]
    pub pub_hwm: i32,

    /// Niceness increment applied to the broker process (unix only).
    #[serde(default)]
    pub mworker_queue_niceness: Option<i32>,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Interface the broker's client-facing socket binds on.
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Port the broker's client-facing socket binds on, and the default
    /// destination port for request clients.
    #[serde(default = "default_ret_port")]
    pub ret_port: u16,

    #[serde(default)]
    pub master_ip: Option<String>,
    #[serde(default = "default_ret_port")]
    pub master_port: u16,
    /// Full connection URI; overrides `master_ip`/`master_port` composition.
    #[serde(default)]
    pub master_uri: Option<String>,

    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub source_port: Option<u16>,
    #[serde(default)]
    pub source_ret_port: Option<u16>,
    #[serde(default)]
    pub source_publish_port: Option<u16>,

    /// Forces a 1 s request timeout; used while probing for a live master.
    #[serde(default)]
    pub detect_mode: bool,
}

fn default_true() -> bool {
    true
}

fn default_minus_one() -> i32 {
    -1
}

fn default_keepalive_idle() -> i32 {
    300
}

fn default_recon_default() -> u64 {
    1000
}

fn default_recon_max() -> u64 {
    10000
}

fn default_tcp_master_workers() -> u16 {
    4515
}

fn default_sock_dir() -> PathBuf {
    PathBuf::from("/tmp/muster")
}

fn default_backlog() -> i32 {
    1000
}

fn default_hwm() -> i32 {
    1000
}

fn default_worker_threads() -> usize {
    5
}

fn default_interface() -> String {
    "0.0.0.0".into()
}

fn default_ret_port() -> u16 {
    4506
}

impl Default for TransportOpts {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize from defaults")
    }
}

impl TransportOpts {
    /// Load options from a TOML file and validate them.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let raw = std::fs::read_to_string(path)?;
        let opts: Self = toml::from_str(&raw)?;
        opts.validate()?;
        Ok(opts)
    }

    /// Reject configurations that cannot produce a working transport.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.sock_dir.as_os_str().is_empty() {
            return Err(TransportError::Config("sock_dir must not be empty".into()));
        }
        if self.recon_default == 0 {
            return Err(TransportError::Config(
                "recon_default must be at least 1ms".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(TransportError::Config(
                "worker_threads must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Path of the broker/worker rendezvous socket in IPC mode.
    pub fn workers_ipc_path(&self) -> PathBuf {
        self.sock_dir.join("workers.ipc")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let opts = TransportOpts::default();
        assert_eq!(opts.role, Role::Minion);
        assert!(!opts.zmq_filtering);
        assert!(opts.tcp_keepalive);
        assert_eq!(opts.tcp_keepalive_idle, 300);
        assert_eq!(opts.tcp_keepalive_cnt, -1);
        assert_eq!(opts.recon_default, 1000);
        assert_eq!(opts.recon_max, 10000);
        assert_eq!(opts.tcp_master_workers, 4515);
        assert_eq!(opts.zmq_backlog, 1000);
        assert_eq!(opts.pub_hwm, 1000);
        assert_eq!(opts.ret_port, 4506);
        assert_eq!(opts.ipc_mode, IpcMode::Ipc);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let opts: TransportOpts = toml::from_str(
            r#"
            id = "m1"
            __role = "syndic"
            zmq_filtering = true
            ipc_mode = "tcp"
            tcp_master_workers = 4600
            "#,
        )
        .unwrap();
        assert_eq!(opts.id, "m1");
        assert_eq!(opts.role, Role::Syndic);
        assert!(opts.zmq_filtering);
        assert_eq!(opts.ipc_mode, IpcMode::Tcp);
        assert_eq!(opts.tcp_master_workers, 4600);
        // untouched keys fall back to defaults
        assert_eq!(opts.master_port, 4506);
    }

    #[test]
    fn rejects_zero_recon_default() {
        let opts: TransportOpts = toml::from_str("recon_default = 0").unwrap();
        assert!(matches!(
            opts.validate(),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn workers_ipc_path_under_sock_dir() {
        let opts: TransportOpts = toml::from_str(r#"sock_dir = "/var/run/muster""#).unwrap();
        assert_eq!(
            opts.workers_ipc_path(),
            PathBuf::from("/var/run/muster/workers.ipc")
        );
    }
}
