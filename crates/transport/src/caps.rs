//! Capabilities of the underlying socket backend.
//!
//! The pure-Rust `zeromq` implementation carries its own connection
//! management and does not expose the full libzmq socket-option surface.
//! `SOURCE_BIND` and `TCP_KEEPALIVE` are consulted — the URI composer and
//! the keepalive policy branch on them and take their documented fallback
//! instead of failing. `RECONNECT_IVL` and `SOCKET_TUNING` are
//! informational: on this backend their fallback is unconditional, so they
//! record the limitation for operators and future backends rather than
//! gating any code path.

/// `tcp://source;destination` dual-endpoint connect syntax.
///
/// Requires libzmq >= 4.1.6; the pure-Rust backend does not parse it, so the
/// URI composer falls back to the plain destination form with a warning.
pub const SOURCE_BIND: bool = false;

/// TCP keepalive socket options (keepalive, idle, count, interval). The
/// keepalive policy consults this and applies nothing when unsupported.
pub const TCP_KEEPALIVE: bool = false;

/// Reconnect interval options. Informational: clients always drive their
/// own reconnects here, pacing them with the same randomized window these
/// options would have carried.
pub const RECONNECT_IVL: bool = false;

/// High-water mark, backlog and linger options. Informational: the backend
/// always bounds queues internally, so the resolved values are only logged.
pub const SOCKET_TUNING: bool = false;
