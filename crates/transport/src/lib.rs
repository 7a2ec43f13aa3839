//! Messaging transport between a master and its minions: a publish channel
//! fanning command payloads out to subscribers, and a request channel
//! multiplexing minion requests onto a pool of master workers through a
//! queue device. Payloads are opaque bytes; serialization of application
//! loads uses MessagePack, and everything above it (crypto, retries,
//! semantics) belongs to the caller.

pub mod caps;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod monitor;
pub mod pub_server;
pub mod pubsub;
pub mod reconnect;
pub mod req_server;
pub mod reqrep;
pub mod uri;

pub use config::{IpcMode, Role, TransportOpts};
pub use error::TransportError;
pub use keepalive::Keepalive;
pub use monitor::SocketMonitor;
pub use pub_server::{PublishDaemon, PublishServer, PublishServerConfig};
pub use pubsub::{topic_hash, PublishClient, PublishClientConfig, Subscription};
pub use reconnect::ReconnectWindow;
pub use req_server::{RequestBroker, RequestHandler, RequestServer};
pub use reqrep::RequestClient;
pub use uri::{ip_bracket, master_uri, Target};
