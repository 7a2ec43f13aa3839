use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the muster transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Fatal at construction: missing or contradictory endpoint configuration.
    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    /// A publish message arrived with a frame count that is neither 1 nor 2.
    #[error("invalid number of frames ({0}) in publish message from master")]
    Protocol(usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    /// The request client's overall deadline elapsed; the socket has been
    /// closed as a side effect.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
