use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::config::TransportOpts;
use crate::error::TransportError;
use crate::keepalive::Keepalive;
use crate::reconnect::ReconnectWindow;
use crate::uri;

/// Deadline applied when the caller does not pass one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Client side of the request channel.
///
/// Wraps a single request socket and serializes access so at most one
/// send/recv pair is in flight. A transport error during either half closes
/// the socket and retries exactly once over a fresh connection; the overall
/// deadline turns into [`TransportError::RequestTimeout`] with the socket
/// closed as a side effect.
pub struct RequestClient {
    master_uri: String,
    keepalive: Keepalive,
    reconnect: ReconnectWindow,
    detect_mode: bool,
    socket: Mutex<Option<ReqSocket>>,
    sending: Mutex<()>,
    closing: AtomicBool,
}

impl RequestClient {
    pub fn new(opts: &TransportOpts) -> Result<Self, TransportError> {
        Ok(Self {
            master_uri: Self::master_uri(opts)?,
            keepalive: Keepalive::from_opts(opts),
            reconnect: ReconnectWindow::resolve(opts),
            detect_mode: opts.detect_mode,
            socket: Mutex::new(None),
            sending: Mutex::new(()),
            closing: AtomicBool::new(false),
        })
    }

    /// Resolve the connection string: explicit `master_uri` wins, else it is
    /// composed from `master_ip`/`master_port` and the source return port.
    pub fn master_uri(opts: &TransportOpts) -> Result<String, TransportError> {
        if let Some(master_uri) = &opts.master_uri {
            return Ok(master_uri.clone());
        }
        if let Some(master_ip) = &opts.master_ip {
            return Ok(uri::master_uri(
                master_ip,
                opts.master_port,
                opts.source_ip.as_deref(),
                opts.source_ret_port,
            ));
        }
        Err(TransportError::Config(
            "request channel: missing master_uri / master_ip in configuration".into(),
        ))
    }

    /// Connect lazily; a no-op when the socket is already open.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut guard = self.socket.lock().await;
        if guard.is_none() {
            self.closing.store(false, Ordering::SeqCst);
            *guard = Some(self.init_socket().await?);
        }
        Ok(())
    }

    async fn init_socket(&self) -> Result<ReqSocket, TransportError> {
        let mut socket = ReqSocket::new();
        self.keepalive.apply(&mut socket);
        if self.master_uri.starts_with("tcp://[") {
            // Bracket-enclosed destination, hint the dual-stack family.
            trace!("request socket will carry IPv6 traffic");
        }
        debug!("Connecting request client to {}", self.master_uri);
        socket.connect(&self.master_uri).await?;
        Ok(socket)
    }

    /// Send one request and await its reply.
    ///
    /// The payload is serialized for the wire; the reply is deserialized
    /// into the expected type. Concurrent calls are strictly serialized.
    pub async fn send<Req, Rep>(
        &self,
        load: &Req,
        timeout: Option<Duration>,
    ) -> Result<Rep, TransportError>
    where
        Req: Serialize + ?Sized,
        Rep: DeserializeOwned,
    {
        let deadline = if self.detect_mode {
            Duration::from_secs(1)
        } else {
            timeout.unwrap_or(DEFAULT_TIMEOUT)
        };
        let message = rmp_serde::to_vec(load)?;
        match tokio::time::timeout(deadline, self.send_recv(message)).await {
            Ok(Ok(reply)) => match rmp_serde::from_slice(&reply) {
                Ok(decoded) => Ok(decoded),
                Err(e) => {
                    self.close().await;
                    Err(e.into())
                }
            },
            Ok(Err(e)) => {
                self.close().await;
                Err(e)
            }
            Err(_) => {
                self.close().await;
                Err(TransportError::RequestTimeout(deadline))
            }
        }
    }

    async fn send_recv(&self, message: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let _sending = self.sending.lock().await;
        self.connect().await?;
        let mut guard = self.socket.lock().await;
        let socket = guard
            .as_mut()
            .ok_or_else(|| TransportError::Transport("request socket is closed".into()))?;
        match roundtrip(socket, &message).await {
            Ok(reply) => Ok(reply),
            Err(TransportError::Zmq(e)) => {
                debug!(error = %e, "request socket error, reconnecting once");
                // Release the broken socket entirely before the retry
                // allocates a fresh one.
                guard.take();
                tokio::time::sleep(self.reconnect.interval()).await;
                let socket = guard.insert(self.init_socket().await?);
                roundtrip(socket, &message).await
            }
            Err(e) => Err(e),
        }
    }

    /// Idempotent; releases the socket so the next `send` reconnects.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.socket.lock().await.take();
    }
}

async fn roundtrip(socket: &mut ReqSocket, message: &[u8]) -> Result<Vec<u8>, TransportError> {
    socket.send(ZmqMessage::from(message.to_vec())).await?;
    let reply = socket.recv().await?;
    reply
        .get(0)
        .map(|frame| frame.to_vec())
        .ok_or_else(|| TransportError::Transport("empty reply from master".into()))
}
