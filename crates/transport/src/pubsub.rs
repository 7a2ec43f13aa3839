use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::sync::Mutex;
use tracing::{debug, error, trace};
use zeromq::{Socket, SocketRecv, SubSocket, ZmqMessage};

use crate::config::{Role, TransportOpts};
use crate::error::TransportError;
use crate::keepalive::Keepalive;
use crate::monitor::SocketMonitor;
use crate::reconnect::ReconnectWindow;
use crate::uri::{self, Target};

/// Reserved topic every filtered subscriber listens on.
pub const BROADCAST_TOPIC: &[u8] = b"broadcast";
/// Reserved topic for intermediary masters.
pub const SYNDIC_TOPIC: &[u8] = b"syndic";

/// Interval at which consumer loops surface to observe their run-flag.
const CONSUMER_POLL: Duration = Duration::from_millis(300);

/// Lowercase hex SHA-1 of a subscriber identity; its topic-filter key.
///
/// Topic matching is a prefix match on raw bytes, so identities are hashed
/// to a fixed width to avoid one minion's filter matching another's id.
pub fn topic_hash(id: &str) -> String {
    let digest = Sha1::digest(id.as_bytes());
    format!("{digest:x}")
}

/// Where the subscriber connects: a TCP host and port, or an IPC path.
/// Exactly one of the two forms must be given.
#[derive(Debug, Clone, Default)]
pub struct PublishClientConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<PathBuf>,
}

impl PublishClientConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            path: None,
        }
    }

    pub fn ipc(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }
}

/// Async callback invoked once per delivered publish payload.
pub type PublishCallback = Box<
    dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>>
        + Send
        + Sync,
>;

/// Callback invoked after a successful connect.
pub type ConnectCallback =
    Box<dyn FnOnce(bool) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Handle to one `on_recv` registration. Dropping it does not cancel the
/// consumer; call [`Subscription::cancel`].
pub struct Subscription {
    running: Arc<AtomicBool>,
}

impl Subscription {
    /// Clear the run-flag; the consumer observes it at its next loop head.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct ConsumerHandle {
    running: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

/// Subscriber side of the publish channel.
///
/// Connects a SUB socket to a master publisher, applies the topic filters
/// for its role and identity, and decodes framed publish messages. Payloads
/// are opaque; decryption belongs to the layer above.
pub struct PublishClient {
    hexid: String,
    role: Role,
    source_ip: Option<String>,
    source_port: Option<u16>,
    config: std::sync::Mutex<PublishClientConfig>,
    socket: Arc<Mutex<Option<SubSocket>>>,
    consumers: std::sync::Mutex<Vec<ConsumerHandle>>,
    monitor: std::sync::Mutex<Option<SocketMonitor>>,
    closing: AtomicBool,
}

impl std::fmt::Debug for PublishClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishClient")
            .field("hexid", &self.hexid)
            .field("role", &self.role)
            .field("source_ip", &self.source_ip)
            .field("source_port", &self.source_port)
            .finish_non_exhaustive()
    }
}

impl PublishClient {
    pub async fn new(
        opts: &TransportOpts,
        config: PublishClientConfig,
    ) -> Result<Self, TransportError> {
        match (&config.host, &config.port, &config.path) {
            (Some(_), Some(_), None) | (None, None, Some(_)) => {}
            (Some(_), Some(_), Some(_)) => {
                return Err(TransportError::Config(
                    "a host and port or a path must be provided, not both".into(),
                ))
            }
            _ => {
                return Err(TransportError::Config(
                    "a host and port or a path must be provided".into(),
                ))
            }
        }

        let mut socket = sub_socket(&opts.id)?;
        if opts.zmq_filtering {
            socket.subscribe("broadcast").await?;
            if opts.role == Role::Syndic {
                socket.subscribe("syndic").await?;
            } else {
                socket.subscribe(&topic_hash(&opts.id)).await?;
            }
        } else {
            socket.subscribe("").await?;
        }

        Keepalive::from_opts(opts).apply(&mut socket);
        ReconnectWindow::resolve(opts);

        let dest = config
            .host
            .as_deref()
            .or(opts.master_ip.as_deref())
            .unwrap_or("127.0.0.1");
        if opts.ipv6.unwrap_or(false) || dest.contains(':') {
            trace!("subscriber socket will carry IPv6 traffic");
        }

        let monitor = if opts.zmq_monitor {
            let mut monitor = SocketMonitor::attach(&mut socket);
            monitor.start();
            Some(monitor)
        } else {
            None
        };

        Ok(Self {
            hexid: topic_hash(&opts.id),
            role: opts.role,
            source_ip: opts.source_ip.clone(),
            source_port: opts.source_publish_port,
            config: std::sync::Mutex::new(config),
            socket: Arc::new(Mutex::new(Some(socket))),
            consumers: std::sync::Mutex::new(Vec::new()),
            monitor: std::sync::Mutex::new(monitor),
            closing: AtomicBool::new(false),
        })
    }

    /// Connect to the configured endpoint. A `port` argument overrides the
    /// construction-time port for this and later connects.
    pub async fn connect(
        &self,
        port: Option<u16>,
        connect_callback: Option<ConnectCallback>,
    ) -> Result<(), TransportError> {
        let pub_uri = {
            let mut config = self.config.lock().expect("publish config poisoned");
            if let Some(port) = port {
                config.port = Some(port);
            }
            if let Some(path) = &config.path {
                let target = Target::ipc(path.clone());
                target.check_ipc_path_len()?;
                target.uri()
            } else {
                let host = config.host.clone().expect("validated at construction");
                let port = config.port.expect("validated at construction");
                uri::master_uri(
                    &host,
                    port,
                    self.source_ip.as_deref(),
                    self.source_port,
                )
            }
        };
        self.connect_uri(&pub_uri, connect_callback).await
    }

    /// Connect to an explicit URI, bypassing composition.
    pub async fn connect_uri(
        &self,
        pub_uri: &str,
        connect_callback: Option<ConnectCallback>,
    ) -> Result<(), TransportError> {
        debug!("Connecting the publisher client to: {pub_uri}");
        {
            let mut guard = self.socket.lock().await;
            let socket = guard
                .as_mut()
                .ok_or_else(|| TransportError::Transport("subscriber socket is closed".into()))?;
            socket.connect(pub_uri).await?;
        }
        if let Some(callback) = connect_callback {
            callback(true).await;
        }
        Ok(())
    }

    /// Receive one raw framed message.
    ///
    /// `Some(Duration::ZERO)` polls without waiting; any other deadline
    /// returns `None` once elapsed; `None` blocks until a message arrives.
    pub async fn recv(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<ZmqMessage>, TransportError> {
        let mut guard = self.socket.lock().await;
        let socket = guard
            .as_mut()
            .ok_or_else(|| TransportError::Transport("subscriber socket is closed".into()))?;
        match timeout {
            None => Ok(Some(socket.recv().await?)),
            Some(deadline) => match tokio::time::timeout(deadline, socket.recv()).await {
                Ok(message) => Ok(Some(message?)),
                Err(_) => {
                    trace!("publish client receive timed out after {deadline:?}");
                    Ok(None)
                }
            },
        }
    }

    /// Decode a framed publish message into its payload, applying the
    /// broadcast/syndic/identity-hash acceptance rules. `None` means the
    /// message targeted someone else.
    pub fn decode(&self, message: &ZmqMessage) -> Result<Option<Vec<u8>>, TransportError> {
        decode_frames(self.role, &self.hexid, message)
    }

    /// The publish channel is receive-only for minions; payloads handed to
    /// `send` are accepted and dropped.
    pub async fn send(&self, _msg: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    /// Register a consumer task invoking `callback` for every delivered
    /// payload, or cancel all consumers when `callback` is `None`.
    ///
    /// Callback errors are logged and swallowed; a transport-level receive
    /// error terminates that consumer only.
    pub fn on_recv(&self, callback: Option<PublishCallback>) -> Option<Subscription> {
        let Some(callback) = callback else {
            let mut consumers = self.consumers.lock().expect("consumer registry poisoned");
            for consumer in consumers.drain(..) {
                consumer.running.store(false, Ordering::SeqCst);
            }
            return None;
        };

        let running = Arc::new(AtomicBool::new(true));
        let task_running = running.clone();
        let socket = self.socket.clone();
        let role = self.role;
        let hexid = self.hexid.clone();
        let task = tokio::spawn(async move {
            while task_running.load(Ordering::SeqCst) {
                let message = {
                    let mut guard = socket.lock().await;
                    let Some(sock) = guard.as_mut() else {
                        break;
                    };
                    match tokio::time::timeout(CONSUMER_POLL, sock.recv()).await {
                        Ok(Ok(message)) => message,
                        Ok(Err(e)) => {
                            // We've disconnected, this consumer is done.
                            debug!(error = %e, "subscriber consumer ending");
                            break;
                        }
                        Err(_) => continue,
                    }
                };
                match decode_frames(role, &hexid, &message) {
                    Ok(Some(payload)) => {
                        if let Err(e) = callback(payload).await {
                            error!(error = %e, "Exception while running callback");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "Exception while decoding publish message"),
                }
            }
        });
        self.consumers
            .lock()
            .expect("consumer registry poisoned")
            .push(ConsumerHandle {
                running: running.clone(),
                task,
            });
        Some(Subscription { running })
    }

    /// Idempotent shutdown: cancels consumers, stops the monitor, releases
    /// the socket.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut consumers = self.consumers.lock().expect("consumer registry poisoned");
            for consumer in consumers.drain(..) {
                consumer.running.store(false, Ordering::SeqCst);
                consumer.task.abort();
            }
        }
        if let Some(mut monitor) = self.monitor.lock().expect("monitor poisoned").take() {
            monitor.stop();
        }
        self.socket.lock().await.take();
    }
}

fn sub_socket(id: &str) -> Result<SubSocket, TransportError> {
    if id.is_empty() {
        return Ok(SubSocket::new());
    }
    let identity = zeromq::util::PeerIdentity::try_from(id.as_bytes().to_vec())
        .map_err(|e| TransportError::Config(format!("invalid subscriber identity: {e}")))?;
    let mut options = zeromq::SocketOptions::default();
    options.peer_identity(identity);
    Ok(SubSocket::with_options(options))
}

fn decode_frames(
    role: Role,
    hexid: &str,
    message: &ZmqMessage,
) -> Result<Option<Vec<u8>>, TransportError> {
    let frames: Vec<_> = message.iter().collect();
    match frames.len() {
        // single frame, unfiltered publish
        1 => Ok(Some(frames[0].to_vec())),
        // two frames carry a routing topic ahead of the payload
        2 => {
            let topic: &[u8] = frames[0].as_ref();
            let accepted = match role {
                Role::Syndic => topic == BROADCAST_TOPIC || topic == SYNDIC_TOPIC,
                _ => topic == BROADCAST_TOPIC || topic == hexid.as_bytes(),
            };
            if accepted {
                Ok(Some(frames[1].to_vec()))
            } else {
                debug!(
                    "Publish received for not this minion: {}",
                    String::from_utf8_lossy(topic)
                );
                Ok(None)
            }
        }
        count => Err(TransportError::Protocol(count)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeromq::{PubSocket, SocketSend};

    fn two_frame(topic: &[u8], payload: &[u8]) -> ZmqMessage {
        let mut message = ZmqMessage::from(topic.to_vec());
        message.push_back(payload.to_vec().into());
        message
    }

    #[test]
    fn topic_hash_is_lowercase_hex_sha1() {
        // SHA-1("abc") is the classic known-answer vector.
        assert_eq!(topic_hash("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(topic_hash("m1").len(), 40);
        assert_ne!(topic_hash("m1"), topic_hash("m2"));
    }

    #[test]
    fn decode_single_frame_is_payload() {
        let message = ZmqMessage::from(b"cmd".to_vec());
        let payload = decode_frames(Role::Minion, &topic_hash("m1"), &message).unwrap();
        assert_eq!(payload, Some(b"cmd".to_vec()));
    }

    #[test]
    fn decode_two_frames_accepts_broadcast_and_own_hash() {
        let hexid = topic_hash("m1");
        let accepted =
            decode_frames(Role::Minion, &hexid, &two_frame(b"broadcast", b"p")).unwrap();
        assert_eq!(accepted, Some(b"p".to_vec()));
        let accepted =
            decode_frames(Role::Minion, &hexid, &two_frame(hexid.as_bytes(), b"q")).unwrap();
        assert_eq!(accepted, Some(b"q".to_vec()));
    }

    #[test]
    fn decode_two_frames_drops_foreign_topic() {
        let hexid = topic_hash("m1");
        let other = topic_hash("other");
        let dropped =
            decode_frames(Role::Minion, &hexid, &two_frame(other.as_bytes(), b"p")).unwrap();
        assert_eq!(dropped, None);
    }

    #[test]
    fn decode_syndic_accepts_syndic_not_hash() {
        let hexid = topic_hash("syn1");
        let accepted =
            decode_frames(Role::Syndic, &hexid, &two_frame(b"syndic", b"p")).unwrap();
        assert_eq!(accepted, Some(b"p".to_vec()));
        // a syndic ignores identity-hash topics
        let dropped =
            decode_frames(Role::Syndic, &hexid, &two_frame(hexid.as_bytes(), b"p")).unwrap();
        assert_eq!(dropped, None);
    }

    #[test]
    fn decode_rejects_other_frame_counts() {
        let mut message = two_frame(b"broadcast", b"p");
        message.push_back(b"extra".to_vec().into());
        let err = decode_frames(Role::Minion, "", &message).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(3)));
        assert!(err.to_string().contains("(3)"));
    }

    #[tokio::test]
    async fn construction_requires_host_port_xor_path() {
        let opts = TransportOpts::default();
        let err = PublishClient::new(&opts, PublishClientConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));

        let both = PublishClientConfig {
            host: Some("127.0.0.1".into()),
            port: Some(4505),
            path: Some("/tmp/pub.ipc".into()),
        };
        let err = PublishClient::new(&opts, both).await.unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));

        let partial = PublishClientConfig {
            host: Some("127.0.0.1".into()),
            port: None,
            path: None,
        };
        let err = PublishClient::new(&opts, partial).await.unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let opts = TransportOpts::default();
        let client = PublishClient::new(&opts, PublishClientConfig::tcp("127.0.0.1", 15890))
            .await
            .unwrap();
        client.close().await;
        client.close().await;
    }

    #[tokio::test]
    async fn unfiltered_roundtrip_via_connect_uri() {
        let mut publisher = PubSocket::new();
        publisher.bind("tcp://127.0.0.1:15891").await.unwrap();

        let opts: TransportOpts = toml::from_str(r#"id = "m1""#).unwrap();
        let client = PublishClient::new(&opts, PublishClientConfig::tcp("127.0.0.1", 15891))
            .await
            .unwrap();
        client.connect_uri("tcp://127.0.0.1:15891", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        publisher
            .send(ZmqMessage::from(b"hello".to_vec()))
            .await
            .unwrap();

        let message = client
            .recv(Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("publish should arrive");
        assert_eq!(client.decode(&message).unwrap(), Some(b"hello".to_vec()));
        client.close().await;
    }

    #[tokio::test]
    async fn on_recv_delivers_filtered_broadcast() {
        let mut publisher = PubSocket::new();
        publisher.bind("tcp://127.0.0.1:15892").await.unwrap();

        let opts: TransportOpts =
            toml::from_str("id = \"m1\"\nzmq_filtering = true").unwrap();
        let client = PublishClient::new(&opts, PublishClientConfig::tcp("127.0.0.1", 15892))
            .await
            .unwrap();
        client.connect(None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        let callback: PublishCallback = Box::new(move |payload| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(payload);
                Ok(())
            })
        });
        let subscription = client.on_recv(Some(callback)).expect("registration handle");
        tokio::time::sleep(Duration::from_millis(100)).await;

        publisher
            .send(two_frame(b"broadcast", b"cmd"))
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("callback should run")
            .unwrap();
        assert_eq!(delivered, b"cmd".to_vec());

        subscription.cancel();
        client.on_recv(None);
        client.close().await;
    }

    #[tokio::test]
    async fn connect_port_override_is_used() {
        let mut publisher = PubSocket::new();
        publisher.bind("tcp://127.0.0.1:15893").await.unwrap();

        let opts = TransportOpts::default();
        // construction-time port is wrong on purpose
        let client = PublishClient::new(&opts, PublishClientConfig::tcp("127.0.0.1", 1))
            .await
            .unwrap();
        client.connect(Some(15893), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        publisher
            .send(ZmqMessage::from(b"ping".to_vec()))
            .await
            .unwrap();
        let message = client
            .recv(Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("publish should arrive on the overridden port");
        assert_eq!(client.decode(&message).unwrap(), Some(b"ping".to_vec()));
        client.close().await;
    }
}
