use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, trace};
use zeromq::{PubSocket, PullSocket, PushSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::config::TransportOpts;
use crate::error::TransportError;
use crate::keepalive::Keepalive;
use crate::monitor::SocketMonitor;
use crate::pubsub::{topic_hash, BROADCAST_TOPIC, SYNDIC_TOPIC};
use crate::uri::Target;

/// Interval at which the daemon loop surfaces to observe its shutdown flag.
const DAEMON_POLL: Duration = Duration::from_millis(300);

/// How long `close` waits for the daemon task to drain before cancelling it.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Where the publisher binds its two sockets.
#[derive(Debug, Clone)]
pub struct PublishServerConfig {
    /// Fan-out socket minions subscribe to.
    pub pub_target: Target,
    /// Ingress queue socket producers push into.
    pub pull_target: Target,
}

impl PublishServerConfig {
    pub fn tcp(host: impl Into<String>, pub_port: u16, pull_port: u16) -> Self {
        let host = host.into();
        Self {
            pub_target: Target::tcp(host.clone(), pub_port),
            pull_target: Target::tcp(host, pull_port),
        }
    }

    /// Conventional IPC layout under `sock_dir`.
    pub fn ipc(opts: &TransportOpts) -> Self {
        Self {
            pub_target: Target::ipc(opts.sock_dir.join("publisher.ipc")),
            pull_target: Target::ipc(opts.sock_dir.join("publish_pull.ipc")),
        }
    }
}

/// Master-side publish channel.
///
/// The application process holds the producer half: a push socket feeding
/// opaque payloads into the ingress queue. The daemon half binds the queue
/// and the fan-out socket and frames payloads for subscriber-side topic
/// filtering. The two halves normally live in different processes
/// (`muster-publisher` runs the daemon); tests run both in one.
pub struct PublishServer {
    opts: TransportOpts,
    config: PublishServerConfig,
    sock: Mutex<Option<PushSocket>>,
    shutdown: Arc<AtomicBool>,
    started_tx: watch::Sender<bool>,
    started_rx: watch::Receiver<bool>,
    daemon: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    closing: AtomicBool,
}

impl std::fmt::Debug for PublishServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishServer")
            .field("opts", &self.opts)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PublishServer {
    pub fn new(
        opts: TransportOpts,
        config: PublishServerConfig,
    ) -> Result<Self, TransportError> {
        config.pub_target.check_ipc_path_len()?;
        config.pull_target.check_ipc_path_len()?;
        let (started_tx, started_rx) = watch::channel(false);
        Ok(Self {
            opts,
            config,
            sock: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            started_tx,
            started_rx,
            daemon: std::sync::Mutex::new(None),
            closing: AtomicBool::new(false),
        })
    }

    /// Transport-level TLS is not supported on this channel.
    pub fn support_ssl() -> bool {
        false
    }

    /// Whether publishes can carry per-minion topics.
    pub fn topic_support(&self) -> bool {
        self.opts.zmq_filtering
    }

    /// Resolves once the daemon has bound both sockets.
    pub async fn wait_started(&self) {
        let mut started = self.started_rx.clone();
        loop {
            let is_started = *started.borrow_and_update();
            if is_started || started.changed().await.is_err() {
                return;
            }
        }
    }

    /// Bind the daemon sockets and run the ingress loop on a task.
    pub async fn spawn_daemon(&self) -> Result<(), TransportError> {
        let mut daemon = PublishDaemon::bind(&self.opts, self.config.clone()).await?;
        let _ = self.started_tx.send(true);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = daemon.run(shutdown).await {
                error!(error = %e, "publish daemon exited with error");
            }
            daemon.close();
        });
        *self.daemon.lock().expect("daemon handle poisoned") = Some(handle);
        Ok(())
    }

    /// Hand an opaque payload to the publisher daemon. Connects the push
    /// socket on first use. No reply; ordering across producers is
    /// unspecified.
    pub async fn publish(&self, payload: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.sock.lock().await;
        if guard.is_none() {
            debug!("Connecting to pub server: {}", self.config.pull_target);
            let mut sock = PushSocket::new();
            sock.connect(&self.config.pull_target.uri()).await?;
            *guard = Some(sock);
        }
        if let Some(sock) = guard.as_mut() {
            sock.send(ZmqMessage::from(payload.to_vec())).await?;
        }
        Ok(())
    }

    /// Idempotent shutdown of both halves.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sock.lock().await.take();
        self.shutdown.store(true, Ordering::SeqCst);
        let handle = self.daemon.lock().expect("daemon handle poisoned").take();
        if let Some(mut handle) = handle {
            // give the loop one poll interval to drain, then cancel
            if tokio::time::timeout(CLOSE_LINGER, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}

/// Daemon half: pulls opaque payloads from the ingress queue and fans them
/// out, framed for topic filtering when enabled.
pub struct PublishDaemon {
    filtering: bool,
    order_masters: bool,
    pub_uri: String,
    pull_sock: PullSocket,
    pub_sock: PubSocket,
    monitor: Option<SocketMonitor>,
}

impl PublishDaemon {
    /// Bind the fan-out and ingress sockets. IPC paths are created under a
    /// restrictive umask, then opened up to their configured modes.
    pub async fn bind(
        opts: &TransportOpts,
        config: PublishServerConfig,
    ) -> Result<Self, TransportError> {
        let pub_uri = config.pub_target.uri();
        let pull_uri = config.pull_target.uri();
        config.pub_target.check_ipc_path_len()?;
        config.pull_target.check_ipc_path_len()?;
        config.pub_target.ensure_ipc_dir()?;
        config.pull_target.ensure_ipc_dir()?;
        config.pub_target.remove_stale_socket()?;
        config.pull_target.remove_stale_socket()?;

        let mut pub_sock = PubSocket::new();
        let monitor = if opts.zmq_monitor {
            let mut monitor = SocketMonitor::attach(&mut pub_sock);
            monitor.start();
            Some(monitor)
        } else {
            None
        };
        Keepalive::from_opts(opts).apply(&mut pub_sock);
        trace!(
            hwm = opts.pub_hwm,
            backlog = opts.zmq_backlog,
            ipv6 = opts.ipv6.unwrap_or(false),
            "fan-out socket tuning resolved"
        );

        let mut pull_sock = PullSocket::new();
        {
            #[cfg(unix)]
            let _umask = UmaskGuard::set(0o177);
            info!("Starting the publisher on {pub_uri}");
            pub_sock.bind(&pub_uri).await?;
            apply_ipc_mode(&config.pub_target)?;
            info!("Starting the puller on {pull_uri}");
            pull_sock.bind(&pull_uri).await?;
            apply_ipc_mode(&config.pull_target)?;
        }

        Ok(Self {
            filtering: opts.zmq_filtering,
            order_masters: opts.order_masters,
            pub_uri,
            pull_sock,
            pub_sock,
            monitor,
        })
    }

    /// Ingress loop: forward each pulled payload to the fan-out socket
    /// until the shutdown flag is observed. Send failures are logged and
    /// the loop continues.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<(), TransportError> {
        while !shutdown.load(Ordering::SeqCst) {
            let payload = match tokio::time::timeout(DAEMON_POLL, self.pull_sock.recv()).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    error!(error = %e, "Exception in publisher ingress");
                    continue;
                }
                Ok(Ok(message)) => match message.get(0) {
                    Some(frame) => frame.to_vec(),
                    None => continue,
                },
            };
            if let Err(e) = self.publish_payload(&payload, None).await {
                error!(error = %e, "Exception in publisher {}", self.pub_uri);
            }
        }
        Ok(())
    }

    /// Fan a payload out, framing it for subscriber-side filtering.
    ///
    /// With filtering off the payload goes out as a single frame. With
    /// filtering on, an explicit topic list produces one hashed-topic
    /// message per entry (plus a `syndic` copy when ordering masters);
    /// without a list the payload is broadcast.
    pub async fn publish_payload(
        &mut self,
        payload: &[u8],
        topic_list: Option<&[String]>,
    ) -> Result<(), TransportError> {
        if self.filtering {
            if let Some(topics) = topic_list {
                for topic in topics {
                    trace!("Sending filtered data over publisher {}", self.pub_uri);
                    // filters are prefix matches, hash the topic to avoid
                    // one minion id matching another's
                    let htopic = topic_hash(topic);
                    self.send_frames(htopic.into_bytes(), payload).await?;
                }
                if self.order_masters {
                    trace!("Sending filtered data to syndics");
                    self.send_frames(SYNDIC_TOPIC.to_vec(), payload).await?;
                }
            } else {
                trace!("Sending broadcast data over publisher {}", self.pub_uri);
                self.send_frames(BROADCAST_TOPIC.to_vec(), payload).await?;
            }
        } else {
            trace!("Sending unfiltered data over publisher {}", self.pub_uri);
            self.pub_sock
                .send(ZmqMessage::from(payload.to_vec()))
                .await?;
        }
        Ok(())
    }

    async fn send_frames(&mut self, topic: Vec<u8>, payload: &[u8]) -> Result<(), TransportError> {
        let mut message = ZmqMessage::from(topic);
        message.push_back(payload.to_vec().into());
        self.pub_sock.send(message).await?;
        Ok(())
    }

    /// Stop the monitor; the sockets close when the daemon is dropped.
    pub fn close(&mut self) {
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.stop();
        }
    }
}

#[cfg(unix)]
struct UmaskGuard {
    prev: libc::mode_t,
}

#[cfg(unix)]
impl UmaskGuard {
    fn set(mask: libc::mode_t) -> Self {
        Self {
            prev: unsafe { libc::umask(mask) },
        }
    }
}

#[cfg(unix)]
impl Drop for UmaskGuard {
    fn drop(&mut self) {
        unsafe {
            libc::umask(self.prev);
        }
    }
}

#[cfg(unix)]
fn apply_ipc_mode(target: &Target) -> Result<(), TransportError> {
    use std::os::unix::fs::PermissionsExt;
    if let Target::Ipc { path, mode } = target {
        if path.exists() {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(*mode))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_ipc_mode(_target: &Target) -> Result<(), TransportError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{PublishClient, PublishClientConfig};

    fn sub_opts(id: &str, filtering: bool) -> TransportOpts {
        let mut opts = TransportOpts::default();
        opts.id = id.into();
        opts.zmq_filtering = filtering;
        opts
    }

    async fn recv_payload(client: &PublishClient) -> Option<Vec<u8>> {
        let message = client.recv(Some(Duration::from_secs(2))).await.unwrap()?;
        client.decode(&message).unwrap()
    }

    #[test]
    fn ssl_is_not_supported() {
        assert!(!PublishServer::support_ssl());
    }

    #[test]
    fn topic_support_follows_filtering() {
        let config = PublishServerConfig::tcp("127.0.0.1", 1, 2);
        let server = PublishServer::new(sub_opts("", false), config.clone()).unwrap();
        assert!(!server.topic_support());
        let server = PublishServer::new(sub_opts("", true), config).unwrap();
        assert!(server.topic_support());
    }

    #[test]
    fn rejects_overlong_ipc_paths() {
        let mut opts = TransportOpts::default();
        opts.sock_dir = ("/tmp/".to_string() + &"m".repeat(120)).into();
        let err = PublishServer::new(opts.clone(), PublishServerConfig::ipc(&opts)).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[tokio::test]
    async fn unfiltered_pubsub_end_to_end_over_ipc() {
        let mut opts = TransportOpts::default();
        opts.sock_dir = "/tmp/muster-test-unfiltered".into();
        let config = PublishServerConfig::ipc(&opts);
        let pub_path = config.pub_target.ipc_path().unwrap().to_path_buf();

        let server = PublishServer::new(opts.clone(), config).unwrap();
        server.spawn_daemon().await.unwrap();
        server.wait_started().await;

        let client = PublishClient::new(&sub_opts("m1", false), PublishClientConfig::ipc(&pub_path))
            .await
            .unwrap();
        client.connect(None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        server.publish(b"hello").await.unwrap();

        assert_eq!(recv_payload(&client).await, Some(b"hello".to_vec()));
        client.close().await;
        server.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn filtered_broadcast_reaches_everyone() {
        let mut opts = TransportOpts::default();
        opts.zmq_filtering = true;
        let config = PublishServerConfig::tcp("127.0.0.1", 15900, 15901);

        let server = PublishServer::new(opts, config).unwrap();
        server.spawn_daemon().await.unwrap();
        server.wait_started().await;

        let target = PublishClient::new(
            &sub_opts("m1", true),
            PublishClientConfig::tcp("127.0.0.1", 15900),
        )
        .await
        .unwrap();
        target.connect(None, None).await.unwrap();
        let eavesdropper = PublishClient::new(
            &sub_opts("unrelated", true),
            PublishClientConfig::tcp("127.0.0.1", 15900),
        )
        .await
        .unwrap();
        eavesdropper.connect(None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        server.publish(b"cmd").await.unwrap();

        assert_eq!(recv_payload(&target).await, Some(b"cmd".to_vec()));
        assert_eq!(recv_payload(&eavesdropper).await, Some(b"cmd".to_vec()));
        target.close().await;
        eavesdropper.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn filtered_targeting_hits_only_the_named_minion() {
        let mut opts = TransportOpts::default();
        opts.zmq_filtering = true;
        let config = PublishServerConfig::tcp("127.0.0.1", 15902, 15903);
        let mut daemon = PublishDaemon::bind(&opts, config).await.unwrap();

        let client = PublishClient::new(
            &sub_opts("m1", true),
            PublishClientConfig::tcp("127.0.0.1", 15902),
        )
        .await
        .unwrap();
        client.connect(None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        daemon
            .publish_payload(b"targeted", Some(&["m1".to_string()]))
            .await
            .unwrap();
        assert_eq!(recv_payload(&client).await, Some(b"targeted".to_vec()));

        daemon
            .publish_payload(b"not-ours", Some(&["other".to_string()]))
            .await
            .unwrap();
        let silent = client.recv(Some(Duration::from_millis(300))).await.unwrap();
        assert!(silent.is_none(), "foreign topic must be filtered out");

        client.close().await;
        daemon.close();
    }

    #[tokio::test]
    async fn syndic_copy_accompanies_targeted_publishes() {
        let mut opts = TransportOpts::default();
        opts.zmq_filtering = true;
        opts.order_masters = true;
        let config = PublishServerConfig::tcp("127.0.0.1", 15904, 15905);
        let mut daemon = PublishDaemon::bind(&opts, config).await.unwrap();

        let syndic_opts: TransportOpts = toml::from_str(
            r#"
            id = "syn1"
            __role = "syndic"
            zmq_filtering = true
            "#,
        )
        .unwrap();
        let syndic = PublishClient::new(
            &syndic_opts,
            PublishClientConfig::tcp("127.0.0.1", 15904),
        )
        .await
        .unwrap();
        syndic.connect(None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        daemon
            .publish_payload(b"orders", Some(&["m1".to_string()]))
            .await
            .unwrap();

        // the syndic sees the syndic-topic copy, not the hashed one
        assert_eq!(recv_payload(&syndic).await, Some(b"orders".to_vec()));
        syndic.close().await;
        daemon.close();
    }
}
