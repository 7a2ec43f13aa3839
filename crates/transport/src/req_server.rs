use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, trace, warn};
use zeromq::{DealerSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::config::{IpcMode, TransportOpts};
use crate::error::TransportError;
use crate::monitor::SocketMonitor;
use crate::uri::Target;

/// Interval at which the device and worker loops surface to observe their
/// shutdown flags.
const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Application handler serving decoded requests on a master worker.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send;
    type Reply: Serialize + Send;

    async fn handle(&self, request: Self::Request) -> Self::Reply;
}

/// Reply sent when a request payload does not deserialize. The socket stays
/// up; one bad client must not wedge a worker.
#[derive(Serialize)]
struct BadLoad {
    msg: &'static str,
}

fn bad_load() -> Vec<u8> {
    rmp_serde::to_vec_named(&BadLoad { msg: "bad load" }).expect("static reply must encode")
}

/// The queue device bridging minion request sockets to the worker pool.
///
/// A single socket can only carry one in-flight exchange per peer, so the
/// master fronts N clients with a routing socket and fair-queues their
/// requests onto M workers behind a distributing socket. Frames are copied
/// verbatim in both directions; the routing prefix inserted on the way in is
/// what routes each reply back out.
pub struct RequestBroker {
    opts: TransportOpts,
    shutdown: Arc<AtomicBool>,
}

impl RequestBroker {
    pub fn new(opts: TransportOpts) -> Self {
        Self {
            opts,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal the device loop to exit at its next poll.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Endpoint minion request clients connect to.
    pub fn clients_target(&self) -> Target {
        Target::tcp(self.opts.interface.clone(), self.opts.ret_port)
    }

    /// Endpoint master workers connect to: loopback TCP in `tcp` mode, a
    /// `workers.ipc` socket under `sock_dir` otherwise.
    pub fn workers_target(opts: &TransportOpts) -> Target {
        match opts.ipc_mode {
            IpcMode::Tcp => Target::tcp("127.0.0.1", opts.tcp_master_workers),
            IpcMode::Ipc => Target::ipc(opts.workers_ipc_path()),
        }
    }

    /// Run the device until shutdown. Intended to be the body of a dedicated
    /// broker process; `muster-broker` wraps it with signal handling.
    pub async fn run(&self) -> Result<(), TransportError> {
        lower_niceness(self.opts.mworker_queue_niceness);

        let clients_uri = self.clients_target().uri();
        let workers_target = Self::workers_target(&self.opts);
        workers_target.check_ipc_path_len()?;

        let mut clients = RouterSocket::new();
        if self.opts.ipv6 == Some(true) {
            trace!("client-facing socket will carry IPv6 traffic");
        }
        trace!(backlog = self.opts.zmq_backlog, "router backlog resolved");
        let mut monitor = if self.opts.zmq_monitor {
            debug!("Starting socket monitor");
            let mut monitor = SocketMonitor::attach(&mut clients);
            monitor.start_thread();
            Some(monitor)
        } else {
            None
        };

        info!("Setting up the master communication server");
        info!("Request server clients {clients_uri}");
        clients.bind(&clients_uri).await?;

        workers_target.ensure_ipc_dir()?;
        workers_target.remove_stale_socket()?;
        let mut workers = DealerSocket::new();
        info!("Request server workers {workers_target}");
        workers.bind(&workers_target.uri()).await?;
        apply_ipc_mode(&workers_target)?;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                request = clients.recv() => {
                    let message = request?;
                    if let Err(e) = workers.send(message).await {
                        warn!(error = %e, "dropping request, no worker available");
                    }
                }
                reply = workers.recv() => {
                    let message = reply?;
                    if let Err(e) = clients.send(message).await {
                        warn!(error = %e, "dropping reply for vanished client");
                    }
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }

        if let Some(monitor) = monitor.as_mut() {
            monitor.stop();
        }
        info!("Worker queue is closing");
        Ok(())
    }
}

/// Master-side worker serving the back end of the queue device.
///
/// Owns a socket connected to the broker's worker endpoint and a request
/// loop task. Requests arrive prefixed with the routing envelope the device
/// preserved; the envelope is echoed back ahead of each reply.
pub struct RequestServer {
    opts: TransportOpts,
    shutdown: Arc<AtomicBool>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    closing: AtomicBool,
}

impl RequestServer {
    pub fn new(opts: TransportOpts) -> Self {
        Self {
            opts,
            shutdown: Arc::new(AtomicBool::new(false)),
            tasks: std::sync::Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
        }
    }

    /// Connect a worker socket and schedule its request loop.
    pub async fn post_fork<H: RequestHandler>(
        &self,
        handler: Arc<H>,
    ) -> Result<(), TransportError> {
        let target = RequestBroker::workers_target(&self.opts);
        let mut socket = DealerSocket::new();
        info!("Worker connecting to socket {target}");
        socket.connect(&target.uri()).await?;
        apply_ipc_mode(&target)?;

        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(request_loop(socket, handler, shutdown));
        self.tasks
            .lock()
            .expect("worker task registry poisoned")
            .push(task);
        Ok(())
    }

    /// Idempotent shutdown: flags the loops, cancels outstanding tasks and
    /// releases their sockets.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Request server under PID {} is closing", std::process::id());
        self.shutdown.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().expect("worker task registry poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

async fn request_loop<H: RequestHandler>(
    mut socket: DealerSocket,
    handler: Arc<H>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let message = match tokio::time::timeout(POLL_INTERVAL, socket.recv()).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                debug!(error = %e, "Exception in request handler");
                continue;
            }
            Ok(Ok(message)) => message,
        };

        let frames: Vec<Bytes> = message.iter().cloned().collect();
        // Routing envelope: the identity frame plus any delimiters ahead of
        // the request payload.
        let Some(payload_at) = frames
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, frame)| !frame.is_empty())
            .map(|(at, _)| at)
        else {
            debug!(frame_count = frames.len(), "request without payload frame");
            continue;
        };

        let reply_payload = match rmp_serde::from_slice::<H::Request>(&frames[payload_at]) {
            Ok(request) => match rmp_serde::to_vec(&handler.handle(request).await) {
                Ok(encoded) => encoded,
                Err(e) => {
                    debug!(error = %e, "failed to encode reply");
                    continue;
                }
            },
            Err(_) => bad_load(),
        };

        let mut reply = ZmqMessage::from(frames[0].to_vec());
        for frame in &frames[1..payload_at] {
            reply.push_back(frame.clone());
        }
        reply.push_back(reply_payload.into());
        if let Err(e) = socket.send(reply).await {
            debug!(error = %e, "Exception in request handler");
        }
    }
}

#[cfg(unix)]
fn lower_niceness(niceness: Option<i32>) {
    if let Some(niceness) = niceness {
        info!("setting worker queue niceness to {niceness}");
        unsafe {
            libc::nice(niceness);
        }
    }
}

#[cfg(not(unix))]
fn lower_niceness(_niceness: Option<i32>) {}

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
    use crate::reqrep::RequestClient;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        type Request = String;
        type Reply = String;

        async fn handle(&self, request: String) -> String {
            request
        }
    }

    struct SlowEcho;

    #[async_trait]
    impl RequestHandler for SlowEcho {
        type Request = String;
        type Reply = String;

        async fn handle(&self, request: String) -> String {
            tokio::time::sleep(Duration::from_millis(600)).await;
            request
        }
    }

    fn broker_opts(ret_port: u16, worker_port: u16) -> TransportOpts {
        let mut opts = TransportOpts::default();
        opts.interface = "127.0.0.1".into();
        opts.ret_port = ret_port;
        opts.ipc_mode = IpcMode::Tcp;
        opts.tcp_master_workers = worker_port;
        opts
    }

    fn client_for(ret_port: u16) -> RequestClient {
        let mut opts = TransportOpts::default();
        opts.master_uri = Some(format!("tcp://127.0.0.1:{ret_port}"));
        opts.recon_default = 10;
        opts.recon_max = 10;
        RequestClient::new(&opts).unwrap()
    }

    #[test]
    fn workers_target_by_mode() {
        let mut opts = TransportOpts::default();
        opts.ipc_mode = IpcMode::Tcp;
        opts.tcp_master_workers = 4600;
        assert_eq!(
            RequestBroker::workers_target(&opts).uri(),
            "tcp://127.0.0.1:4600"
        );

        opts.ipc_mode = IpcMode::Ipc;
        opts.sock_dir = "/tmp/muster".into();
        assert_eq!(
            RequestBroker::workers_target(&opts).uri(),
            "ipc:///tmp/muster/workers.ipc"
        );
    }

    #[test]
    fn bad_load_is_a_named_map() {
        // field name must survive encoding so clients see {"msg": "bad load"}
        let encoded = bad_load();
        let decoded: std::collections::HashMap<String, String> =
            rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(decoded["msg"], "bad load");
    }

    #[tokio::test]
    async fn roundtrip_through_device() {
        let opts = broker_opts(15895, 15896);
        let broker = Arc::new(RequestBroker::new(opts.clone()));
        let device = broker.clone();
        tokio::spawn(async move {
            let _ = device.run().await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let server = RequestServer::new(opts);
        server.post_fork(Arc::new(Echo)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = client_for(15895);
        let reply: String = client
            .send(&"ping".to_string(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(reply, "ping");

        client.close().await;
        server.close();
        server.close();
        broker.shutdown();
    }

    #[tokio::test]
    async fn timed_out_request_reconnects_and_succeeds() {
        let opts = broker_opts(15898, 15899);
        let broker = Arc::new(RequestBroker::new(opts.clone()));
        let device = broker.clone();
        tokio::spawn(async move {
            let _ = device.run().await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let server = RequestServer::new(opts);
        server.post_fork(Arc::new(SlowEcho)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = client_for(15898);
        let err = client
            .send::<_, String>(&"first".to_string(), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RequestTimeout(_)));

        let reply: String = client
            .send(&"second".to_string(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(reply, "second");

        client.close().await;
        server.close();
        broker.shutdown();
    }
}
