use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::channel::mpsc;
use futures::StreamExt;
use tracing::{debug, trace};
use zeromq::{Socket, SocketEvent};

/// Wire-compatible lifecycle event codes, as published by libzmq's
/// `zmq_socket_monitor`. The pure-Rust backend reports events as an enum;
/// they are mapped onto these codes so operators see familiar numbers.
pub mod events {
    pub const EVENT_CONNECTED: u16 = 0x0001;
    pub const EVENT_CONNECT_DELAYED: u16 = 0x0002;
    pub const EVENT_CONNECT_RETRIED: u16 = 0x0004;
    pub const EVENT_LISTENING: u16 = 0x0008;
    pub const EVENT_BIND_FAILED: u16 = 0x0010;
    pub const EVENT_ACCEPTED: u16 = 0x0020;
    pub const EVENT_ACCEPT_FAILED: u16 = 0x0040;
    pub const EVENT_CLOSED: u16 = 0x0080;
    pub const EVENT_CLOSE_FAILED: u16 = 0x0100;
    pub const EVENT_DISCONNECTED: u16 = 0x0200;
    pub const EVENT_MONITOR_STOPPED: u16 = 0x0400;
}

/// Code → symbolic name table, built once on first use.
fn event_table() -> &'static HashMap<u16, &'static str> {
    static TABLE: OnceLock<HashMap<u16, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use events::*;
        HashMap::from([
            (EVENT_CONNECTED, "EVENT_CONNECTED"),
            (EVENT_CONNECT_DELAYED, "EVENT_CONNECT_DELAYED"),
            (EVENT_CONNECT_RETRIED, "EVENT_CONNECT_RETRIED"),
            (EVENT_LISTENING, "EVENT_LISTENING"),
            (EVENT_BIND_FAILED, "EVENT_BIND_FAILED"),
            (EVENT_ACCEPTED, "EVENT_ACCEPTED"),
            (EVENT_ACCEPT_FAILED, "EVENT_ACCEPT_FAILED"),
            (EVENT_CLOSED, "EVENT_CLOSED"),
            (EVENT_CLOSE_FAILED, "EVENT_CLOSE_FAILED"),
            (EVENT_DISCONNECTED, "EVENT_DISCONNECTED"),
            (EVENT_MONITOR_STOPPED, "EVENT_MONITOR_STOPPED"),
        ])
    })
}

/// Symbolic name for an event code; unknown codes format as `UNKNOWN(code)`.
pub fn event_description(code: u16) -> String {
    event_table()
        .get(&code)
        .map(|name| (*name).to_string())
        .unwrap_or_else(|| format!("UNKNOWN({code})"))
}

/// Map a backend event to its code. The variant set differs between backend
/// versions, so match on the variant name instead of exhaustive patterns and
/// let anything unexpected fall through to 0 (rendered `UNKNOWN(0)`).
fn event_code(event: &SocketEvent) -> u16 {
    let rendered = format!("{event:?}");
    let variant = rendered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .next()
        .unwrap_or("");
    use events::*;
    match variant {
        "Connected" => EVENT_CONNECTED,
        "ConnectDelayed" => EVENT_CONNECT_DELAYED,
        "ConnectRetried" => EVENT_CONNECT_RETRIED,
        "Listening" => EVENT_LISTENING,
        "BindFailed" => EVENT_BIND_FAILED,
        "Accepted" => EVENT_ACCEPTED,
        "AcceptFailed" => EVENT_ACCEPT_FAILED,
        "Closed" => EVENT_CLOSED,
        "CloseFailed" => EVENT_CLOSE_FAILED,
        "Disconnected" => EVENT_DISCONNECTED,
        "MonitorStopped" => EVENT_MONITOR_STOPPED,
        _ => 0,
    }
}

/// Observes a socket's lifecycle events and logs them at debug.
///
/// Attach before connecting so the initial connection events are captured.
/// The monitor stops itself when the terminal `EVENT_MONITOR_STOPPED`
/// arrives or when the parent socket goes away.
pub struct SocketMonitor {
    events: Option<mpsc::Receiver<SocketEvent>>,
    running: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SocketMonitor {
    /// Obtain the event stream of `socket` without starting consumption.
    pub fn attach<S: Socket>(socket: &mut S) -> Self {
        Self {
            events: Some(socket.monitor()),
            running: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Consume events on a runtime task. Used by the async clients.
    pub fn start(&mut self) {
        let Some(events) = self.events.take() else {
            return;
        };
        trace!("Event monitor start!");
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        self.task = Some(tokio::spawn(async move {
            consume(events, running).await;
        }));
    }

    /// Consume events on a dedicated thread. Used inside the broker process,
    /// which runs its device loop rather than scheduling monitor work.
    pub fn start_thread(&mut self) {
        let Some(events) = self.events.take() else {
            return;
        };
        trace!("Event monitor start!");
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        std::thread::spawn(move || {
            futures::executor::block_on(consume(events, running));
        });
    }

    /// Stop consuming. Idempotent; a second call is a no-op.
    pub fn stop(&mut self) {
        self.events = None;
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        trace!("Event monitor done!");
    }
}

impl Drop for SocketMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn consume(mut events: mpsc::Receiver<SocketEvent>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match events.next().await {
            Some(event) => {
                let code = event_code(&event);
                debug!(
                    code,
                    description = %event_description(code),
                    event = ?event,
                    "socket event"
                );
                if code == events::EVENT_MONITOR_STOPPED {
                    running.store(false, Ordering::SeqCst);
                }
            }
            // Stream end means the parent socket is gone; during shutdown
            // this is the expected way out.
            None => break,
        }
    }
}
