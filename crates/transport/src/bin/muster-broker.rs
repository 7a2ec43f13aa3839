//! muster-broker — the master's request queue device.
//!
//! Binds the client-facing routing socket and the worker-facing
//! distributing socket, then copies frames between them until SIGINT or
//! SIGTERM. Master worker processes connect to the back side and serve the
//! requests this device fair-queues to them.
//!
//! # Usage
//!
//! ```bash
//! # defaults (binds tcp://0.0.0.0:4506, workers on ipc under /tmp/muster)
//! muster-broker
//!
//! # explicit interface and config file
//! muster-broker --config /etc/muster/transport.toml --interface 10.0.0.1
//!
//! # via environment
//! MUSTER_RET_PORT=4606 muster-broker
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use muster_transport::{RequestBroker, TransportOpts};

/// Request queue device for the muster master.
#[derive(Parser, Debug)]
#[command(name = "muster-broker", version, about)]
struct Cli {
    /// Path to the transport configuration file (TOML).
    #[arg(long, env = "MUSTER_CONFIG")]
    config: Option<PathBuf>,

    /// Interface the client-facing socket binds on.
    #[arg(long, env = "MUSTER_INTERFACE")]
    interface: Option<String>,

    /// Port the client-facing socket binds on.
    #[arg(long, env = "MUSTER_RET_PORT")]
    ret_port: Option<u16>,

    /// Directory for IPC sockets.
    #[arg(long, env = "MUSTER_SOCK_DIR")]
    sock_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting muster-broker");

    let mut opts = match &cli.config {
        Some(path) => TransportOpts::load(path)?,
        None => TransportOpts::default(),
    };
    if let Some(interface) = cli.interface {
        opts.interface = interface;
    }
    if let Some(ret_port) = cli.ret_port {
        opts.ret_port = ret_port;
    }
    if let Some(sock_dir) = cli.sock_dir {
        opts.sock_dir = sock_dir;
    }
    opts.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(opts.worker_threads)
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let broker = Arc::new(RequestBroker::new(opts));

        let broker_for_signal = broker.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            broker_for_signal.shutdown();
        });

        broker.run().await
    })?;

    tracing::info!("muster-broker exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}
