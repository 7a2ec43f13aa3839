//! muster-publisher — the master's publish fan-out daemon.
//!
//! Binds the ingress queue socket the application pushes payloads into and
//! the fan-out socket minions subscribe to, then forwards payloads (framed
//! for topic filtering when enabled) until SIGINT or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # local IPC sockets under the configured sock_dir (default)
//! muster-publisher
//!
//! # TCP fan-out for a distributed deployment
//! muster-publisher --transport tcp --host 0.0.0.0 --pub-port 4505 --pull-port 4510
//! ```

use std::path::PathBuf;

use clap::Parser;
use muster_transport::{PublishServer, PublishServerConfig, TransportOpts};

/// Publish fan-out daemon for the muster master.
#[derive(Parser, Debug)]
#[command(name = "muster-publisher", version, about)]
struct Cli {
    /// Path to the transport configuration file (TOML).
    #[arg(long, env = "MUSTER_CONFIG")]
    config: Option<PathBuf>,

    /// Transport type: "ipc" or "tcp".
    #[arg(long, env = "MUSTER_PUB_TRANSPORT", default_value = "ipc")]
    transport: String,

    /// Host to bind to (only used with --transport tcp).
    #[arg(long, env = "MUSTER_PUB_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Fan-out port minions subscribe to (only used with --transport tcp).
    #[arg(long, env = "MUSTER_PUB_PORT", default_value_t = 4505)]
    pub_port: u16,

    /// Ingress port producers push into (only used with --transport tcp).
    #[arg(long, env = "MUSTER_PULL_PORT", default_value_t = 4510)]
    pull_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let opts = match &cli.config {
        Some(path) => TransportOpts::load(path)?,
        None => TransportOpts::default(),
    };

    tracing::info!(?cli, "starting muster-publisher");

    let config = match cli.transport.as_str() {
        "tcp" => PublishServerConfig::tcp(cli.host, cli.pub_port, cli.pull_port),
        _ => PublishServerConfig::ipc(&opts),
    };
    let server = PublishServer::new(opts, config)?;
    server.spawn_daemon().await?;
    server.wait_started().await;
    tracing::info!("publisher daemon started");

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    server.close().await;

    tracing::info!("muster-publisher exited cleanly");
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
