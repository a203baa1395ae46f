//! TDM Daemon - node broker for Thymio robots
//!
//! Aggregates robot nodes discovered by the node backend and republishes
//! them to client applications over framed TCP and WebSocket.
//!
//! # Usage
//!
//! ```bash
//! # Start with two simulated nodes on the default ports
//! tdmd
//!
//! # Custom listen addresses
//! tdmd --tcp-listen 127.0.0.1:8596 --ws-listen 127.0.0.1:8597
//!
//! # Accept remote clients presenting this token
//! tdmd --token s3cret
//!
//! # Enable debug logging
//! RUST_LOG=tdmd=debug tdmd
//! ```
//!
//! # Signal Handling
//!
//! SIGTERM/SIGINT trigger a graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tdmd::backend::{SimulatedBackend, BACKEND_EVENT_BUFFER};
use tdmd::compiler::SimulatedCompiler;
use tdmd::registry::spawn_registry;
use tdmd::server::BrokerServer;
use tdmd::token::TokenManager;

/// Thymio Device Manager daemon
#[derive(Parser, Debug)]
#[command(name = "tdmd", version, about)]
struct Args {
    /// Listen address of the raw framed TCP listener
    #[arg(long, default_value = "127.0.0.1:8596")]
    tcp_listen: SocketAddr,

    /// Listen address of the WebSocket listener
    #[arg(long, default_value = "127.0.0.1:8597")]
    ws_listen: SocketAddr,

    /// Number of simulated nodes to expose
    #[arg(long, default_value_t = 2)]
    simulate: usize,

    /// Access token accepted from non-local clients (repeatable).
    /// Without one, a fresh token is generated and logged at startup.
    #[arg(long = "token")]
    tokens: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tdmd=info".parse()?)
                .add_directive("tdm_core=info".parse()?)
                .add_directive("tdm_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "thymio device manager starting"
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "error waiting for shutdown signal");
        }
        info!("shutdown signal received");
        shutdown_token.cancel();
    });

    // Node backend and registry. The hardware backends live outside
    // this crate; the daemon ships with the simulated one.
    let (backend_tx, backend_rx) = mpsc::channel(BACKEND_EVENT_BUFFER);
    let backend = SimulatedBackend::new(backend_tx);
    let registry = spawn_registry(
        Arc::new(backend.clone()),
        Arc::new(SimulatedCompiler),
        backend_rx,
    );
    info!("node registry started");

    for i in 0..args.simulate {
        backend.spawn_node(format!("thymio-sim-{i}"), true).await;
    }
    if args.simulate > 0 {
        info!(nodes = args.simulate, "simulated nodes ready");
    }

    // Access tokens for non-local clients.
    let tokens = Arc::new(TokenManager::new());
    if args.tokens.is_empty() {
        let token = tokens.generate();
        info!(token = %String::from_utf8_lossy(&token), "generated access token");
    } else {
        for token in args.tokens {
            tokens.insert(token.into_bytes());
        }
    }

    let server = BrokerServer::bind(
        args.tcp_listen,
        args.ws_listen,
        registry,
        tokens,
        cancel_token,
    )
    .await?;

    if let Err(e) = server.run().await {
        error!(error = %e, "server error");
        return Err(e.into());
    }

    info!("thymio device manager stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received ctrl-c");
    }

    Ok(())
}
