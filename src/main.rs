//! toolbridge - HTTP endpoint in front of a stdio JSON-RPC tool worker.
//!
//! Starts the worker, then serves `POST /mcp` and `GET /health` until
//! Ctrl-C.

use std::net::TcpListener;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use toolbridge::bridge;
use toolbridge::config::BridgeConfig;
use toolbridge::ipc::RpcChannel;
use toolbridge::supervisor::spawn_worker;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout stays free.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "toolbridge=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = BridgeConfig::from_env()?;
    info!("Starting toolbridge v{}", env!("CARGO_PKG_VERSION"));

    let (channel, worker) = match spawn_worker(&config.worker, config.channel.clone()) {
        Ok((channel, worker)) => (channel, Some(worker)),
        Err(e) => {
            error!("Worker unavailable: {:#}", e);
            warn!("Serving without a worker; requests will fail until restart");
            (RpcChannel::detached(config.channel.clone()), None)
        }
    };

    let listener = TcpListener::bind(config.addr)
        .with_context(|| format!("Failed to bind {}", config.addr))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
    };

    let served = bridge::serve(listener, channel, shutdown).await;

    if let Some(worker) = worker {
        if let Some(status) = worker.shutdown().await {
            info!("Worker exited with {}", status);
        }
    }

    served
}
