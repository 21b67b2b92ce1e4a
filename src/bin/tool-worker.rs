//! tool-worker - JSON-RPC tool server on stdin/stdout.
//!
//! Speaks Content-Length framed JSON-RPC. Exits when stdin closes.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use toolbridge::config::WorkerConfig;
use toolbridge::tools::ToolBox;
use toolbridge::worker::{self, Worker};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol, so logs must go to stderr.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tool_worker=info,toolbridge=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = WorkerConfig::from_env()?;
    if config.weather_api_key.is_none() {
        info!("WEATHER_API_KEY is not set; getWeather will report an error");
    }

    let tools = ToolBox::new(config).context("Failed to initialize tools")?;
    let worker = Arc::new(Worker::new(tools));

    info!("Tool worker ready");
    worker::serve(tokio::io::stdin(), tokio::io::stdout(), worker)
        .await
        .context("Failed to read requests from stdin")?;
    info!("stdin closed, exiting");

    Ok(())
}
