//! sandprof-daemon - HTTP profiling service
//!
//! Accepts `POST /profile` with a snippet of Python, runs it under the
//! sandbox with profiling enabled, and returns output, the ranked profile
//! and peak memory. Concurrency is bounded by a fixed number of slots.

use anyhow::Result;
use futures::stream::StreamExt;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod pool;
mod server;

use config::DaemonConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sandprof=info".parse()?))
        .init();

    tracing::info!("sandprof-daemon starting");

    let config = DaemonConfig::from_env()?;
    tracing::info!(
        listen = %config.listen,
        max_concurrent = config.max_concurrent,
        timeout_ms = config.sandbox.timeout.as_millis(),
        memory_bytes = config.sandbox.limits.address_space_bytes,
        python = %config.sandbox.python_path.display(),
        "configuration loaded"
    );

    let pool = Arc::new(pool::ExecutorPool::new(&config)?);
    let router = server::router(pool, config.max_body_bytes);

    let listener = TcpListener::bind(config.listen).await?;
    tracing::info!(addr = %config.listen, "listening");

    let signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();
    server::run(listener, router, shutdown(signals)).await?;
    handle.close();

    tracing::info!("sandprof-daemon stopped");
    Ok(())
}

async fn shutdown(mut signals: Signals) {
    if let Some(signal) = signals.next().await {
        tracing::info!(signal, "shutdown requested, draining in-flight runs");
    }
}
