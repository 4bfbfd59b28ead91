//! code-sandbox daemon
//!
//! HTTP server that runs untrusted python snippets in hardened Docker
//! containers behind a bounded job queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use code_sandbox_daemon::backend::{DockerRuntime, SandboxProfile};
use code_sandbox_daemon::config::{Config, CONFIG_PATH_ENV};
use code_sandbox_daemon::gateway;
use code_sandbox_daemon::queue::{JobQueue, QueueSettings};
use code_sandbox_daemon::runner::SandboxRunner;

#[derive(Parser, Debug)]
#[command(name = "code-sandbox-daemon")]
#[command(about = "HTTP service for sandboxed code execution")]
struct Args {
    /// JSON config file
    #[arg(long, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    info!(
        bind = %config.server.bind,
        image = %config.sandbox.image,
        workers = config.queue.workers,
        capacity = config.queue.capacity,
        "Loaded configuration"
    );

    let runtime = DockerRuntime::connect()
        .await
        .context("Failed to reach the Docker daemon")?;
    if config.sandbox.pull_on_start {
        runtime
            .ensure_image(&config.sandbox.image)
            .await
            .with_context(|| format!("Failed to prepare image {}", config.sandbox.image))?;
    }

    let runner = SandboxRunner::new(
        Arc::new(runtime),
        SandboxProfile::hardened(config.sandbox.image.clone()),
    );
    let queue = Arc::new(JobQueue::new(
        runner,
        QueueSettings::from_config(&config.queue),
        config.reporting.clone(),
    ));
    queue.start();

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(addr = %listener.local_addr()?, "Listening");

    axum::serve(listener, gateway::router(queue))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
