// packages/engine/src/main.rs
//! Solver Engine
//!
//! Runs the session runtime as a daemon: keeps the browser alive, holds the
//! session pool warm, and logs a status snapshot until told to stop.

use anyhow::{Context, Result};
use solver_engine::observability::{init_metrics, init_tracing};
use solver_engine::utils::config::EngineConfig;
use solver_engine::{BuildInfo, SolverRuntime};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::load().context("loading configuration")?;

    // Initialize observability (tracing, metrics, logging)
    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    let build = BuildInfo::current();
    info!(
        version = build.version,
        git_hash = build.git_hash,
        "Starting Solver Engine"
    );
    info!(?config, "Configuration loaded");

    let status_interval = Duration::from_millis(config.observability.status_interval_ms.max(1));
    let launch_timeout = Duration::from_millis(config.engine.launch_timeout_ms);

    let runtime = SolverRuntime::from_config(config)?;
    runtime.start();

    if runtime.wait_ready(launch_timeout).await {
        info!("Engine ready");
    } else {
        warn!("Engine not ready yet, the supervisor keeps retrying");
    }

    let status = tokio::spawn(log_status(Arc::clone(&runtime), status_interval));

    shutdown_signal().await;
    info!("Received shutdown signal, cleaning up...");

    status.abort();
    runtime.shutdown().await;

    info!("Solver Engine stopped gracefully");
    Ok(())
}

/// Periodic status snapshot
async fn log_status(runtime: Arc<SolverRuntime>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;

    loop {
        interval.tick().await;
        match serde_json::to_string(&runtime.stats()) {
            Ok(snapshot) => info!(status = %snapshot, "Runtime status"),
            Err(e) => warn!(error = %e, "Failed to serialise runtime status"),
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
