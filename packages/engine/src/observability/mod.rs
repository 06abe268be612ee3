// packages/engine/src/observability/mod.rs
//! Tracing and metrics initialisation
//!
//! Metric names emitted by the runtime:
//!
//! | Metric | Type |
//! |--------|------|
//! | `solver_sessions_created_total` | Counter |
//! | `solver_sessions_reused_total` | Counter |
//! | `solver_sessions_destroyed_total` | Counter (`reason`) |
//! | `solver_session_handoffs_total` | Counter |
//! | `solver_pool_timeouts_total` | Counter |
//! | `solver_pool_used` / `solver_pool_available` / `solver_pool_waiting` | Gauge |
//! | `solver_tasks_admitted_total` / `solver_tasks_rejected_total` | Counter |
//! | `solver_tasks_failed_total` | Counter (`kind`) |
//! | `solver_tasks_active` | Gauge |
//! | `solver_engine_launches_total` / `solver_engine_launch_failures_total` | Counter |
//! | `solver_engine_disconnects_total` | Counter |
//! | `solver_memory_process_bytes` / `solver_memory_pressure_level` | Gauge |

use crate::utils::config::{LogFormat, ObservabilitySection};
use crate::utils::errors::{EngineError, Result};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber
pub fn init_tracing(config: &ObservabilitySection) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| EngineError::InvalidConfig(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.log_format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
    };

    installed.map_err(|e| EngineError::InvalidConfig(format!("Tracing already initialised: {}", e)))
}

/// Install the Prometheus exporter when a listen address is configured
pub fn init_metrics(config: &ObservabilitySection) -> Result<()> {
    let Some(addr) = config.metrics_addr.as_deref() else {
        info!("Metrics exporter disabled");
        return Ok(());
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| EngineError::InvalidConfig(format!("Invalid metrics address '{}': {}", addr, e)))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::InvalidConfig(format!("Failed to install metrics exporter: {}", e)))?;

    info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}
