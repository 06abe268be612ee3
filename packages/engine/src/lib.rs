// packages/engine/src/lib.rs
//! Solver Engine Library
//!
//! This library provides the resource core behind browser-driven solving:
//! a pool of reusable engine sessions, a supervisor that keeps the engine
//! alive, and governors for task concurrency and process memory.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **runtime**: Engine supervision, session pooling, admission, memory pressure
//! - **observability**: Metrics, tracing, and logging
//! - **utils**: Configuration and errors
//!
//! # Example
//!
//! ```no_run
//! use futures::FutureExt;
//! use solver_engine::{EngineConfig, SolverRuntime};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> solver_engine::Result<()> {
//! let runtime = SolverRuntime::from_config(EngineConfig::load()?)?;
//! runtime.start();
//! runtime.wait_ready(Duration::from_secs(120)).await;
//!
//! let handle = runtime
//!     .run(&CancellationToken::new(), |session| {
//!         let handle = session.handle().to_string();
//!         async move { Ok(handle) }.boxed()
//!     })
//!     .await?;
//! # let _ = handle;
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Public module exports
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use runtime::service::{RuntimeStats, SolverRuntime};
pub use runtime::session::WorkerSession;
pub use runtime::session_pool::{PoolConfig, SessionPool};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(!info.git_hash.is_empty());
    }
}
