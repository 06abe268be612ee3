// packages/engine/src/utils/errors.rs
//! Error types for the solver engine
//!
//! Errors fall into two groups:
//!
//! - **Caller-visible**: `AdmissionRejected`, `PoolTimeout`, `EngineUnavailable`
//!   (plus `HandoffFailed`, `Cancelled`, `TaskTimeout`). Task handlers turn
//!   these into a "try again later" response.
//! - **Contained**: `SessionCorrupted`, `EngineCrashed`. These never leave the
//!   pool or supervisor; they are logged and handled by destroying the session
//!   or relaunching the engine.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the session pool, supervisor and governors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Admission rejected: {active}/{max} tasks in flight")]
    AdmissionRejected { active: usize, max: usize },

    #[error("Session pool timeout after {0:?}")]
    PoolTimeout(Duration),

    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Session corrupted: {0}")]
    SessionCorrupted(String),

    #[error("Engine crashed: {0}")]
    EngineCrashed(String),

    #[error("Session hand-off failed, retry acquire")]
    HandoffFailed,

    #[error("Session acquire cancelled")]
    Cancelled,

    #[error("Task timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("Process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("Engine launch failed: {0}")]
    LaunchFailed(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Memory sampling failed: {0}")]
    Sampling(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the caller should surface a "try again later" failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::AdmissionRejected { .. }
                | EngineError::PoolTimeout(_)
                | EngineError::EngineUnavailable(_)
                | EngineError::HandoffFailed
        )
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::AdmissionRejected { .. } => "admission_rejected",
            EngineError::PoolTimeout(_) => "pool_timeout",
            EngineError::EngineUnavailable(_) => "engine_unavailable",
            EngineError::SessionCorrupted(_) => "session_corrupted",
            EngineError::EngineCrashed(_) => "engine_crashed",
            EngineError::HandoffFailed => "handoff_failed",
            EngineError::Cancelled => "cancelled",
            EngineError::TaskTimeout(_) => "task_timeout",
            EngineError::ProcessSpawnFailed(_) => "process_spawn_failed",
            EngineError::LaunchFailed(_) => "launch_failed",
            EngineError::Session(_) => "session",
            EngineError::Sampling(_) => "sampling",
            EngineError::Config(_) | EngineError::InvalidConfig(_) => "config",
            EngineError::Io(_) => "io",
        }
    }
}
