// packages/engine/src/utils/mod.rs
//! Common utilities: configuration loading and the error taxonomy

pub mod config;
pub mod errors;

pub use config::EngineConfig;
pub use errors::{EngineError, Result};
