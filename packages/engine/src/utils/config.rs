// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Values are layered in this order, later sources winning:
//!
//! 1. Built-in defaults (the `Default` impls below)
//! 2. `config/engine.{toml,yaml,json}`, or the file named by `SOLVER_CONFIG`
//! 3. Environment variables, `SOLVER__<SECTION>__<KEY>`
//!    (e.g. `SOLVER__POOL__MAX_SIZE=10`)

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default location of the optional configuration file (each supported extension is tried)
pub const DEFAULT_CONFIG_PATH: &str = "config/engine";

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "SOLVER_CONFIG";

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "SOLVER";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSection,
    pub pool: PoolSection,
    pub admission: AdmissionSection,
    pub memory: MemorySection,
    pub observability: ObservabilitySection,
}

/// Which engine implementation backs the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineBackend {
    /// A real browser process launched from `executable`
    Browser,
    /// In-memory engine for local development and tests
    Simulated,
}

/// [engine] section: browser launch and relaunch behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub backend: EngineBackend,

    /// Browser executable; searched on PATH when unset
    pub executable: Option<String>,

    pub headless: bool,

    /// Viewport width in pixels
    pub width: u32,

    /// Viewport height in pixels
    pub height: u32,

    /// Flags appended after the built-in launch flags
    pub extra_args: Vec<String>,

    pub launch_timeout_ms: u64,

    /// Delay before retrying a failed launch
    pub relaunch_backoff_ms: u64,

    /// Delay between disconnect teardown and relaunch
    pub quiesce_delay_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            backend: EngineBackend::Browser,
            executable: None,
            headless: false,
            width: 520,
            height: 240,
            extra_args: vec![],
            launch_timeout_ms: 120_000,
            relaunch_backoff_ms: 5_000,
            quiesce_delay_ms: 5_000,
        }
    }
}

impl EngineSection {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn relaunch_backoff(&self) -> Duration {
        Duration::from_millis(self.relaunch_backoff_ms)
    }

    pub fn quiesce_delay(&self) -> Duration {
        Duration::from_millis(self.quiesce_delay_ms)
    }
}

/// [pool] section: session pool sizing and recycling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Ceiling on `used + available`
    pub max_size: usize,

    /// How long a saturated acquire waits before failing
    pub acquire_timeout_ms: u64,

    /// Sessions are destroyed on release once they reach this many uses
    pub recycle_threshold: u64,

    pub sweep_interval_ms: u64,

    /// Sweep only when tracked sessions exceed this fraction of `max_size`
    pub sweep_high_water: f64,

    /// Fraction of tracked sessions closed by a sweep
    pub sweep_fraction: f64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_size: 20,
            acquire_timeout_ms: 30_000,
            recycle_threshold: 100,
            sweep_interval_ms: 60_000,
            sweep_high_water: 0.8,
            sweep_fraction: 0.3,
        }
    }
}

impl PoolSection {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// [admission] section: task admission and task-level timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionSection {
    pub max_concurrent_tasks: usize,

    /// Upper bound on a single task once it holds a session
    pub task_timeout_ms: u64,

    /// Restart the engine after this long without tasks; 0 disables
    pub idle_restart_after_ms: u64,

    pub idle_check_interval_ms: u64,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 60,
            task_timeout_ms: 300_000,
            idle_restart_after_ms: 6 * 60 * 60 * 1000,
            idle_check_interval_ms: 30 * 60 * 1000,
        }
    }
}

impl AdmissionSection {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn idle_restart_after(&self) -> Option<Duration> {
        (self.idle_restart_after_ms > 0).then(|| Duration::from_millis(self.idle_restart_after_ms))
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }
}

/// [memory] section: pressure thresholds and reactions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// Ceiling the process memory is measured against
    pub max_memory_mb: u64,

    pub soft_ratio: f64,
    pub hard_ratio: f64,

    /// Readings above this ratio are logged even when no action is taken
    pub warn_ratio: f64,

    pub sample_interval_ms: u64,

    /// Fraction of tracked sessions closed under hard pressure
    pub shed_fraction: f64,

    /// Chance of a collection pass under soft pressure
    pub soft_gc_probability: f64,

    /// Number of readings kept for smoothing
    pub history_len: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            soft_ratio: 0.6,
            hard_ratio: 0.8,
            warn_ratio: 0.7,
            sample_interval_ms: 15_000,
            shed_fraction: 0.3,
            soft_gc_probability: 0.5,
            history_len: 20,
        }
    }
}

impl MemorySection {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb * 1024 * 1024
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// [observability] section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    /// Default filter when `RUST_LOG` is unset
    pub log_level: String,

    pub log_format: LogFormat,

    /// Prometheus listener, e.g. "0.0.0.0:9100"; disabled when unset
    pub metrics_addr: Option<String>,

    /// How often the daemon logs a status snapshot
    pub status_interval_ms: u64,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_addr: None,
            status_interval_ms: 60_000,
        }
    }
}

impl EngineConfig {
    /// Load from the default file location (or `SOLVER_CONFIG`) and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    /// Load from an explicit file (optional) and the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().into_owned();

        let config: EngineConfig = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the governors cannot work with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(EngineError::InvalidConfig(msg.to_string()));

        if self.engine.width == 0 || self.engine.height == 0 {
            return invalid("engine viewport must be non-zero");
        }
        if self.pool.max_size == 0 {
            return invalid("pool.max_size must be at least 1");
        }
        if self.pool.recycle_threshold == 0 {
            return invalid("pool.recycle_threshold must be at least 1");
        }
        if self.pool.acquire_timeout_ms == 0 {
            return invalid("pool.acquire_timeout_ms must be non-zero");
        }
        if !is_fraction(self.pool.sweep_high_water) || !is_fraction(self.pool.sweep_fraction) {
            return invalid("pool sweep ratios must be within (0, 1]");
        }
        if self.admission.max_concurrent_tasks == 0 {
            return invalid("admission.max_concurrent_tasks must be at least 1");
        }
        if self.memory.max_memory_mb == 0 {
            return invalid("memory.max_memory_mb must be non-zero");
        }
        if !is_fraction(self.memory.soft_ratio) || !is_fraction(self.memory.hard_ratio) {
            return invalid("memory ratios must be within (0, 1]");
        }
        if self.memory.soft_ratio >= self.memory.hard_ratio {
            return invalid("memory.soft_ratio must be below memory.hard_ratio");
        }
        if !is_fraction(self.memory.shed_fraction) {
            return invalid("memory.shed_fraction must be within (0, 1]");
        }
        if !(0.0..=1.0).contains(&self.memory.soft_gc_probability) {
            return invalid("memory.soft_gc_probability must be within [0, 1]");
        }
        if self.memory.sample_interval_ms == 0 || self.pool.sweep_interval_ms == 0 {
            return invalid("sampling and sweep intervals must be non-zero");
        }
        if self.admission.idle_restart_after_ms > 0 && self.admission.idle_check_interval_ms == 0 {
            return invalid("admission.idle_check_interval_ms must be non-zero");
        }

        Ok(())
    }
}

fn is_fraction(value: f64) -> bool {
    value > 0.0 && value <= 1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.max_size, 20);
        assert_eq!(config.pool.recycle_threshold, 100);
        assert_eq!(config.pool.acquire_timeout(), Duration::from_secs(30));
        assert_eq!(config.admission.max_concurrent_tasks, 60);
        assert_eq!(config.engine.relaunch_backoff(), Duration::from_secs(5));
        assert_eq!(config.memory.max_memory_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        config.pool.max_size = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.memory.soft_ratio = 0.9;
        config.memory.hard_ratio = 0.8;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.memory.soft_gc_probability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_idle_restart_can_be_disabled() {
        let mut admission = AdmissionSection::default();
        assert_eq!(admission.idle_restart_after(), Some(Duration::from_secs(6 * 3600)));
        admission.idle_restart_after_ms = 0;
        assert_eq!(admission.idle_restart_after(), None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[engine]
backend = "simulated"

[pool]
max_size = 4
recycle_threshold = 10
"#
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.engine.backend, EngineBackend::Simulated);
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.recycle_threshold, 10);
        // Untouched keys keep their defaults
        assert_eq!(config.pool.acquire_timeout_ms, 30_000);
        assert_eq!(config.memory.max_memory_mb, 512);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(dir.path().join("absent")).unwrap();
        assert_eq!(config.pool.max_size, 20);
    }
}
