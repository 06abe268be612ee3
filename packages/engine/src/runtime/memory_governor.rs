// packages/engine/src/runtime/memory_governor.rs
//! Memory pressure governor
//!
//! Samples process and system memory on a fixed interval and turns the
//! readings into backpressure:
//!
//! - **Normal**: nothing to do
//! - **Soft** (process memory above `soft_ratio` of the ceiling): maybe ask
//!   the allocator to give memory back, with probability
//!   `soft_gc_probability`
//! - **Hard** (above `hard_ratio`): always collect, and close `shed_fraction`
//!   of the tracked sessions
//!
//! Nothing in here returns an error to the caller. Failed samples are
//! logged and skipped.

use crate::runtime::session_pool::SessionPool;
use crate::utils::config::MemorySection;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One memory sample, in bytes
#[derive(Debug, Clone, Serialize)]
pub struct MemoryReading {
    /// Resident memory of this process
    pub heap_used: u64,
    /// Virtual memory of this process
    pub heap_total: u64,
    pub system_free: u64,
    pub system_total: u64,
    pub taken_at: DateTime<Utc>,
}

impl MemoryReading {
    pub fn system_used(&self) -> u64 {
        self.system_total.saturating_sub(self.system_free)
    }
}

/// Coarse classification of memory headroom
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Soft,
    Hard,
}

impl PressureLevel {
    fn as_gauge(self) -> f64 {
        match self {
            PressureLevel::Normal => 0.0,
            PressureLevel::Soft => 1.0,
            PressureLevel::Hard => 2.0,
        }
    }
}

/// Source of memory readings
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> Result<MemoryReading>;
}

/// Cooperative collection hook
pub trait GcTrigger: Send + Sync {
    fn collect(&self);
}

/// Something that can give sessions back under pressure
#[async_trait]
pub trait MemoryReclaimer: Send + Sync {
    /// Sessions currently tracked
    fn tracked(&self) -> usize;

    /// Close up to `count` sessions; returns how many were closed
    async fn shed(&self, count: usize) -> usize;
}

#[async_trait]
impl MemoryReclaimer for SessionPool {
    fn tracked(&self) -> usize {
        self.stats().tracked
    }

    async fn shed(&self, count: usize) -> usize {
        SessionPool::shed(self, count).await
    }
}

/// Reads `/proc/self/statm` and `/proc/meminfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsSampler;

impl MemorySampler for ProcfsSampler {
    fn sample(&self) -> Result<MemoryReading> {
        let statm = std::fs::read_to_string("/proc/self/statm")
            .map_err(|e| EngineError::Sampling(format!("reading /proc/self/statm: {}", e)))?;
        let meminfo = std::fs::read_to_string("/proc/meminfo")
            .map_err(|e| EngineError::Sampling(format!("reading /proc/meminfo: {}", e)))?;

        let (size_pages, resident_pages) = parse_statm(&statm)?;
        let page_size = page_size();
        let (system_total, system_free) = parse_meminfo(&meminfo)?;

        Ok(MemoryReading {
            heap_used: resident_pages * page_size,
            heap_total: size_pages * page_size,
            system_free,
            system_total,
            taken_at: Utc::now(),
        })
    }
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Total and resident size in pages
fn parse_statm(contents: &str) -> Result<(u64, u64)> {
    let mut fields = contents.split_whitespace().map(str::parse::<u64>);
    match (fields.next(), fields.next()) {
        (Some(Ok(size)), Some(Ok(resident))) => Ok((size, resident)),
        _ => Err(EngineError::Sampling(format!("malformed statm: {:?}", contents))),
    }
}

/// Total and free system memory in bytes
///
/// Free is `MemAvailable`, or `MemFree` on kernels that lack it.
fn parse_meminfo(contents: &str) -> Result<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    let mut free = None;

    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kib) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "MemTotal:" => total = Some(kib * 1024),
            "MemAvailable:" => available = Some(kib * 1024),
            "MemFree:" => free = Some(kib * 1024),
            _ => {}
        }
    }

    match (total, available.or(free)) {
        (Some(total), Some(free)) => Ok((total, free)),
        _ => Err(EngineError::Sampling("meminfo lacks MemTotal or MemFree".into())),
    }
}

/// Returns freed heap pages to the OS
#[derive(Debug, Default, Clone, Copy)]
pub struct MallocTrim;

impl GcTrigger for MallocTrim {
    fn collect(&self) {
        #[cfg(all(target_os = "linux", target_env = "gnu"))]
        {
            // SAFETY: malloc_trim only walks the allocator's own arenas
            let released = unsafe { libc::malloc_trim(0) };
            debug!(released = released != 0, "malloc_trim");
        }
    }
}

/// Governor thresholds
#[derive(Debug, Clone)]
pub struct MemoryGovernorConfig {
    pub max_memory_bytes: u64,
    pub soft_ratio: f64,
    pub hard_ratio: f64,
    pub warn_ratio: f64,
    pub sample_interval: Duration,
    pub shed_fraction: f64,
    pub soft_gc_probability: f64,
    pub history_len: usize,
}

impl From<&MemorySection> for MemoryGovernorConfig {
    fn from(section: &MemorySection) -> Self {
        Self {
            max_memory_bytes: section.max_memory_bytes(),
            soft_ratio: section.soft_ratio,
            hard_ratio: section.hard_ratio,
            warn_ratio: section.warn_ratio,
            sample_interval: section.sample_interval(),
            shed_fraction: section.shed_fraction,
            soft_gc_probability: section.soft_gc_probability,
            history_len: section.history_len,
        }
    }
}

impl Default for MemoryGovernorConfig {
    fn default() -> Self {
        Self::from(&MemorySection::default())
    }
}

/// What the governor did about one reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaction {
    pub level: PressureLevel,
    pub collected: bool,
    pub shed: usize,
}

/// Samples memory and reacts to pressure
pub struct MemoryGovernor {
    config: MemoryGovernorConfig,
    sampler: Arc<dyn MemorySampler>,
    gc: Arc<dyn GcTrigger>,
    reclaimer: Arc<dyn MemoryReclaimer>,
    history: Mutex<VecDeque<MemoryReading>>,
    collections: AtomicU64,
    shed_total: AtomicU64,
}

impl MemoryGovernor {
    pub fn new(
        config: MemoryGovernorConfig,
        sampler: Arc<dyn MemorySampler>,
        gc: Arc<dyn GcTrigger>,
        reclaimer: Arc<dyn MemoryReclaimer>,
    ) -> Self {
        Self {
            config,
            sampler,
            gc,
            reclaimer,
            history: Mutex::new(VecDeque::new()),
            collections: AtomicU64::new(0),
            shed_total: AtomicU64::new(0),
        }
    }

    /// Classify process memory against the ceiling
    pub fn classify(&self, reading: &MemoryReading) -> PressureLevel {
        let ratio = self.usage_ratio(reading);
        if ratio > self.config.hard_ratio {
            PressureLevel::Hard
        } else if ratio > self.config.soft_ratio {
            PressureLevel::Soft
        } else {
            PressureLevel::Normal
        }
    }

    fn usage_ratio(&self, reading: &MemoryReading) -> f64 {
        if self.config.max_memory_bytes == 0 {
            return 0.0;
        }
        reading.heap_used as f64 / self.config.max_memory_bytes as f64
    }

    /// Sample once and react
    pub async fn tick(&self) -> Option<Reaction> {
        match self.sampler.sample() {
            Ok(reading) => Some(self.observe(reading).await),
            Err(e) => {
                warn!(error = %e, "Memory sample failed");
                None
            }
        }
    }

    /// React to a reading
    pub async fn observe(&self, reading: MemoryReading) -> Reaction {
        let level = self.classify(&reading);
        let ratio = self.usage_ratio(&reading);

        metrics::gauge!("solver_memory_process_bytes").set(reading.heap_used as f64);
        metrics::gauge!("solver_memory_pressure_level").set(level.as_gauge());

        if ratio > self.config.warn_ratio {
            warn!(
                heap_used_mb = reading.heap_used / (1024 * 1024),
                max_mb = self.config.max_memory_bytes / (1024 * 1024),
                system_used_mb = reading.system_used() / (1024 * 1024),
                "High memory usage"
            );
        }

        self.remember(reading);

        let collected = match level {
            PressureLevel::Normal => false,
            PressureLevel::Soft => {
                let roll = self.roll_soft_collection();
                if roll {
                    self.collect();
                }
                roll
            }
            PressureLevel::Hard => {
                self.collect();
                true
            }
        };

        let shed = if level == PressureLevel::Hard {
            let tracked = self.reclaimer.tracked();
            let count = ((tracked as f64 * self.config.shed_fraction).floor() as usize).max(1);
            let closed = self.reclaimer.shed(count).await;
            self.shed_total.fetch_add(closed as u64, Ordering::Relaxed);
            warn!(tracked, closed, "Hard memory pressure, shed sessions");
            closed
        } else {
            0
        };

        Reaction { level, collected, shed }
    }

    fn roll_soft_collection(&self) -> bool {
        rand::thread_rng().gen_bool(self.config.soft_gc_probability.clamp(0.0, 1.0))
    }

    fn collect(&self) {
        self.gc.collect();
        self.collections.fetch_add(1, Ordering::Relaxed);
    }

    fn remember(&self, reading: MemoryReading) {
        let mut history = self.history.lock();
        history.push_back(reading);
        while history.len() > self.config.history_len.max(1) {
            history.pop_front();
        }
    }

    /// Sample every `sample_interval` until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval = ?self.config.sample_interval,
            max_mb = self.config.max_memory_bytes / (1024 * 1024),
            "Memory governor started"
        );

        let mut interval = tokio::time::interval(self.config.sample_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        debug!("Memory governor stopped");
    }

    pub fn latest(&self) -> Option<MemoryReading> {
        self.history.lock().back().cloned()
    }

    /// Mean process memory over the retained history
    pub fn average_heap_used(&self) -> Option<u64> {
        let history = self.history.lock();
        if history.is_empty() {
            return None;
        }
        let sum: u64 = history.iter().map(|reading| reading.heap_used).sum();
        Some(sum / history.len() as u64)
    }

    pub fn stats(&self) -> MemoryStats {
        let latest = self.latest();
        MemoryStats {
            level: latest.as_ref().map(|reading| self.classify(reading)),
            average_heap_used: self.average_heap_used(),
            latest,
            collections: self.collections.load(Ordering::Relaxed),
            sessions_shed: self.shed_total.load(Ordering::Relaxed),
        }
    }
}

/// Memory governor statistics
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub latest: Option<MemoryReading>,
    pub level: Option<PressureLevel>,
    pub average_heap_used: Option<u64>,
    pub collections: u64,
    pub sessions_shed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::session_pool::PoolConfig;
    use crate::runtime::simulated::{SimulatedControl, SimulatedLauncher};
    use crate::runtime::supervisor::{EngineSupervisor, SupervisorConfig};
    use std::sync::atomic::AtomicUsize;

    const MB: u64 = 1024 * 1024;

    struct FixedSampler {
        heap_used: AtomicU64,
    }

    impl MemorySampler for FixedSampler {
        fn sample(&self) -> Result<MemoryReading> {
            Ok(reading(self.heap_used.load(Ordering::SeqCst)))
        }
    }

    #[derive(Default)]
    struct CountingGc {
        calls: AtomicUsize,
    }

    impl GcTrigger for CountingGc {
        fn collect(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn reading(heap_used: u64) -> MemoryReading {
        MemoryReading {
            heap_used,
            heap_total: heap_used * 2,
            system_free: 4096 * MB,
            system_total: 8192 * MB,
            taken_at: Utc::now(),
        }
    }

    fn config(soft_gc_probability: f64) -> MemoryGovernorConfig {
        MemoryGovernorConfig {
            max_memory_bytes: 100 * MB,
            soft_ratio: 0.6,
            hard_ratio: 0.8,
            warn_ratio: 0.7,
            sample_interval: Duration::from_secs(15),
            shed_fraction: 0.3,
            soft_gc_probability,
            history_len: 3,
        }
    }

    async fn pool_with_idle(count: usize) -> Arc<SessionPool> {
        let control = SimulatedControl::new();
        let supervisor = EngineSupervisor::new(
            Arc::new(SimulatedLauncher::new(control)),
            SupervisorConfig::default(),
        );
        assert!(supervisor.launch().await);
        let pool = Arc::new(SessionPool::new(
            supervisor,
            PoolConfig {
                max_size: count,
                acquire_timeout: Duration::from_secs(30),
                recycle_threshold: 100,
            },
        ));

        let cancel = CancellationToken::new();
        let mut sessions = vec![];
        for _ in 0..count {
            sessions.push(pool.acquire(&cancel).await.unwrap());
        }
        for session in sessions {
            pool.release(session).await;
        }
        pool
    }

    fn governor(
        config: MemoryGovernorConfig,
        heap_used: u64,
        reclaimer: Arc<dyn MemoryReclaimer>,
    ) -> (MemoryGovernor, Arc<CountingGc>) {
        let gc = Arc::new(CountingGc::default());
        let sampler = Arc::new(FixedSampler {
            heap_used: AtomicU64::new(heap_used),
        });
        let governor = MemoryGovernor::new(config, sampler, Arc::clone(&gc) as Arc<dyn GcTrigger>, reclaimer);
        (governor, gc)
    }

    #[tokio::test]
    async fn test_classification_thresholds() {
        let pool = pool_with_idle(1).await;
        let (governor, _) = governor(config(0.5), 0, pool);

        assert_eq!(governor.classify(&reading(50 * MB)), PressureLevel::Normal);
        // Crossing means strictly above
        assert_eq!(governor.classify(&reading(60 * MB)), PressureLevel::Normal);
        assert_eq!(governor.classify(&reading(61 * MB)), PressureLevel::Soft);
        assert_eq!(governor.classify(&reading(80 * MB)), PressureLevel::Soft);
        assert_eq!(governor.classify(&reading(81 * MB)), PressureLevel::Hard);
    }

    #[tokio::test]
    async fn test_hard_pressure_sheds_and_collects() {
        let pool = pool_with_idle(10).await;
        assert_eq!(pool.stats().total(), 10);

        let (governor, gc) = governor(config(0.0), 90 * MB, Arc::clone(&pool) as Arc<dyn MemoryReclaimer>);
        let reaction = governor.tick().await.unwrap();

        assert_eq!(reaction.level, PressureLevel::Hard);
        assert!(reaction.collected);
        assert_eq!(reaction.shed, 3);
        assert_eq!(gc.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().total(), 7);
        assert_eq!(governor.stats().sessions_shed, 3);
    }

    #[tokio::test]
    async fn test_hard_pressure_sheds_at_least_one() {
        let pool = pool_with_idle(2).await;
        let (governor, _) = governor(config(0.0), 95 * MB, Arc::clone(&pool) as Arc<dyn MemoryReclaimer>);

        let reaction = governor.tick().await.unwrap();
        assert_eq!(reaction.shed, 1);
        assert_eq!(pool.stats().total(), 1);
    }

    #[tokio::test]
    async fn test_soft_pressure_collects_probabilistically() {
        let pool = pool_with_idle(4).await;

        let (never, never_gc) = governor(config(0.0), 70 * MB, Arc::clone(&pool) as Arc<dyn MemoryReclaimer>);
        for _ in 0..10 {
            let reaction = never.tick().await.unwrap();
            assert_eq!(reaction.level, PressureLevel::Soft);
            assert!(!reaction.collected);
            assert_eq!(reaction.shed, 0);
        }
        assert_eq!(never_gc.calls.load(Ordering::SeqCst), 0);

        let (always, always_gc) = governor(config(1.0), 70 * MB, Arc::clone(&pool) as Arc<dyn MemoryReclaimer>);
        for _ in 0..10 {
            assert!(always.tick().await.unwrap().collected);
        }
        assert_eq!(always_gc.calls.load(Ordering::SeqCst), 10);

        // Soft pressure never closes sessions
        assert_eq!(pool.stats().total(), 4);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let pool = pool_with_idle(1).await;
        let (governor, _) = governor(config(0.0), 0, pool);
        assert!(governor.average_heap_used().is_none());

        for heap in [10, 20, 30, 40] {
            governor.observe(reading(heap * MB)).await;
        }

        assert_eq!(governor.history.lock().len(), 3);
        assert_eq!(governor.average_heap_used(), Some(30 * MB));
        assert_eq!(governor.latest().unwrap().heap_used, 40 * MB);
        assert_eq!(governor.stats().level, Some(PressureLevel::Normal));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_samples_until_cancelled() {
        let pool = pool_with_idle(1).await;
        let (governor, _) = governor(config(0.0), 10 * MB, pool);
        let governor = Arc::new(governor);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&governor).run(cancel.clone()));

        // First tick fires immediately, then every 15s
        tokio::time::sleep(Duration::from_secs(31)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(governor.history.lock().len(), 3);
    }

    #[test]
    fn test_parse_statm() {
        assert_eq!(parse_statm("2048 512 100 10 0 300 0\n").unwrap(), (2048, 512));
        assert!(parse_statm("garbage").is_err());
    }

    #[test]
    fn test_parse_meminfo_prefers_available() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    8000000 kB\n";
        assert_eq!(parse_meminfo(meminfo).unwrap(), (16_000_000 * 1024, 8_000_000 * 1024));

        let old_kernel = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\n";
        assert_eq!(parse_meminfo(old_kernel).unwrap(), (16_000_000 * 1024, 1_000_000 * 1024));

        assert!(parse_meminfo("Buffers: 10 kB\n").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_sampler() {
        let reading = ProcfsSampler.sample().unwrap();
        assert!(reading.heap_used > 0);
        assert!(reading.heap_total >= reading.heap_used);
        assert!(reading.system_total >= reading.system_free);
    }
}
