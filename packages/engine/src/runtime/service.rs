// packages/engine/src/runtime/service.rs
//! Solver runtime
//!
//! The one object task handlers receive. It owns the engine supervisor, the
//! session pool, the admission gate and the memory governor, runs their
//! background loops, and wraps the task boundary:
//!
//! ```text
//! ready? ──► admit ──► acquire ──► task (bounded by task_timeout) ──► release ──► depart
//!   │          │          │
//!   ▼          ▼          ▼
//! EngineUnavailable  AdmissionRejected  PoolTimeout / EngineUnavailable / Cancelled
//! ```
//!
//! Release and depart happen on every path, including a task that errors,
//! times out, or whose future is dropped.

use crate::runtime::admission::{AdmissionGuard, AdmissionStats, ConcurrencyGovernor, TaskOutcome};
use crate::runtime::browser::BrowserLauncher;
use crate::runtime::engine::EngineLauncher;
use crate::runtime::memory_governor::{
    GcTrigger, MallocTrim, MemoryGovernor, MemoryGovernorConfig, MemoryReclaimer, MemorySampler,
    MemoryStats, ProcfsSampler,
};
use crate::runtime::session::WorkerSession;
use crate::runtime::session_pool::{PoolConfig, PoolStats, SessionPool};
use crate::runtime::simulated::{SimulatedControl, SimulatedLauncher};
use crate::runtime::supervisor::{EngineState, EngineSupervisor, SupervisorConfig};
use crate::utils::config::{EngineBackend, EngineConfig};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session pool, supervisor and governors behind one handle
pub struct SolverRuntime {
    config: EngineConfig,
    supervisor: Arc<EngineSupervisor>,
    pool: Arc<SessionPool>,
    admission: Arc<ConcurrencyGovernor>,
    memory: Arc<MemoryGovernor>,

    /// Last idle restart (or construction)
    last_restart: Mutex<DateTime<Utc>>,

    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    started_at: Instant,
}

impl SolverRuntime {
    /// Build a runtime for the configured backend
    pub fn from_config(config: EngineConfig) -> Result<Arc<Self>> {
        let launcher: Arc<dyn EngineLauncher> = match config.engine.backend {
            EngineBackend::Browser => Arc::new(BrowserLauncher::new(config.engine.clone())),
            EngineBackend::Simulated => Arc::new(SimulatedLauncher::new(SimulatedControl::new())),
        };
        Self::with_launcher(config, launcher)
    }

    /// Build a runtime around an explicit engine launcher
    pub fn with_launcher(config: EngineConfig, launcher: Arc<dyn EngineLauncher>) -> Result<Arc<Self>> {
        Self::with_parts(config, launcher, Arc::new(ProcfsSampler), Arc::new(MallocTrim))
    }

    /// Build a runtime with explicit memory sampling and collection hooks
    pub fn with_parts(
        config: EngineConfig,
        launcher: Arc<dyn EngineLauncher>,
        sampler: Arc<dyn MemorySampler>,
        gc: Arc<dyn GcTrigger>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let supervisor = EngineSupervisor::new(launcher, SupervisorConfig::from(&config.engine));
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&supervisor),
            PoolConfig::from(&config.pool),
        ));
        let admission = Arc::new(ConcurrencyGovernor::from_config(&config.admission));
        let memory = Arc::new(MemoryGovernor::new(
            MemoryGovernorConfig::from(&config.memory),
            sampler,
            gc,
            Arc::clone(&pool) as Arc<dyn MemoryReclaimer>,
        ));

        Ok(Arc::new(Self {
            config,
            supervisor,
            pool,
            admission,
            memory,
            last_restart: Mutex::new(Utc::now()),
            cancel: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            started_at: Instant::now(),
        }))
    }

    /// Launch the engine and start the background loops
    pub fn start(self: &Arc<Self>) {
        info!(
            backend = ?self.config.engine.backend,
            max_sessions = self.config.pool.max_size,
            max_tasks = self.config.admission.max_concurrent_tasks,
            "Starting solver runtime"
        );

        self.supervisor.start();

        let mut background = self.background.lock();
        background.push(tokio::spawn(
            Arc::clone(&self.memory).run(self.cancel.child_token()),
        ));
        background.push(tokio::spawn(Arc::clone(self).sweep_loop()));
        if self.config.admission.idle_restart_after().is_some() {
            background.push(tokio::spawn(Arc::clone(self).idle_loop()));
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.pool.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let closed = self
                        .pool
                        .sweep(self.config.pool.sweep_high_water, self.config.pool.sweep_fraction)
                        .await;
                    if closed > 0 {
                        info!(closed, "Sweep closed sessions");
                    }
                }
            }
        }
        debug!("Sweeper stopped");
    }

    async fn idle_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.admission.idle_check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.restart_if_idle().await;
                }
            }
        }
        debug!("Idle watcher stopped");
    }

    /// Restart the engine if no task arrived for `idle_restart_after`
    ///
    /// Returns whether a restart was requested.
    pub async fn restart_if_idle(&self) -> bool {
        let Some(after) = self.config.admission.idle_restart_after() else {
            return false;
        };
        if self.admission.active() > 0 || !self.supervisor.is_ready() {
            return false;
        }

        let last_activity = {
            let last_restart = *self.last_restart.lock();
            self.admission
                .last_task_at()
                .map_or(last_restart, |last_task| last_task.max(last_restart))
        };
        let idle = (Utc::now() - last_activity).to_std().unwrap_or_default();
        if idle < after {
            return false;
        }

        info!(idle_secs = idle.as_secs(), "Engine idle, restarting it");
        *self.last_restart.lock() = Utc::now();
        self.pool.drain().await;
        self.supervisor.restart();
        true
    }

    /// Whether a live engine can serve sessions right now
    pub fn is_engine_ready(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && self.supervisor.is_ready()
    }

    /// Wait up to `timeout` for the engine to come up
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        self.supervisor.wait_ready(timeout).await
    }

    /// Admission check; pair every `true` with one [`SolverRuntime::depart`]
    pub fn admit(&self) -> bool {
        self.admission.admit()
    }

    pub fn depart(&self) {
        self.admission.depart()
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<WorkerSession> {
        self.pool.acquire(cancel).await
    }

    pub async fn release(&self, session: WorkerSession) {
        self.pool.release(session).await
    }

    /// Run `task` with a session, end to end
    ///
    /// ```ignore
    /// let title = runtime
    ///     .run(&cancel, |session| async move { solve(session.handle()).await }.boxed())
    ///     .await?;
    /// ```
    pub async fn run<T, F>(&self, cancel: &CancellationToken, task: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s WorkerSession) -> BoxFuture<'s, Result<T>>,
    {
        if !self.is_engine_ready() {
            return Err(EngineError::EngineUnavailable("engine is not ready".into()));
        }

        let _admitted: AdmissionGuard =
            self.admission
                .try_admit()
                .ok_or_else(|| EngineError::AdmissionRejected {
                    active: self.admission.active(),
                    max: self.admission.max_concurrent(),
                })?;

        let session = match self.pool.acquire(cancel).await {
            Ok(session) => session,
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };
        let checkout = Checkout {
            pool: Arc::clone(&self.pool),
            session: Some(session),
        };

        let timeout = self.config.admission.task_timeout();
        let result = match checkout.session.as_ref() {
            Some(session) => {
                tokio::select! {
                    outcome = tokio::time::timeout(timeout, task(session)) => {
                        outcome.unwrap_or(Err(EngineError::TaskTimeout(timeout)))
                    }
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                }
            }
            None => Err(EngineError::EngineUnavailable("session vanished".into())),
        };

        checkout.finish().await;

        match &result {
            Ok(_) => self.admission.record_outcome(TaskOutcome::Succeeded),
            Err(e) => self.record_failure(e),
        }
        result
    }

    /// Count an admitted task that did not succeed
    fn record_failure(&self, error: &EngineError) {
        debug!(error = %error, kind = error.kind(), "Task failed");
        metrics::counter!("solver_tasks_failed_total", "kind" => error.kind()).increment(1);
        self.admission.record_outcome(TaskOutcome::Failed);
    }

    /// Serialisable snapshot of every component
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            engine: EngineStats {
                state: self.supervisor.state(),
                generation: self.supervisor.generation(),
                ready: self.is_engine_ready(),
            },
            pool: self.pool.stats(),
            admission: self.admission.stats(),
            memory: self.memory.stats(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn supervisor(&self) -> &Arc<EngineSupervisor> {
        &self.supervisor
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop background loops, fail waiters, close sessions and the engine
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Shutting down solver runtime");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }

        self.pool.drain().await;
        self.supervisor.shutdown().await;
        info!("Solver runtime stopped");
    }
}

/// Returns its session to the pool, even when dropped mid-task
struct Checkout {
    pool: Arc<SessionPool>,
    session: Option<WorkerSession>,
}

impl Checkout {
    async fn finish(mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session).await;
        }
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.pool);
                handle.spawn(async move { pool.release(session).await });
            }
            Err(_) => warn!(session_id = session.id(), "No runtime to release abandoned session"),
        }
    }
}

/// Engine part of the status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub state: EngineState,
    pub generation: u64,
    pub ready: bool,
}

/// Status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub engine: EngineStats,
    pub pool: PoolStats,
    pub admission: AdmissionStats,
    pub memory: MemoryStats,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory_governor::MemoryReading;
    use futures::FutureExt;

    struct QuietSampler;

    impl MemorySampler for QuietSampler {
        fn sample(&self) -> Result<MemoryReading> {
            Ok(MemoryReading {
                heap_used: 1024 * 1024,
                heap_total: 2 * 1024 * 1024,
                system_free: 1 << 30,
                system_total: 1 << 31,
                taken_at: Utc::now(),
            })
        }
    }

    struct NoGc;

    impl GcTrigger for NoGc {
        fn collect(&self) {}
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.engine.backend = EngineBackend::Simulated;
        config.engine.relaunch_backoff_ms = 20;
        config.engine.quiesce_delay_ms = 20;
        config.pool.max_size = 2;
        config.admission.max_concurrent_tasks = 2;
        config
    }

    async fn started(config: EngineConfig) -> (Arc<SolverRuntime>, Arc<SimulatedControl>) {
        let control = SimulatedControl::new();
        let runtime = SolverRuntime::with_parts(
            config,
            Arc::new(SimulatedLauncher::new(Arc::clone(&control))),
            Arc::new(QuietSampler),
            Arc::new(NoGc),
        )
        .unwrap();
        runtime.start();
        assert!(runtime.wait_ready(Duration::from_secs(5)).await);
        (runtime, control)
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid_config() {
        let mut config = test_config();
        config.pool.max_size = 0;
        assert!(matches!(
            SolverRuntime::from_config(config),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_run_round_trip() {
        let (runtime, control) = started(test_config()).await;
        let cancel = CancellationToken::new();

        let handle = runtime
            .run(&cancel, |session| {
                let handle = session.handle().to_string();
                async move { Ok(handle) }.boxed()
            })
            .await
            .unwrap();
        assert!(handle.starts_with("sim-"));

        let stats = runtime.stats();
        assert_eq!(stats.admission.active, 0);
        assert_eq!(stats.admission.succeeded, 1);
        assert_eq!(stats.pool.used, 0);
        assert_eq!(stats.pool.available, 1);
        assert_eq!(control.resets(), 1);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_before_start_is_unavailable() {
        let runtime = SolverRuntime::with_parts(
            test_config(),
            Arc::new(SimulatedLauncher::new(SimulatedControl::new())),
            Arc::new(QuietSampler),
            Arc::new(NoGc),
        )
        .unwrap();
        assert!(!runtime.is_engine_ready());

        let result = runtime
            .run(&CancellationToken::new(), |_| async { Ok(()) }.boxed())
            .await;
        assert!(matches!(result, Err(EngineError::EngineUnavailable(_))));
        assert_eq!(runtime.stats().admission.admitted, 0);
    }

    #[tokio::test]
    async fn test_run_rejects_over_ceiling() {
        let mut config = test_config();
        config.admission.max_concurrent_tasks = 1;
        let (runtime, _) = started(config).await;

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();
        let busy = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                runtime
                    .run(&CancellationToken::new(), move |_| {
                        async move {
                            let _ = entered_tx.send(());
                            let _ = finish_rx.await;
                            Ok(())
                        }
                        .boxed()
                    })
                    .await
            })
        };
        entered_rx.await.unwrap();

        let rejected = runtime
            .run(&CancellationToken::new(), |_| async { Ok(()) }.boxed())
            .await;
        assert!(matches!(
            rejected,
            Err(EngineError::AdmissionRejected { active: 1, max: 1 })
        ));
        assert!(rejected.unwrap_err().is_retryable());

        finish_tx.send(()).unwrap();
        busy.await.unwrap().unwrap();
        assert_eq!(runtime.stats().admission.active, 0);
        assert_eq!(runtime.stats().admission.rejected, 1);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_task_timeout_releases_everything() {
        let mut config = test_config();
        config.admission.task_timeout_ms = 50;
        let (runtime, _) = started(config).await;

        let result = runtime
            .run(&CancellationToken::new(), |_| {
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }
                .boxed()
            })
            .await;
        assert!(matches!(result, Err(EngineError::TaskTimeout(_))));

        let stats = runtime.stats();
        assert_eq!(stats.admission.active, 0);
        assert_eq!(stats.admission.failed, 1);
        assert_eq!(stats.pool.used, 0);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_task_error_is_returned() {
        let (runtime, _) = started(test_config()).await;

        let result: Result<()> = runtime
            .run(&CancellationToken::new(), |_| {
                async { Err(EngineError::Session("solver gave up".into())) }.boxed()
            })
            .await;
        assert!(matches!(result, Err(EngineError::Session(_))));
        assert_eq!(runtime.stats().admission.success_rate, 0.0);
        assert_eq!(runtime.stats().pool.used, 0);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_failure_counts_as_failed_task() {
        let (runtime, control) = started(test_config()).await;
        control.set_fail_session_creation(true);

        let result = runtime
            .run(&CancellationToken::new(), |_| async { Ok(()) }.boxed())
            .await;
        assert!(matches!(result, Err(EngineError::EngineUnavailable(_))));

        let stats = runtime.stats();
        assert_eq!(stats.admission.admitted, 1);
        assert_eq!(stats.admission.failed, 1);
        assert_eq!(stats.admission.success_rate, 0.0);
        assert_eq!(stats.admission.active, 0);
        assert_eq!(stats.pool.used, 0);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_run_returns_session() {
        let (runtime, _) = started(test_config()).await;

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let task = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                runtime
                    .run(&CancellationToken::new(), move |_| {
                        async move {
                            let _ = entered_tx.send(());
                            futures::future::pending::<Result<()>>().await
                        }
                        .boxed()
                    })
                    .await
            })
        };
        entered_rx.await.unwrap();
        assert_eq!(runtime.stats().pool.used, 1);

        task.abort();
        let _ = task.await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let stats = runtime.stats();
        assert_eq!(stats.admission.active, 0);
        assert_eq!(stats.pool.used, 0);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_crash_is_recovered() {
        let (runtime, control) = started(test_config()).await;
        let cancel = CancellationToken::new();

        let session = runtime.acquire(&cancel).await.unwrap();
        let generation = runtime.stats().engine.generation;

        control.crash();
        tokio::time::timeout(Duration::from_secs(5), async {
            while runtime.stats().engine.generation == generation || !runtime.is_engine_ready() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // The old session is dead; releasing it must not poison the pool
        assert!(!session.is_usable());
        runtime.release(session).await;

        let fresh = runtime.acquire(&cancel).await.unwrap();
        assert!(fresh.generation() > generation);
        runtime.release(fresh).await;
        assert_eq!(runtime.stats().pool.used, 0);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_restart() {
        let mut config = test_config();
        config.admission.idle_restart_after_ms = 200;
        let (runtime, control) = started(config).await;
        assert!(!runtime.restart_if_idle().await);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(runtime.restart_if_idle().await);

        tokio::time::timeout(Duration::from_secs(5), async {
            while control.launches() < 2 || !runtime.is_engine_ready() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Just restarted, so not idle any more
        assert!(!runtime.restart_if_idle().await);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_restart_disabled() {
        let mut config = test_config();
        config.admission.idle_restart_after_ms = 0;
        let (runtime, _) = started(config).await;

        assert!(!runtime.restart_if_idle().await);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_serialize() {
        let (runtime, _) = started(test_config()).await;

        let json = serde_json::to_value(runtime.stats()).unwrap();
        assert_eq!(json["engine"]["state"], "running");
        assert_eq!(json["pool"]["max_size"], 2);
        assert_eq!(json["admission"]["state"], "open");

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (runtime, control) = started(test_config()).await;

        let session = runtime.acquire(&CancellationToken::new()).await.unwrap();
        runtime.release(session).await;
        assert_eq!(control.sessions_live(), 1);

        runtime.shutdown().await;
        runtime.shutdown().await;

        assert!(!runtime.is_engine_ready());
        assert_eq!(control.sessions_live(), 0);
        assert_eq!(runtime.stats().engine.state, EngineState::Stopped);
    }
}
