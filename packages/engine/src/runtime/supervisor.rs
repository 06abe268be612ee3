// packages/engine/src/runtime/supervisor.rs
//! Engine supervisor
//!
//! Keeps a usable engine instance alive and tracks every session created
//! from it.
//!
//! # Lifecycle
//!
//! ```text
//!            launch ok                 disconnect / restart
//! Launching ──────────► Running ────────────────────────► Disconnected
//!     ▲  │ launch failed                                        │
//!     │  └── backoff ──┐                         quiesce delay  │
//!     └────────────────┴────────────────────────────────────────┘
//!
//! shutdown() from any state ──► Stopped
//! ```
//!
//! Every session is created through [`EngineSupervisor::create_session`],
//! which registers it in the tracking set before the pool sees it. On
//! disconnect the instance is dropped, every tracked session is force-closed
//! and the set is cleared before relaunching. Sessions carry the generation
//! of the instance that created them, so a session that outlives its engine
//! is recognisably stale.

use crate::runtime::engine::{AutomationEngine, EngineLauncher};
use crate::runtime::session::TrackedSession;
use crate::utils::config::EngineSection;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Supervisor timing
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Upper bound on a single launch attempt
    pub launch_timeout: Duration,

    /// Wait before retrying a failed launch
    pub relaunch_backoff: Duration,

    /// Wait between disconnect teardown and relaunch
    pub quiesce_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&EngineSection::default())
    }
}

impl From<&EngineSection> for SupervisorConfig {
    fn from(section: &EngineSection) -> Self {
        Self {
            launch_timeout: section.launch_timeout(),
            relaunch_backoff: section.relaunch_backoff(),
            quiesce_delay: section.quiesce_delay(),
        }
    }
}

/// Observable engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Launching,
    Running,
    Disconnected,
    Stopped,
}

/// Owner of the engine instance and the session tracking set
pub struct EngineSupervisor {
    launcher: Arc<dyn EngineLauncher>,
    config: SupervisorConfig,

    /// Live instance; `None` while launching or after a disconnect
    engine: RwLock<Option<Arc<dyn AutomationEngine>>>,

    /// Bumped on every successful launch
    generation: AtomicU64,

    state: watch::Sender<EngineState>,

    /// Every session created from the current instance
    tracked: DashMap<u64, Arc<TrackedSession>>,

    next_session_id: AtomicU64,

    /// Set once by `shutdown`; suppresses relaunching
    finished: AtomicBool,

    cancel: CancellationToken,
    restart_requested: Notify,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EngineSupervisor {
    pub fn new(launcher: Arc<dyn EngineLauncher>, config: SupervisorConfig) -> Arc<Self> {
        let (state, _) = watch::channel(EngineState::Launching);

        Arc::new(Self {
            launcher,
            config,
            engine: RwLock::new(None),
            generation: AtomicU64::new(0),
            state,
            tracked: DashMap::new(),
            next_session_id: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            restart_requested: Notify::new(),
            loop_handle: Mutex::new(None),
        })
    }

    /// Spawn the supervision loop (launch, watch, relaunch)
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.loop_handle.lock();
        if handle.is_some() || self.is_finished() {
            return;
        }

        let supervisor = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { supervisor.supervise().await }));
    }

    async fn supervise(self: Arc<Self>) {
        info!("Engine supervisor started");

        loop {
            if self.is_finished() {
                break;
            }

            if !self.launch().await {
                if !self.pause(self.config.relaunch_backoff).await {
                    break;
                }
                continue;
            }

            let Some(mut signal) = self.current_engine().map(|engine| engine.disconnect_signal()) else {
                continue;
            };

            tokio::select! {
                _ = signal.wait() => {
                    if self.is_finished() {
                        break;
                    }
                    warn!(generation = self.generation(), "Engine disconnected, reconnecting");
                    metrics::counter!("solver_engine_disconnects_total").increment(1);
                    self.teardown(false).await;
                }
                _ = self.restart_requested.notified() => {
                    info!(generation = self.generation(), "Engine restart requested");
                    self.teardown(true).await;
                }
                _ = self.cancel.cancelled() => break,
            }

            if !self.pause(self.config.quiesce_delay).await {
                break;
            }
        }

        debug!("Engine supervisor loop exited");
    }

    /// Sleep unless shutdown arrives first; false means shut down
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Make one launch attempt and install the instance on success
    ///
    /// Failures are logged, never returned; the supervision loop retries
    /// after the backoff.
    pub async fn launch(&self) -> bool {
        if self.is_finished() {
            return false;
        }

        self.state.send_replace(EngineState::Launching);
        info!("Launching engine");

        let attempt = tokio::time::timeout(self.config.launch_timeout, self.launcher.launch());
        let launched = tokio::select! {
            result = attempt => result,
            _ = self.cancel.cancelled() => return false,
        };

        let engine = match launched {
            Ok(Ok(engine)) => engine,
            Ok(Err(e)) => {
                error!(error = %e, backoff = ?self.config.relaunch_backoff, "Engine launch failed");
                metrics::counter!("solver_engine_launch_failures_total").increment(1);
                return false;
            }
            Err(_) => {
                error!(timeout = ?self.config.launch_timeout, "Engine launch timed out");
                metrics::counter!("solver_engine_launch_failures_total").increment(1);
                return false;
            }
        };

        if self.is_finished() {
            if let Err(e) = engine.close().await {
                warn!(error = %e, "Error closing engine launched during shutdown");
            }
            return false;
        }

        let generation = {
            let mut slot = self.engine.write();
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            *slot = Some(engine);
            generation
        };

        self.state.send_replace(EngineState::Running);
        metrics::counter!("solver_engine_launches_total").increment(1);
        info!(generation, "Engine launched");
        true
    }

    /// Drop the instance and force-close every tracked session
    pub(crate) async fn teardown(&self, close_engine: bool) {
        let engine = self.engine.write().take();
        if !self.is_finished() {
            self.state.send_replace(EngineState::Disconnected);
        }

        let closed = self.close_tracked().await;
        if closed > 0 {
            info!(closed, "Closed sessions of torn-down engine");
        }

        if close_engine {
            if let Some(engine) = engine {
                if let Err(e) = engine.close().await {
                    warn!(error = %e, "Error closing engine");
                }
            }
        }
    }

    async fn close_tracked(&self) -> usize {
        let sessions: Vec<Arc<TrackedSession>> =
            self.tracked.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.tracked.clear();

        let count = sessions.len();
        futures::future::join_all(sessions.iter().map(|session| session.close())).await;
        metrics::counter!("solver_sessions_destroyed_total", "reason" => "engine_teardown")
            .increment(count as u64);
        count
    }

    /// Create a session from the live instance and start tracking it
    pub async fn create_session(&self) -> Result<Arc<TrackedSession>> {
        if self.is_finished() {
            return Err(EngineError::EngineUnavailable("supervisor is shut down".into()));
        }

        let (engine, generation) = {
            let slot = self.engine.read();
            match slot.as_ref() {
                Some(engine) => (Arc::clone(engine), self.generation.load(Ordering::Acquire)),
                None => {
                    return Err(EngineError::EngineUnavailable("no live engine instance".into()))
                }
            }
        };

        let handle = engine
            .create_session()
            .await
            .map_err(|e| EngineError::EngineUnavailable(format!("session creation failed: {}", e)))?;

        let id = self.next_session_id.fetch_add(1, Ordering::AcqRel) + 1;
        let session = Arc::new(TrackedSession::new(id, generation, handle));
        self.tracked.insert(id, Arc::clone(&session));

        // The instance may have been replaced while the engine was working
        if !self.is_current(generation) {
            self.destroy_session(&session).await;
            return Err(EngineError::EngineUnavailable(
                "engine restarted during session creation".into(),
            ));
        }

        metrics::counter!("solver_sessions_created_total").increment(1);
        debug!(session_id = id, generation, handle = session.engine_handle(), "Session created");
        Ok(session)
    }

    /// Close a session and stop tracking it
    pub async fn destroy_session(&self, session: &Arc<TrackedSession>) {
        self.tracked.remove(&session.id());
        session.close().await;
    }

    /// Whether sessions of `generation` belong to the live instance
    pub fn is_current(&self, generation: u64) -> bool {
        let slot = self.engine.read();
        slot.is_some() && self.generation.load(Ordering::Acquire) == generation
    }

    pub fn current_engine(&self) -> Option<Arc<dyn AutomationEngine>> {
        self.engine.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Whether a live instance can create sessions right now
    pub fn is_ready(&self) -> bool {
        !self.is_finished() && self.engine.read().is_some() && self.state() == EngineState::Running
    }

    /// Wait until an instance is running, up to `timeout`
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == EngineState::Running))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn tracked_sessions(&self) -> Vec<Arc<TrackedSession>> {
        self.tracked.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Tear down the live instance and launch a fresh one
    pub fn restart(&self) {
        if !self.is_finished() {
            self.restart_requested.notify_one();
        }
    }

    /// Stop supervising, close every session and the engine
    ///
    /// Idempotent; safe to call from a signal handler task.
    pub async fn shutdown(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(tracked = self.tracked_count(), "Shutting down engine supervisor");
        self.cancel.cancel();
        self.state.send_replace(EngineState::Stopped);

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Supervisor loop ended abnormally");
            }
        }

        self.teardown(true).await;
        info!("Engine supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::simulated::{SimulatedControl, SimulatedLauncher};

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            launch_timeout: Duration::from_secs(5),
            relaunch_backoff: Duration::from_millis(50),
            quiesce_delay: Duration::from_millis(50),
        }
    }

    fn supervisor(control: &Arc<SimulatedControl>) -> Arc<EngineSupervisor> {
        EngineSupervisor::new(Arc::new(SimulatedLauncher::new(Arc::clone(control))), fast_config())
    }

    #[tokio::test]
    async fn test_launch_and_track_sessions() {
        let control = SimulatedControl::new();
        let supervisor = supervisor(&control);
        assert!(!supervisor.is_ready());

        assert!(supervisor.launch().await);
        assert!(supervisor.is_ready());
        assert_eq!(supervisor.generation(), 1);

        let session = supervisor.create_session().await.unwrap();
        assert_eq!(supervisor.tracked_count(), 1);
        assert_eq!(session.generation(), 1);

        supervisor.destroy_session(&session).await;
        assert_eq!(supervisor.tracked_count(), 0);
        assert_eq!(control.sessions_live(), 0);
    }

    #[tokio::test]
    async fn test_create_without_engine_is_unavailable() {
        let control = SimulatedControl::new();
        let supervisor = supervisor(&control);

        let result = supervisor.create_session().await;
        assert!(matches!(result, Err(EngineError::EngineUnavailable(_))));
    }

    #[tokio::test]
    async fn test_launch_failure_is_retried() {
        let control = SimulatedControl::new();
        control.fail_next_launches(2);
        let supervisor = supervisor(&control);

        supervisor.start();
        assert!(supervisor.wait_ready(Duration::from_secs(2)).await);
        assert_eq!(control.launches(), 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_closes_sessions_and_relaunches() {
        let control = SimulatedControl::new();
        let supervisor = supervisor(&control);
        supervisor.start();
        assert!(supervisor.wait_ready(Duration::from_secs(2)).await);

        let old = supervisor.create_session().await.unwrap();
        let old_generation = old.generation();

        control.crash();

        // Teardown happens first; the stale session is closed and untracked
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(old.is_closed());
        assert!(!supervisor.is_current(old_generation));

        let relaunched = tokio::time::timeout(Duration::from_secs(2), async {
            while control.launches() < 2 || !supervisor.is_ready() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(relaunched.is_ok());

        let fresh = supervisor.create_session().await.unwrap();
        assert!(fresh.generation() > old_generation);
        assert_eq!(supervisor.tracked_count(), 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_replaces_instance() {
        let control = SimulatedControl::new();
        let supervisor = supervisor(&control);
        supervisor.start();
        assert!(supervisor.wait_ready(Duration::from_secs(2)).await);

        let session = supervisor.create_session().await.unwrap();
        supervisor.restart();

        let relaunched = tokio::time::timeout(Duration::from_secs(2), async {
            while control.launches() < 2 || !supervisor.is_ready() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(relaunched.is_ok());
        assert!(session.is_closed());
        assert_eq!(supervisor.generation(), 2);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let control = SimulatedControl::new();
        let supervisor = supervisor(&control);
        supervisor.start();
        assert!(supervisor.wait_ready(Duration::from_secs(2)).await);
        let _session = supervisor.create_session().await.unwrap();

        supervisor.shutdown().await;
        supervisor.shutdown().await;

        assert_eq!(supervisor.state(), EngineState::Stopped);
        assert!(!supervisor.is_ready());
        assert_eq!(control.sessions_live(), 0);
        assert!(matches!(
            supervisor.create_session().await,
            Err(EngineError::EngineUnavailable(_))
        ));

        // No relaunch after shutdown
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(control.launches(), 1);
    }
}
