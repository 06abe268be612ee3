// packages/engine/src/runtime/simulated.rs
//! In-memory automation engine
//!
//! Behaves like a browser from the core's point of view (sessions, resets,
//! disconnects) without launching anything. Used by the `simulated` backend
//! for local runs and by the test suites, which steer it through
//! [`SimulatedControl`]: failing launches, session creation or resets, and
//! crashing the live instance.

use crate::runtime::engine::{
    AutomationEngine, DisconnectNotifier, DisconnectSignal, EngineLauncher, EngineSession,
};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Knobs and counters shared by a launcher and every engine it starts
#[derive(Default)]
pub struct SimulatedControl {
    fail_launches: AtomicUsize,
    fail_session_creation: AtomicBool,
    fail_resets: AtomicBool,
    launches: AtomicUsize,
    sessions_created: AtomicUsize,
    sessions_live: AtomicUsize,
    resets: AtomicUsize,
    create_delay: Mutex<Duration>,
    current: Mutex<Weak<SimulatedEngine>>,
}

impl SimulatedControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` launches fail
    pub fn fail_next_launches(&self, count: usize) {
        self.fail_launches.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_session_creation(&self, fail: bool) {
        self.fail_session_creation.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_resets(&self, fail: bool) {
        self.fail_resets.store(fail, Ordering::SeqCst);
    }

    /// Make context creation take `delay`, like a busy browser
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    /// Successful launches so far
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    /// Sessions created and not yet closed
    pub fn sessions_live(&self) -> usize {
        self.sessions_live.load(Ordering::SeqCst)
    }

    /// Successful session resets so far
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Simulate the engine process dying
    pub fn crash(&self) {
        let current = self.current.lock().upgrade();
        if let Some(engine) = current {
            debug!(instance = engine.instance, "Simulated engine crash");
            engine.notifier.notify();
        }
    }
}

/// Launcher for [`SimulatedEngine`] instances
pub struct SimulatedLauncher {
    control: Arc<SimulatedControl>,
}

impl SimulatedLauncher {
    pub fn new(control: Arc<SimulatedControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl EngineLauncher for SimulatedLauncher {
    async fn launch(&self) -> Result<Arc<dyn AutomationEngine>> {
        let pending_failures = self
            .control
            .fail_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending_failures.is_ok() {
            return Err(EngineError::LaunchFailed("simulated launch failure".into()));
        }

        let instance = self.control.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let engine = Arc::new(SimulatedEngine {
            instance,
            control: Arc::clone(&self.control),
            notifier: DisconnectNotifier::new(),
            closed: AtomicBool::new(false),
        });
        *self.control.current.lock() = Arc::downgrade(&engine);

        Ok(engine)
    }
}

/// One simulated engine instance
pub struct SimulatedEngine {
    instance: usize,
    control: Arc<SimulatedControl>,
    notifier: DisconnectNotifier,
    closed: AtomicBool,
}

#[async_trait]
impl AutomationEngine for SimulatedEngine {
    async fn create_session(&self) -> Result<Box<dyn EngineSession>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::EngineUnavailable("engine is closed".into()));
        }
        if self.notifier.is_disconnected() {
            return Err(EngineError::EngineCrashed(format!("simulated instance {}", self.instance)));
        }
        let delay = *self.control.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.control.fail_session_creation.load(Ordering::SeqCst) {
            return Err(EngineError::Session("simulated context creation failure".into()));
        }

        self.control.sessions_created.fetch_add(1, Ordering::SeqCst);
        self.control.sessions_live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(SimulatedSession {
            handle: format!("sim-{}-{}", self.instance, ulid::Ulid::new()),
            control: Arc::clone(&self.control),
            closed: AtomicBool::new(false),
        }))
    }

    fn disconnect_signal(&self) -> DisconnectSignal {
        self.notifier.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.notifier.notify();
        }
        Ok(())
    }
}

/// A simulated context
pub struct SimulatedSession {
    handle: String,
    control: Arc<SimulatedControl>,
    closed: AtomicBool,
}

#[async_trait]
impl EngineSession for SimulatedSession {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn reset(&self) -> Result<()> {
        if self.control.fail_resets.load(Ordering::SeqCst) {
            return Err(EngineError::Session("simulated reset failure".into()));
        }
        self.control.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.control.sessions_live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl SimulatedSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
