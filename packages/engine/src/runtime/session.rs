// packages/engine/src/runtime/session.rs
//! Worker sessions
//!
//! A [`TrackedSession`] is the supervisor's record of one engine context: its
//! identity, the engine generation it belongs to, its usage count and its
//! state. The pool hands callers a [`WorkerSession`], a move-only lease on a
//! tracked session. Because the lease is not `Clone` and `release` consumes
//! it, a session can only ever be held by one caller at a time.

use crate::runtime::engine::EngineSession;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Available,
    InUse,
    Closing,
}

/// Supervisor-side record of an engine context
pub struct TrackedSession {
    /// Pool-local identity
    id: u64,

    /// Generation of the engine instance that owns the context
    generation: u64,

    /// The engine context itself
    handle: Box<dyn EngineSession>,

    /// Number of acquisitions so far
    usage: AtomicU64,

    state: Mutex<SessionState>,

    closed: AtomicBool,
}

impl TrackedSession {
    pub(crate) fn new(id: u64, generation: u64, handle: Box<dyn EngineSession>) -> Self {
        Self {
            id,
            generation,
            handle,
            usage: AtomicU64::new(0),
            state: Mutex::new(SessionState::Available),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn engine_handle(&self) -> &str {
        self.handle.handle()
    }

    pub fn usage_count(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }

    pub(crate) fn record_use(&self) -> u64 {
        self.usage.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[cfg(test)]
    pub(crate) fn set_usage(&self, usage: u64) {
        self.usage.store(usage, Ordering::Release);
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) async fn reset(&self) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::SessionCorrupted(format!(
                "session {} is already closed",
                self.id
            )));
        }
        self.handle.reset().await
    }

    /// Close the engine context
    ///
    /// Only the first call reaches the engine. Errors are logged and swallowed.
    pub(crate) async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.set_state(SessionState::Closing);

        match self.handle.close().await {
            Ok(()) => debug!(session_id = self.id, "Session closed"),
            Err(e) => warn!(session_id = self.id, error = %e, "Error closing session"),
        }
        true
    }
}

impl fmt::Debug for TrackedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedSession")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("handle", &self.handle.handle())
            .field("usage", &self.usage_count())
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A session checked out of the pool
///
/// Hand it back with `SessionPool::release`. Dropping it without releasing
/// leaks a pool slot until the engine is relaunched.
#[must_use = "a worker session must be released back to the pool"]
#[derive(Debug)]
pub struct WorkerSession {
    entry: Arc<TrackedSession>,
}

impl WorkerSession {
    pub(crate) fn new(entry: Arc<TrackedSession>) -> Self {
        entry.set_state(SessionState::InUse);
        Self { entry }
    }

    pub(crate) fn into_entry(self) -> Arc<TrackedSession> {
        self.entry
    }

    #[cfg(test)]
    pub(crate) fn entry(&self) -> &Arc<TrackedSession> {
        &self.entry
    }

    pub fn id(&self) -> u64 {
        self.entry.id()
    }

    /// Engine-assigned context identity, used to drive the context
    pub fn handle(&self) -> &str {
        self.entry.engine_handle()
    }

    /// The backend's own context type, for solvers that drive it directly
    ///
    /// Returns `None` when the session belongs to a different backend.
    pub fn context<T: EngineSession + 'static>(&self) -> Option<&T> {
        self.entry.handle.as_any().downcast_ref::<T>()
    }

    pub fn usage_count(&self) -> u64 {
        self.entry.usage_count()
    }

    pub fn generation(&self) -> u64 {
        self.entry.generation()
    }

    /// False once the context was closed underneath the holder (engine crash,
    /// memory shedding)
    pub fn is_usable(&self) -> bool {
        !self.entry.is_closed()
    }
}
