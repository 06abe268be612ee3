// packages/engine/src/runtime/session_pool.rs
//! Session pool multiplexing a bounded set of engine sessions across tasks
//!
//! # Architecture
//!
//! ```text
//! SessionPool
//! ├─ Available: [S1(3 uses), S2(7 uses), ...]   (idle, least-used first out)
//! ├─ Used: n                                    (checked out or being created)
//! └─ Waiters: [T1, T2, ...]                     (FIFO, each with a deadline)
//! ```
//!
//! `used + available.len() <= max_size` holds at every instant: a slot is
//! reserved under the pool lock before a session is created, and returned if
//! creation fails.
//!
//! On release a session is, in order of precedence: destroyed if its engine
//! is gone, destroyed if it reached the recycle threshold, destroyed if its
//! cleanup fails, handed straight to the oldest waiter, or parked in
//! `available`. Destroying a session frees a slot, which goes to the oldest
//! waiter as a permission to create a fresh session.
//!
//! A waiter is resolved exactly once: either a releaser pops it and sends a
//! grant, or the waiter removes itself on timeout or cancellation. Both
//! happen under the pool lock, so whichever runs first wins and the other
//! finds nothing to do.

use crate::runtime::session::{SessionState, TrackedSession, WorkerSession};
use crate::runtime::supervisor::EngineSupervisor;
use crate::utils::config::PoolSection;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the session pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Ceiling on checked-out plus idle sessions (default: 20)
    pub max_size: usize,

    /// How long a saturated acquire waits (default: 30s)
    pub acquire_timeout: Duration,

    /// Sessions are destroyed on release once they reach this many uses
    /// (default: 100)
    pub recycle_threshold: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSection::default())
    }
}

impl From<&PoolSection> for PoolConfig {
    fn from(section: &PoolSection) -> Self {
        Self {
            max_size: section.max_size,
            acquire_timeout: section.acquire_timeout(),
            recycle_threshold: section.recycle_threshold,
        }
    }
}

/// What a releaser hands to a waiter
#[derive(Debug)]
enum Grant {
    /// A cleaned session, ready to use
    Session(Arc<TrackedSession>),
    /// A reserved slot; the waiter creates its own session
    Slot,
    /// The hand-off cleanup failed; the waiter must retry
    Failed,
}

impl Grant {
    fn reserves_slot(&self) -> bool {
        !matches!(self, Grant::Failed)
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct PoolState {
    available: Vec<Arc<TrackedSession>>,
    waiters: VecDeque<Waiter>,
    used: usize,
}

impl PoolState {
    fn total(&self) -> usize {
        self.used + self.available.len()
    }
}

enum Decision {
    Reuse(Arc<TrackedSession>),
    Create,
    Wait(u64, oneshot::Receiver<Grant>),
}

enum WaitEnd {
    Granted(Grant),
    TimedOut,
    Cancelled,
    Closed,
}

/// Pool of engine sessions
pub struct SessionPool {
    config: PoolConfig,
    supervisor: Arc<EngineSupervisor>,
    state: Mutex<PoolState>,
    next_waiter_id: AtomicU64,
}

impl SessionPool {
    /// Create a pool drawing sessions from `supervisor`
    pub fn new(supervisor: Arc<EngineSupervisor>, config: PoolConfig) -> Self {
        info!(
            max_size = config.max_size,
            recycle_threshold = config.recycle_threshold,
            "Initializing session pool"
        );

        Self {
            config,
            supervisor,
            state: Mutex::new(PoolState::default()),
            next_waiter_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire a session (waits if the pool is saturated)
    ///
    /// Fails with `EngineUnavailable` when no engine can create a session,
    /// `PoolTimeout` after waiting `acquire_timeout`, and `Cancelled` when
    /// `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<WorkerSession> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let (stale, decision) = {
            let mut state = self.state.lock();
            let stale = self.prune_stale(&mut state);

            let decision = if let Some(index) = least_used(&state.available) {
                let session = state.available.remove(index);
                state.used += 1;
                Decision::Reuse(session)
            } else if state.total() < self.config.max_size {
                state.used += 1;
                Decision::Create
            } else {
                let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter { id, tx });
                debug!(
                    used = state.used,
                    waiting = state.waiters.len(),
                    "Session pool full, waiting for a session"
                );
                Decision::Wait(id, rx)
            };

            publish_gauges(&state);
            (stale, decision)
        };

        // Held capacity goes back to the pool if this future is dropped below
        let mut reservation = Reservation {
            pool: self,
            grant: match &decision {
                Decision::Reuse(session) => Some(Grant::Session(Arc::clone(session))),
                Decision::Create => Some(Grant::Slot),
                Decision::Wait(..) => None,
            },
        };

        for session in stale {
            self.supervisor.destroy_session(&session).await;
            metrics::counter!("solver_sessions_destroyed_total", "reason" => "stale").increment(1);
        }

        match decision {
            Decision::Reuse(session) => {
                reservation.disarm();
                let usage = session.record_use();
                metrics::counter!("solver_sessions_reused_total").increment(1);
                debug!(session_id = session.id(), usage, "Reusing session");
                Ok(WorkerSession::new(session))
            }
            Decision::Create => self.create_in_slot(reservation).await,
            Decision::Wait(id, rx) => self.wait_for_grant(id, rx, cancel).await,
        }
    }

    /// Create a session into a slot the caller already reserved
    ///
    /// The slot is returned to the pool if creation fails or the future is
    /// dropped before it completes.
    async fn create_in_slot(&self, mut reservation: Reservation<'_>) -> Result<WorkerSession> {
        match self.supervisor.create_session().await {
            Ok(session) => {
                reservation.disarm();
                let usage = session.record_use();
                debug!(session_id = session.id(), usage, "Created session");
                Ok(WorkerSession::new(session))
            }
            Err(e) => {
                warn!(error = %e, "Failed to create session");
                drop(reservation);
                Err(e)
            }
        }
    }

    async fn wait_for_grant(
        &self,
        id: u64,
        rx: oneshot::Receiver<Grant>,
        cancel: &CancellationToken,
    ) -> Result<WorkerSession> {
        let timeout = self.config.acquire_timeout;
        let mut pending = PendingWaiter {
            pool: self,
            id,
            rx,
            armed: true,
        };

        let end = tokio::select! {
            received = tokio::time::timeout(timeout, &mut pending.rx) => match received {
                Ok(Ok(grant)) => WaitEnd::Granted(grant),
                Ok(Err(_)) => WaitEnd::Closed,
                Err(_) => WaitEnd::TimedOut,
            },
            _ = cancel.cancelled() => WaitEnd::Cancelled,
        };
        pending.armed = false;

        let end = match end {
            WaitEnd::TimedOut => match self.withdraw(id, &mut pending.rx) {
                // A releaser got there first; take what it sent
                Some(grant) => WaitEnd::Granted(grant),
                None => WaitEnd::TimedOut,
            },
            WaitEnd::Cancelled => {
                if let Some(grant) = self.withdraw(id, &mut pending.rx) {
                    self.restore_grant(grant);
                }
                WaitEnd::Cancelled
            }
            other => other,
        };

        match end {
            WaitEnd::Granted(Grant::Session(session)) => {
                let usage = session.record_use();
                metrics::counter!("solver_session_handoffs_total").increment(1);
                debug!(session_id = session.id(), usage, "Session handed to waiter");
                Ok(WorkerSession::new(session))
            }
            WaitEnd::Granted(Grant::Slot) => {
                let reservation = Reservation {
                    pool: self,
                    grant: Some(Grant::Slot),
                };
                self.create_in_slot(reservation).await
            }
            WaitEnd::Granted(Grant::Failed) => Err(EngineError::HandoffFailed),
            WaitEnd::TimedOut => {
                metrics::counter!("solver_pool_timeouts_total").increment(1);
                warn!(timeout = ?timeout, "Timed out waiting for a session");
                Err(EngineError::PoolTimeout(timeout))
            }
            WaitEnd::Cancelled => Err(EngineError::Cancelled),
            WaitEnd::Closed => Err(EngineError::EngineUnavailable("session pool drained".into())),
        }
    }

    /// Remove a waiter from the queue
    ///
    /// Returns the grant if a releaser already popped the waiter.
    fn withdraw(&self, id: u64, rx: &mut oneshot::Receiver<Grant>) -> Option<Grant> {
        {
            let mut state = self.state.lock();
            if let Some(position) = state.waiters.iter().position(|waiter| waiter.id == id) {
                state.waiters.remove(position);
                publish_gauges(&state);
                return None;
            }
        }
        // Popped waiters are sent their grant inside the same critical section
        rx.try_recv().ok()
    }

    /// Put back a grant whose waiter is no longer interested
    fn restore_grant(&self, grant: Grant) {
        let mut state = self.state.lock();
        if grant.reserves_slot() {
            state.used = state.used.saturating_sub(1);
        }
        if let Grant::Session(session) = grant {
            if let Some(Grant::Session(session)) = self.hand_off(&mut state, Grant::Session(session)) {
                session.set_state(SessionState::Available);
                state.available.push(session);
            }
        }
        self.grant_free_slots(&mut state);
        publish_gauges(&state);
    }

    /// Return a session to the pool
    pub async fn release(&self, session: WorkerSession) {
        let session = session.into_entry();
        let usage = session.usage_count();

        if session.is_closed() || !self.supervisor.is_current(session.generation()) {
            debug!(session_id = session.id(), "Discarding session of a torn-down engine");
            self.destroy(session, "stale").await;
            return;
        }

        if usage >= self.config.recycle_threshold {
            info!(session_id = session.id(), usage, "Recycling session after heavy use");
            self.destroy(session, "recycled").await;
            self.replenish().await;
            return;
        }

        if let Err(e) = session.reset().await {
            warn!(session_id = session.id(), error = %e, "Session cleanup failed, destroying it");
            self.destroy_corrupted(session).await;
            return;
        }

        let mut state = self.state.lock();
        state.used = state.used.saturating_sub(1);
        if let Some(Grant::Session(session)) = self.hand_off(&mut state, Grant::Session(session)) {
            debug!(session_id = session.id(), usage, "Session returned to pool");
            session.set_state(SessionState::Available);
            state.available.push(session);
        }
        publish_gauges(&state);
    }

    /// Give `grant` to the oldest live waiter
    ///
    /// Returns the grant if nobody is waiting.
    fn hand_off(&self, state: &mut PoolState, mut grant: Grant) -> Option<Grant> {
        while let Some(waiter) = state.waiters.pop_front() {
            let reserves = grant.reserves_slot();
            if reserves {
                state.used += 1;
            }
            match waiter.tx.send(grant) {
                Ok(()) => return None,
                Err(returned) => {
                    // The waiting task is gone
                    if reserves {
                        state.used -= 1;
                    }
                    grant = returned;
                }
            }
        }
        Some(grant)
    }

    /// Hand free capacity to waiters as creation slots
    fn grant_free_slots(&self, state: &mut PoolState) {
        while !state.waiters.is_empty() && state.total() < self.config.max_size {
            if self.hand_off(state, Grant::Slot).is_some() {
                break;
            }
        }
    }

    /// Close a checked-out session and free its slot
    async fn destroy(&self, session: Arc<TrackedSession>, reason: &'static str) {
        self.supervisor.destroy_session(&session).await;
        metrics::counter!("solver_sessions_destroyed_total", "reason" => reason).increment(1);

        let mut state = self.state.lock();
        state.used = state.used.saturating_sub(1);
        self.grant_free_slots(&mut state);
        publish_gauges(&state);
    }

    /// Close a session whose cleanup failed; the oldest waiter is failed
    async fn destroy_corrupted(&self, session: Arc<TrackedSession>) {
        self.supervisor.destroy_session(&session).await;
        metrics::counter!("solver_sessions_destroyed_total", "reason" => "corrupted").increment(1);

        let mut state = self.state.lock();
        state.used = state.used.saturating_sub(1);
        if !state.waiters.is_empty() {
            self.hand_off(&mut state, Grant::Failed);
        }
        self.grant_free_slots(&mut state);
        publish_gauges(&state);
    }

    /// Create one idle replacement when the pool has run low
    async fn replenish(&self) {
        let reserved = {
            let mut state = self.state.lock();
            let low = state.available.len() < self.config.max_size / 2;
            if low && state.waiters.is_empty() && state.total() < self.config.max_size {
                state.used += 1;
                true
            } else {
                false
            }
        };
        if !reserved {
            return;
        }

        let created = self.supervisor.create_session().await;

        let mut state = self.state.lock();
        state.used = state.used.saturating_sub(1);
        match created {
            Ok(session) => {
                debug!(session_id = session.id(), "Created replacement for recycled session");
                if let Some(Grant::Session(session)) = self.hand_off(&mut state, Grant::Session(session)) {
                    state.available.push(session);
                }
            }
            Err(e) => {
                debug!(error = %e, "Could not create replacement session");
                self.grant_free_slots(&mut state);
            }
        }
        publish_gauges(&state);
    }

    /// Remove idle sessions whose engine is gone
    fn prune_stale(&self, state: &mut PoolState) -> Vec<Arc<TrackedSession>> {
        let mut stale = Vec::new();
        state.available.retain(|session| {
            let usable = !session.is_closed() && self.supervisor.is_current(session.generation());
            if !usable {
                stale.push(Arc::clone(session));
            }
            usable
        });
        stale
    }

    /// Close up to `count` tracked sessions, idle ones first
    ///
    /// Checked-out sessions picked here are closed underneath their holder;
    /// their slot is freed when the holder releases them.
    pub async fn shed(&self, count: usize) -> usize {
        if count == 0 {
            return 0;
        }

        let idle: Vec<Arc<TrackedSession>> = {
            let mut state = self.state.lock();
            let take = count.min(state.available.len());
            let idle = state.available.drain(..take).collect();
            publish_gauges(&state);
            idle
        };

        let mut victims = idle.len();
        for session in &idle {
            self.supervisor.destroy_session(session).await;
        }

        if victims < count {
            let busy: Vec<Arc<TrackedSession>> = self
                .supervisor
                .tracked_sessions()
                .into_iter()
                .filter(|session| session.state() == SessionState::InUse && !session.is_closed())
                .take(count - victims)
                .collect();
            for session in &busy {
                self.supervisor.destroy_session(session).await;
            }
            victims += busy.len();
        }

        {
            let mut state = self.state.lock();
            self.grant_free_slots(&mut state);
            publish_gauges(&state);
        }

        metrics::counter!("solver_sessions_destroyed_total", "reason" => "shed").increment(victims as u64);
        info!(closed = victims, idle = idle.len(), "Shed sessions");
        victims
    }

    /// Close a fraction of tracked sessions when the pool runs hot
    ///
    /// Runs only when tracked sessions exceed `high_water` of `max_size`.
    pub async fn sweep(&self, high_water: f64, fraction: f64) -> usize {
        let tracked = self.supervisor.tracked_count();
        debug!(tracked, "Periodic session sweep");

        if (tracked as f64) <= high_water * self.config.max_size as f64 {
            return 0;
        }

        let count = (tracked as f64 * fraction).floor() as usize;
        self.shed(count).await
    }

    /// Close every idle session and fail every waiter
    pub async fn drain(&self) -> usize {
        let idle: Vec<Arc<TrackedSession>> = {
            let mut state = self.state.lock();
            // Dropping the senders resolves every waiter with `Closed`
            state.waiters.clear();
            let idle = state.available.drain(..).collect();
            publish_gauges(&state);
            idle
        };

        for session in &idle {
            self.supervisor.destroy_session(session).await;
        }

        info!(closed = idle.len(), "Session pool drained");
        idle.len()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            max_size: self.config.max_size,
            used: state.used,
            available: state.available.len(),
            waiting: state.waiters.len(),
            tracked: self.supervisor.tracked_count(),
        }
    }
}

/// Cleans up after an acquire future dropped while queued
struct PendingWaiter<'a> {
    pool: &'a SessionPool,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    armed: bool,
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(grant) = self.pool.withdraw(self.id, &mut self.rx) {
            self.pool.restore_grant(grant);
        }
    }
}

/// Capacity taken from the pool on behalf of an acquire still in progress
struct Reservation<'a> {
    pool: &'a SessionPool,
    grant: Option<Grant>,
}

impl Reservation<'_> {
    /// The capacity reached its caller
    fn disarm(&mut self) {
        self.grant = None;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(grant) = self.grant.take() {
            self.pool.restore_grant(grant);
        }
    }
}

/// Index of the idle session with the fewest uses (first one on ties)
fn least_used(available: &[Arc<TrackedSession>]) -> Option<usize> {
    available
        .iter()
        .enumerate()
        .min_by_key(|(_, session)| session.usage_count())
        .map(|(index, _)| index)
}

fn publish_gauges(state: &PoolState) {
    metrics::gauge!("solver_pool_used").set(state.used as f64);
    metrics::gauge!("solver_pool_available").set(state.available.len() as f64);
    metrics::gauge!("solver_pool_waiting").set(state.waiters.len() as f64);
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub used: usize,
    pub available: usize,
    pub waiting: usize,
    /// Sessions the supervisor is tracking (includes closed-but-unreleased)
    pub tracked: usize,
}

impl PoolStats {
    /// Checked-out plus idle sessions
    pub fn total(&self) -> usize {
        self.used + self.available
    }
}
