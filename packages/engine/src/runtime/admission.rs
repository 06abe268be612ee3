// packages/engine/src/runtime/admission.rs
//! Admission control in front of the session pool
//!
//! A single atomic counter of in-flight tasks against a ceiling. Admission
//! never waits: a task over the ceiling is rejected before it touches the
//! pool. Every successful admission must be paired with exactly one
//! departure, which [`AdmissionGuard`] does on drop.

use crate::utils::config::AdmissionSection;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionState {
    /// Below the ceiling
    Open,
    /// At the ceiling; admissions fail until a task departs
    Saturated,
}

/// How an admitted task finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed,
}

/// In-flight task counter with a fixed ceiling
pub struct ConcurrencyGovernor {
    max_concurrent: usize,
    active: AtomicUsize,

    admitted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    last_task_at: Mutex<Option<DateTime<Utc>>>,
}

impl ConcurrencyGovernor {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            active: AtomicUsize::new(0),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_task_at: Mutex::new(None),
        }
    }

    pub fn from_config(section: &AdmissionSection) -> Self {
        Self::new(section.max_concurrent_tasks)
    }

    /// Try to admit a task
    ///
    /// Returns false immediately when the ceiling is reached.
    pub fn admit(&self) -> bool {
        let max = self.max_concurrent;
        let result = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < max).then_some(active + 1)
            });

        match result {
            Ok(previous) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                *self.last_task_at.lock() = Some(Utc::now());
                metrics::counter!("solver_tasks_admitted_total").increment(1);
                metrics::gauge!("solver_tasks_active").set((previous + 1) as f64);
                true
            }
            Err(active) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("solver_tasks_rejected_total").increment(1);
                debug!(active, max, "Task rejected at admission");
                false
            }
        }
    }

    /// Mark an admitted task as finished
    pub fn depart(&self) {
        let result = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| active.checked_sub(1));

        match result {
            Ok(previous) => {
                metrics::gauge!("solver_tasks_active").set((previous - 1) as f64);
            }
            Err(_) => error!("depart() called with no task in flight"),
        }
    }

    /// Admit a task and get a guard that departs when dropped
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionGuard> {
        self.admit().then(|| AdmissionGuard {
            governor: Arc::clone(self),
        })
    }

    /// Count a finished task towards the success rate
    pub fn record_outcome(&self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Succeeded => self.succeeded.fetch_add(1, Ordering::Relaxed),
            TaskOutcome::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn state(&self) -> AdmissionState {
        if self.active() < self.max_concurrent {
            AdmissionState::Open
        } else {
            AdmissionState::Saturated
        }
    }

    /// When the most recent task was admitted
    pub fn last_task_at(&self) -> Option<DateTime<Utc>> {
        *self.last_task_at.lock()
    }

    pub fn stats(&self) -> AdmissionStats {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let finished = succeeded + failed;

        AdmissionStats {
            state: self.state(),
            active: self.active(),
            max_concurrent: self.max_concurrent,
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            succeeded,
            failed,
            success_rate: if finished > 0 {
                succeeded as f64 / finished as f64
            } else {
                1.0
            },
            last_task_at: self.last_task_at(),
        }
    }
}

/// Departs on drop
#[must_use = "dropping the guard departs immediately"]
pub struct AdmissionGuard {
    governor: Arc<ConcurrencyGovernor>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.governor.depart();
    }
}

/// Admission statistics
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub state: AdmissionState,
    pub active: usize,
    pub max_concurrent: usize,
    pub admitted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Succeeded over finished; 1.0 before any task finished
    pub success_rate: f64,
    pub last_task_at: Option<DateTime<Utc>>,
}
