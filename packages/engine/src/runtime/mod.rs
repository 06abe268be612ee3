// packages/engine/src/runtime/mod.rs
//! Session runtime
//!
//! This module provides the core of the solver service:
//!
//! - **Engine Supervisor**: Launches the automation engine, relaunches it on
//!   disconnect, tracks every session created from it
//! - **Session Pool**: Bounded reuse of engine sessions with FIFO waiters,
//!   hand-off on release and recycling
//! - **Admission**: Fail-fast ceiling on in-flight tasks
//! - **Memory Governor**: Process memory sampling and pressure reactions
//! - **Process Manager / Browser**: Chromium process plus CDP-driven contexts
//! - **Simulated**: In-memory engine for development and tests
//! - **Service**: The facade handed to task handlers
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      SolverRuntime                        │
//! │                                                           │
//! │  task ──► ConcurrencyGovernor ──► SessionPool ──► solver  │
//! │                                       │                   │
//! │                                       ▼                   │
//! │   MemoryGovernor ──shed──►     EngineSupervisor           │
//! │                                       │                   │
//! │                          ┌────────────┴──────────┐        │
//! │                          │  Engine (browser)     │        │
//! │                          │  ┌─────┐ ┌─────┐      │        │
//! │                          │  │ ctx │ │ ctx │ ...  │        │
//! │                          │  └─────┘ └─────┘      │        │
//! │                          └───────────────────────┘        │
//! └───────────────────────────────────────────────────────────┘
//! ```

pub mod admission;
pub mod browser;
pub mod engine;
pub mod memory_governor;
pub mod process_manager;
pub mod service;
pub mod session;
pub mod session_pool;
pub mod simulated;
pub mod supervisor;

// Re-export commonly used types
pub use admission::{AdmissionGuard, AdmissionState, AdmissionStats, ConcurrencyGovernor, TaskOutcome};
pub use browser::{BrowserEngine, BrowserLauncher, BrowserSession};
pub use engine::{AutomationEngine, DisconnectNotifier, DisconnectSignal, EngineLauncher, EngineSession};
pub use memory_governor::{
    GcTrigger, MallocTrim, MemoryGovernor, MemoryGovernorConfig, MemoryReading, MemoryReclaimer,
    MemorySampler, PressureLevel, ProcfsSampler,
};
pub use process_manager::{ProcessManager, SpawnConfig};
pub use service::{RuntimeStats, SolverRuntime};
pub use session::{SessionState, TrackedSession, WorkerSession};
pub use session_pool::{PoolConfig, PoolStats, SessionPool};
pub use simulated::{SimulatedControl, SimulatedLauncher};
pub use supervisor::{EngineState, EngineSupervisor, SupervisorConfig};
