// packages/engine/src/runtime/process_manager.rs
//! Process manager for spawning and stopping browser processes
//!
//! Resolves the browser executable (configured path, else the first of the
//! usual Chromium/Chrome names on `PATH`), spawns it with piped output, and
//! stops it with SIGTERM followed by SIGKILL.

use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Executable names tried on `PATH`, in order
pub const BROWSER_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
];

/// Configuration for spawning a process
#[derive(Debug, Clone, Default)]
pub struct SpawnConfig {
    /// Command-line arguments
    pub args: Vec<String>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Environment variables
    pub env_vars: Vec<(String, String)>,
}

/// Process manager for browser processes
pub struct ProcessManager {
    /// Explicitly configured executable
    configured: Option<PathBuf>,

    /// Resolved executable (cached)
    executable_path: Mutex<Option<PathBuf>>,
}

impl ProcessManager {
    /// Create a new process manager
    pub fn new(configured: Option<PathBuf>) -> Self {
        Self {
            configured,
            executable_path: Mutex::new(None),
        }
    }

    /// Find the browser executable
    pub fn find_executable(&self) -> Result<PathBuf> {
        // Check cache first
        if let Some(path) = self.executable_path.lock().as_ref() {
            return Ok(path.clone());
        }

        let path = match &self.configured {
            Some(path) => {
                if !path.is_file() {
                    return Err(EngineError::ProcessSpawnFailed(format!(
                        "configured executable {:?} does not exist",
                        path
                    )));
                }
                path.clone()
            }
            None => search_path(BROWSER_CANDIDATES)?,
        };

        info!(executable = ?path, "Found browser executable");
        *self.executable_path.lock() = Some(path.clone());
        Ok(path)
    }

    /// Spawn the executable with `config`
    pub async fn spawn(&self, config: SpawnConfig) -> Result<Child> {
        let executable = self.find_executable()?;

        debug!(executable = ?executable, args = config.args.len(), "Spawning process");

        let mut command = Command::new(&executable);
        command.args(&config.args);

        if let Some(work_dir) = &config.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &config.env_vars {
            command.env(key, value);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            EngineError::ProcessSpawnFailed(format!("failed to spawn {:?}: {}", executable, e))
        })?;

        debug!(pid = ?child.id(), "Process spawned");

        Ok(child)
    }

    /// Stop a process: SIGTERM, then SIGKILL if it outlives `grace`
    pub async fn kill(&self, pid: u32, grace: Duration) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(pid as i32);

        debug!(%pid, "Sending SIGTERM");
        kill(pid, Signal::SIGTERM).map_err(|e| EngineError::Io(e.into()))?;

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if kill(pid, None).is_err() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if kill(pid, None).is_ok() {
            debug!(%pid, "Process still alive, sending SIGKILL");
            kill(pid, Signal::SIGKILL).map_err(|e| EngineError::Io(e.into()))?;
        }

        Ok(())
    }

    /// Check if a process is running
    pub fn is_running(&self, pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(None)
    }
}

fn search_path(candidates: &[&str]) -> Result<PathBuf> {
    candidates
        .iter()
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| {
            EngineError::ProcessSpawnFailed(format!(
                "no browser executable found in PATH (tried {})",
                candidates.join(", ")
            ))
        })
}
