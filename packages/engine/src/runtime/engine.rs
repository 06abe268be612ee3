// packages/engine/src/runtime/engine.rs
//! Contracts between the core and the automation engine
//!
//! The core needs very little from an engine: create an isolated session,
//! reset and close that session, close the engine, and learn when the engine
//! goes away. Everything a solver does inside a session (navigate, click,
//! read values) happens through the backend's own context type, reached with
//! `WorkerSession::context`, and is outside the core.

use crate::utils::errors::Result;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::watch;

/// An isolated execution context inside a running engine
#[async_trait]
pub trait EngineSession: Send + Sync {
    /// Engine-assigned identity of this context
    fn handle(&self) -> &str;

    /// Close every page-like surface opened inside the context
    async fn reset(&self) -> Result<()>;

    /// Destroy the context
    async fn close(&self) -> Result<()>;

    /// Concrete type access for `WorkerSession::context`
    fn as_any(&self) -> &dyn Any;
}

/// A live engine instance
#[async_trait]
pub trait AutomationEngine: Send + Sync {
    /// Create a fresh isolated context
    async fn create_session(&self) -> Result<Box<dyn EngineSession>>;

    /// Subscribe to the disconnect notification
    fn disconnect_signal(&self) -> DisconnectSignal;

    /// Shut the engine down
    async fn close(&self) -> Result<()>;
}

/// Starts engine instances for the supervisor
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Launch a new engine instance
    async fn launch(&self) -> Result<Arc<dyn AutomationEngine>>;
}

/// Receiving side of an engine's disconnect notification
#[derive(Debug, Clone)]
pub struct DisconnectSignal {
    rx: watch::Receiver<bool>,
}

impl DisconnectSignal {
    /// Whether the engine has already disconnected
    pub fn is_disconnected(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the engine disconnects
    ///
    /// Resolves immediately if it already has. A dropped notifier counts as a
    /// disconnect.
    pub async fn wait(&mut self) {
        // Err means the sender is gone, which is a disconnect as well
        let _ = self.rx.wait_for(|disconnected| *disconnected).await;
    }
}

/// Sending side of an engine's disconnect notification
#[derive(Debug)]
pub struct DisconnectNotifier {
    tx: watch::Sender<bool>,
}

impl DisconnectNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> DisconnectSignal {
        DisconnectSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire the notification; later calls are no-ops
    pub fn notify(&self) {
        self.tx.send_if_modified(|disconnected| !std::mem::replace(disconnected, true));
    }

    pub fn is_disconnected(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for DisconnectNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_disconnect_signal() {
        let notifier = DisconnectNotifier::new();
        let mut signal = notifier.subscribe();
        assert!(!signal.is_disconnected());

        let waiter = tokio::spawn(async move {
            signal.wait().await;
        });

        notifier.notify();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        assert!(notifier.is_disconnected());
        assert!(notifier.subscribe().is_disconnected());
    }

    #[tokio::test]
    async fn test_dropped_notifier_counts_as_disconnect() {
        let notifier = DisconnectNotifier::new();
        let mut signal = notifier.subscribe();
        drop(notifier);

        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
    }
}
