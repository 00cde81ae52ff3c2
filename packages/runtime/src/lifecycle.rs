//! Dispatcher lifecycle state and shutdown signalling.
//!
//! Uses `ArcSwap` for lock-free state reads (the readiness probe and every
//! request task check it) and a `watch` channel so the consume loop and
//! backoff sleeps can wake up as soon as shutdown is requested.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Dispatcher lifecycle.
///
/// State machine: Starting -> Running -> ShuttingDown -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, consume loop not yet running.
    Starting,
    /// Consume loop is receiving messages.
    Running,
    /// Shutdown requested; no new receives, in-flight tasks draining.
    ShuttingDown,
    /// Resources released. Terminal.
    Closed,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Closed => "closed",
        }
    }
}

/// Owns the lifecycle state and the shutdown flag.
#[derive(Debug)]
pub struct LifecycleController {
    shutdown_signal: watch::Sender<bool>,
    state: Arc<ArcSwap<LifecycleState>>,
}

impl LifecycleController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            state: Arc::new(ArcSwap::from_pointee(LifecycleState::Starting)),
        }
    }

    /// Moves `Starting` to `Running`. Ignored once shutdown has begun.
    pub fn set_running(&self) {
        if self.state() == LifecycleState::Starting {
            self.state.store(Arc::new(LifecycleState::Running));
        }
    }

    /// Requests shutdown. Returns `true` for the call that raised the flag.
    pub fn trigger_shutdown(&self) -> bool {
        if self.state() != LifecycleState::Closed {
            self.state.store(Arc::new(LifecycleState::ShuttingDown));
        }
        // send_replace updates the value even with no live receivers.
        !self.shutdown_signal.send_replace(true)
    }

    /// Marks teardown complete. Implies the shutdown flag.
    pub fn set_closed(&self) {
        self.shutdown_signal.send_replace(true);
        self.state.store(Arc::new(LifecycleState::Closed));
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_signal.borrow()
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// Shared handle to the state for the readiness probe.
    #[must_use]
    pub fn state_handle(&self) -> Arc<ArcSwap<LifecycleState>> {
        Arc::clone(&self.state)
    }

    fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown_receiver();
        // The sender lives in `self`, so this cannot fail while borrowed.
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}
