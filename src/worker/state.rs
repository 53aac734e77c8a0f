//! Mailbox session state machine.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

/// State of the inbound mailbox session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No connection; a reconnect may be pending.
    Disconnected,
    /// Connecting, authenticating and opening the inbox.
    Connecting,
    /// Inbox open, first discovery cycle not yet started.
    Ready,
    /// A discovery cycle is running.
    Checking,
    /// Waiting for the next tick or new-mail signal.
    Idle,
}

impl SessionState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, target),
            (Disconnected, Connecting) |
            (Connecting, Ready) | (Connecting, Disconnected) |
            (Ready, Checking) | (Ready, Disconnected) |
            (Checking, Idle) | (Checking, Disconnected) |
            (Idle, Checking) | (Idle, Disconnected)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Checking => "checking",
            Self::Idle => "idle",
        };
        write!(f, "{s}")
    }
}

/// Shared, observable session state.
///
/// Cloning yields a handle to the same state.
#[derive(Debug, Clone)]
pub struct StateCell {
    tx: Arc<watch::Sender<SessionState>>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move to `target`. Invalid transitions are logged and applied anyway:
    /// the observed state must always match what the worker is doing.
    pub fn transition(&self, target: SessionState) {
        let current = self.get();
        if current == target {
            return;
        }
        if current.can_transition_to(target) {
            debug!(from = %current, to = %target, "Session state transition");
        } else {
            warn!(from = %current, to = %target, "Unexpected session state transition");
        }
        self.tx.send_replace(target);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
