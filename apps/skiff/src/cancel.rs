//! Cancellation mediation between whatever surface the user cancels from
//! (signal handler, UI button) and the single provisioning session that may
//! be in flight.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
#[error("a provisioning session is already active")]
pub struct SessionActive;

/// Hands out at most one live [`SessionScope`] at a time and relays cancel
/// requests to it. Cheap to clone; clones share the slot.
#[derive(Clone, Default)]
pub struct CancelMediator {
    active: Arc<Mutex<Option<CancellationToken>>>,
}

impl CancelMediator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the session slot. Fails while another scope is alive; the
    /// slot frees when the returned scope drops, which the orchestrator does
    /// on reaching a terminal state.
    pub fn begin_session(&self) -> Result<SessionScope, SessionActive> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(SessionActive);
        }
        let token = CancellationToken::new();
        *active = Some(token.clone());
        Ok(SessionScope {
            mediator: self.clone(),
            token,
        })
    }

    /// Request cancellation of the active session. A no-op when nothing is
    /// running or the session was already cancelled, so callers never need
    /// to guard this.
    pub fn cancel(&self) {
        if let Some(token) = self.active.lock().as_ref() {
            token.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }
}

/// The running session's view of cancellation. Owning it keeps the mediator
/// slot occupied.
pub struct SessionScope {
    mediator: CancelMediator,
    token: CancellationToken,
}

impl SessionScope {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when cancellation is requested. Safe to await from multiple
    /// checkpoints at once.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Drop for SessionScope {
    // At most one scope exists at a time, so this never clears a successor's
    // token.
    fn drop(&mut self) {
        *self.mediator.active.lock() = None;
    }
}
