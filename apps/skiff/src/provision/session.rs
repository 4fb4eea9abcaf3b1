use crate::provider::{CredentialHandle, ServerHandle};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    /// skiff creates the server through a provider, then installs onto it.
    CloudProvisioned,
    /// The caller already has a machine; skiff only installs onto it.
    PreExistingTarget,
}

/// Lifecycle of one provisioning session. Declaration order is progression
/// order; [`Session::advance`] relies on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionStatus {
    Idle,
    KeyRegistered,
    ServerRequested,
    ServerBooting,
    Connected,
    Polling,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

/// Record of one provisioning run. The orchestrator owns it while driving;
/// callers get it back frozen in a terminal state.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    mode: SessionMode,
    status: SessionStatus,
    server: Option<ServerHandle>,
    credential: Option<CredentialHandle>,
    cancel_requested: bool,
    poll_elapsed: Duration,
    last_error: Option<String>,
    result_config: Option<String>,
}

impl Session {
    pub(crate) fn new(mode: SessionMode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mode,
            status: SessionStatus::Idle,
            server: None,
            credential: None,
            cancel_requested: false,
            poll_elapsed: Duration::ZERO,
            last_error: None,
            result_config: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn server(&self) -> Option<&ServerHandle> {
        self.server.as_ref()
    }

    pub fn credential(&self) -> Option<&CredentialHandle> {
        self.credential.as_ref()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Highest running time the agent has reported for this session.
    pub fn poll_elapsed(&self) -> Duration {
        self.poll_elapsed
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn result_config(&self) -> Option<&str> {
        self.result_config.as_deref()
    }

    /// Move forward in the lifecycle. Requests to move backwards (a retry
    /// re-running an earlier phase) and anything after a terminal state are
    /// ignored, which keeps the externally visible status monotonic.
    pub(crate) fn advance(&mut self, next: SessionStatus) {
        if self.status.is_terminal() || next <= self.status {
            return;
        }
        self.status = next;
    }

    pub(crate) fn complete(&mut self, config: String) {
        if self.status.is_terminal() {
            return;
        }
        self.status = SessionStatus::Completed;
        self.result_config = Some(config);
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = SessionStatus::Failed;
        self.last_error = Some(message.into());
    }

    pub(crate) fn cancel(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = SessionStatus::Cancelled;
    }

    pub(crate) fn mark_cancel_requested(&mut self) {
        self.cancel_requested = true;
    }

    pub(crate) fn record_server(&mut self, server: ServerHandle) {
        self.server = Some(server);
    }

    pub(crate) fn take_server(&mut self) -> Option<ServerHandle> {
        self.server.take()
    }

    pub(crate) fn record_credential(&mut self, credential: CredentialHandle) {
        self.credential = Some(credential);
    }

    pub(crate) fn take_credential(&mut self) -> Option<CredentialHandle> {
        self.credential.take()
    }

    /// The agent's clock only moves forward; a probe that raced an agent
    /// restart must not roll the budget back.
    pub(crate) fn record_elapsed(&mut self, elapsed: Duration) {
        if elapsed > self.poll_elapsed {
            self.poll_elapsed = elapsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_never_moves_backwards() {
        let mut session = Session::new(SessionMode::CloudProvisioned);
        session.advance(SessionStatus::ServerBooting);
        session.advance(SessionStatus::ServerRequested);
        assert_eq!(session.status(), SessionStatus::ServerBooting);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut session = Session::new(SessionMode::CloudProvisioned);
        session.complete("config".into());
        session.fail("late failure");
        session.cancel();
        session.advance(SessionStatus::Polling);
        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.result_config(), Some("config"));
        assert_eq!(session.last_error(), None);
    }

    #[test]
    fn fail_records_message_once() {
        let mut session = Session::new(SessionMode::PreExistingTarget);
        session.fail("first");
        session.fail("second");
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.last_error(), Some("first"));
    }

    #[test]
    fn elapsed_only_ratchets_up() {
        let mut session = Session::new(SessionMode::CloudProvisioned);
        session.record_elapsed(Duration::from_secs(40));
        session.record_elapsed(Duration::from_secs(12));
        assert_eq!(session.poll_elapsed(), Duration::from_secs(40));
    }

    #[test]
    fn handles_are_taken_at_most_once() {
        let mut session = Session::new(SessionMode::CloudProvisioned);
        session.record_credential(CredentialHandle::new("key-1"));
        assert!(session.take_credential().is_some());
        assert!(session.take_credential().is_none());
    }
}
