//! Session progress events. The orchestrator emits these fire-and-forget;
//! sinks must not block and nothing the orchestrator does depends on who is
//! listening.

use crate::provider::ServerHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Human-readable progress line for display surfaces.
    Progress(String),
    /// A provider server now exists. Persist the handle immediately; it is
    /// the only durable record if the process dies mid-session.
    ServerSaved(ServerHandle),
    /// The agent port stopped answering. The connection may need to be
    /// re-established before retrying.
    ReconnectAdvisory,
    /// Provider inventory changed; cached server lists are stale.
    ServerListStale,
    /// Best-effort teardown hit an error that was not allowed to block the
    /// terminal transition.
    CleanupFailed {
        resource: &'static str,
        message: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

/// Routes every event to the tracing subscriber.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SessionEvent) {
        match event {
            SessionEvent::Progress(message) => {
                info!(target: "skiff::session", "{message}");
            }
            SessionEvent::ServerSaved(server) => {
                info!(target: "skiff::session", server = %server.id, "server handle recorded");
            }
            SessionEvent::ReconnectAdvisory => {
                warn!(target: "skiff::session", "agent endpoint unreachable; reconnect before retrying");
            }
            SessionEvent::ServerListStale => {
                debug!(target: "skiff::session", "server inventory changed");
            }
            SessionEvent::CleanupFailed { resource, message } => {
                warn!(target: "skiff::session", resource, %message, "cleanup failed");
            }
        }
    }
}

/// Prints progress to stderr for interactive runs and mirrors everything to
/// tracing. Stdout stays reserved for the resulting client configuration.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    tracing: TracingSink,
}

impl EventSink for ConsoleSink {
    fn emit(&self, event: SessionEvent) {
        match &event {
            SessionEvent::Progress(message) => eprintln!("• {message}"),
            SessionEvent::ServerSaved(server) => eprintln!("• server ready: {}", server.id),
            SessionEvent::ReconnectAdvisory => {
                eprintln!("• agent unreachable; check that the port is open and reconnect");
            }
            SessionEvent::ServerListStale => {}
            SessionEvent::CleanupFailed { resource, message } => {
                eprintln!("• cleanup of {resource} failed: {message}");
            }
        }
        self.tracing.emit(event);
    }
}
