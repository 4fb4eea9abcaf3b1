//! Client for the setup agent that provisioned hosts run while installing
//! the VPN software. The agent serves one encrypted status document; this
//! module fetches it, opens the envelope, and classifies what it says.

pub mod envelope;

pub use envelope::{AgentKey, EnvelopeError, SealedEnvelope, open_envelope, seal_envelope};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;
use url::Url;

/// Where a session's agent listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    host: String,
    port: u16,
}

impl AgentEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The agent serves its single status document at the root.
    pub fn status_url(&self) -> Result<Url, TransportError> {
        Url::parse(&format!("http://{}:{}/", self.host, self.port))
            .map_err(|err| TransportError::Endpoint(err.to_string()))
    }
}

/// Classification of a single status probe.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Agent is up but installation has not started.
    Idle,
    /// Installation in progress.
    SettingUp,
    /// Installation finished; carries the client configuration payload.
    Completed(String),
    /// Installation failed on the host; carries the agent's message.
    AgentError(String),
    /// The agent answered but the payload was unusable (wrong key, corrupt
    /// channel, malformed document).
    DecodeFailure,
    /// The request itself failed: refused, timed out, no route.
    TransportFailure(String),
}

/// One probe's outcome plus the agent's self-reported running time. The
/// wait budget is measured against this clock, not ours, so a laptop that
/// slept mid-poll does not time a healthy install out.
#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
    pub outcome: PollOutcome,
    pub running: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid agent endpoint: {0}")]
    Endpoint(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected http status {0}")]
    HttpStatus(u16),
}

/// Fetches the raw (still sealed) status document from an agent.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn fetch_status(&self, endpoint: &AgentEndpoint) -> Result<String, TransportError>;
}

pub struct HttpAgentTransport {
    client: reqwest::Client,
}

impl HttpAgentTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn fetch_status(&self, endpoint: &AgentEndpoint) -> Result<String, TransportError> {
        let url = endpoint.status_url()?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status().as_u16()));
        }
        response
            .text()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))
    }
}

/// Decrypted status document as the agent writes it.
#[derive(Debug, Deserialize)]
struct StatusDocument {
    #[serde(default)]
    status: Value,
    #[serde(default)]
    time_running: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error_text: Option<String>,
    #[serde(default)]
    client_config: Option<String>,
}

/// Issues single status probes. Pacing and looping belong to the caller.
pub struct AgentPoller {
    transport: Arc<dyn AgentTransport>,
}

impl AgentPoller {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            transport: Arc::new(HttpAgentTransport::new()?),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_transport(transport: Arc<dyn AgentTransport>) -> Self {
        Self { transport }
    }

    /// One probe: fetch, open, classify. Never errors; every failure mode is
    /// a [`PollOutcome`] variant so the caller has a single decision point.
    pub async fn poll(&self, endpoint: &AgentEndpoint, key: &AgentKey) -> PollReport {
        let body = match self.transport.fetch_status(endpoint).await {
            Ok(body) => body,
            Err(err) => {
                return PollReport {
                    outcome: PollOutcome::TransportFailure(err.to_string()),
                    running: None,
                };
            }
        };
        classify_payload(key, &body)
    }
}

fn classify_payload(key: &AgentKey, body: &str) -> PollReport {
    let envelope: SealedEnvelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            trace!(error = %err, "agent response is not a sealed envelope");
            return decode_failure(None);
        }
    };
    let plaintext = match open_envelope(key, &envelope) {
        Ok(plaintext) => plaintext,
        Err(err) => {
            trace!(error = %err, "agent envelope did not open");
            return decode_failure(None);
        }
    };
    let document: StatusDocument = match serde_json::from_slice(&plaintext) {
        Ok(document) => document,
        Err(err) => {
            trace!(error = %err, "agent payload is not a status document");
            return decode_failure(None);
        }
    };

    let running = document
        .time_running
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());

    // A payload that decrypted cleanly may still carry junk where the
    // status object belongs; its clock is trustworthy either way.
    if !document.status.is_object() {
        return decode_failure(running);
    }
    let body: StatusBody = match serde_json::from_value(document.status) {
        Ok(body) => body,
        Err(_) => return decode_failure(running),
    };

    let outcome = match body.code.as_deref() {
        Some("error") => {
            PollOutcome::AgentError(body.error_text.unwrap_or_else(|| "Unknown error".into()))
        }
        Some("completed") => match body.client_config {
            Some(config) => PollOutcome::Completed(config),
            None => PollOutcome::DecodeFailure,
        },
        Some("setup") => PollOutcome::SettingUp,
        // "idle", anything unrecognized, and a missing code all mean keep
        // waiting; agents are allowed to grow new codes before we learn them.
        _ => PollOutcome::Idle,
    };
    PollReport { outcome, running }
}

fn decode_failure(running: Option<Duration>) -> PollReport {
    PollReport {
        outcome: PollOutcome::DecodeFailure,
        running,
    }
}
