//! Cloud provider seam. The orchestrator drives provisioning through this
//! trait so provider SDKs stay out of the core crate; implementations map
//! their own API surface onto these five calls.

use crate::agent::AgentKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

/// Opaque reference to SSH key material registered with a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialHandle {
    pub id: String,
}

impl CredentialHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Reference to a provider-created server. Callers persist this verbatim;
/// the agent key rides along because the host's setup agent encrypts its
/// status reports with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHandle {
    pub id: String,
    /// Public address, present once the provider reports the server running.
    pub addr: Option<IpAddr>,
    pub agent_key: AgentKey,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider api error: {0}")]
    Api(String),
    #[error("provider rejected the request: {0}")]
    Rejected(String),
    #[error("server {0} has no reachable address")]
    NoAddress(String),
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Register SSH key material and return the credential servers are
    /// created under.
    async fn add_ssh_key(&self, material: &str) -> Result<CredentialHandle, ProviderError>;

    /// Create a server that runs `bootstrap_command` on first boot.
    async fn create_server(
        &self,
        credential: &CredentialHandle,
        region: &str,
        bootstrap_command: &str,
    ) -> Result<ServerHandle, ProviderError>;

    /// Resolve once the server is running. The returned handle carries the
    /// routable address; poll or block as the provider requires.
    async fn check_server(&self, server: &ServerHandle) -> Result<ServerHandle, ProviderError>;

    async fn delete_server(&self, server: &ServerHandle) -> Result<(), ProviderError>;

    /// Remove registered key material. `server` is passed for providers
    /// that scope keys to a machine; pass `None` when no server exists yet
    /// so an aborted session can still retract its key.
    async fn delete_ssh_key(
        &self,
        credential: &CredentialHandle,
        server: Option<&ServerHandle>,
    ) -> Result<(), ProviderError>;
}
