//! Transport seam for installing the setup agent on a host. The orchestrator
//! only needs "open a session, run one command"; how bytes reach the machine
//! is the implementation's business.

pub mod ssh;

pub use ssh::SshBootstrapper;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Where and how to reach the host that will run the bootstrap.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: BootstrapAuth,
}

impl BootstrapTarget {
    /// `user@host` form, or bare host when no user was given.
    pub fn destination(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }
}

/// Credential material for the transport session.
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapAuth {
    /// Defer to whatever identities the transport finds on its own.
    Default,
    /// Private key file handed to the transport.
    KeyFile(PathBuf),
    /// Plain password. Not every transport can use one.
    Password(String),
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("connection to {host} failed: {message}")]
    Connect { host: String, message: String },
    #[error("bootstrap command failed: {0}")]
    Command(String),
    #[error("{0} authentication is not supported by this transport")]
    UnsupportedAuth(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Validate reachability and authentication, returning a session the
    /// bootstrap can run over.
    async fn connect(
        &self,
        target: &BootstrapTarget,
    ) -> Result<Box<dyn BootstrapSession>, BootstrapError>;
}

#[async_trait]
pub trait BootstrapSession: Send + Sync {
    /// Run the one-shot bootstrap command to completion. The command is
    /// expected to leave the setup agent listening when it returns.
    async fn run_bootstrap(&mut self, script: &str) -> Result<(), BootstrapError>;
}
