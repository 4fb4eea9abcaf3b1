use clap::{Args, Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::{DEFAULT_AGENT_PORT, DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_BUDGET};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "skiff",
    about = "Provision a VPN host and fetch its client configuration",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "SKIFF_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "SKIFF_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install the VPN onto a host you already own and print the client
    /// configuration when the agent reports completion
    Deploy(DeployArgs),
}

#[derive(Args, Debug)]
pub struct DeployArgs {
    #[arg(value_name = "TARGET", help = "SSH destination (user@host or host)")]
    pub target: String,

    #[arg(
        long = "ssh-port",
        default_value_t = 22,
        value_name = "PORT",
        help = "SSH port on the target host"
    )]
    pub ssh_port: u16,

    #[arg(
        long = "identity",
        value_name = "PATH",
        help = "Private key file passed to ssh via -i"
    )]
    pub identity: Option<PathBuf>,

    #[arg(
        long = "ssh-binary",
        default_value = "ssh",
        value_name = "BIN",
        help = "SSH executable to invoke"
    )]
    pub ssh_binary: String,

    #[arg(
        long = "ssh-flag",
        value_name = "FLAG",
        action = clap::ArgAction::Append,
        help = "Additional flag to pass through to ssh (repeatable)"
    )]
    pub ssh_flag: Vec<String>,

    #[arg(
        long = "no-batch",
        action = clap::ArgAction::SetTrue,
        help = "Do not force BatchMode=yes when invoking ssh"
    )]
    pub no_batch: bool,

    #[arg(
        long = "script",
        value_name = "PATH",
        help = "File containing the bootstrap command that installs the setup agent"
    )]
    pub script: PathBuf,

    #[arg(
        long = "agent-key",
        env = "SKIFF_AGENT_KEY",
        hide_env_values = true,
        value_name = "KEY",
        help = "Base64 session key the agent encrypts its status reports with"
    )]
    pub agent_key: String,

    #[arg(
        long = "agent-port",
        env = "SKIFF_AGENT_PORT",
        default_value_t = DEFAULT_AGENT_PORT,
        value_name = "PORT",
        help = "Port the setup agent listens on"
    )]
    pub agent_port: u16,

    #[arg(
        long = "wait-budget",
        env = "SKIFF_WAIT_BUDGET_SECS",
        default_value_t = DEFAULT_WAIT_BUDGET.as_secs(),
        value_name = "SECONDS",
        help = "Agent-reported running time tolerated before giving up"
    )]
    pub wait_budget: u64,

    #[arg(
        long = "poll-interval",
        env = "SKIFF_POLL_INTERVAL_SECS",
        default_value_t = DEFAULT_POLL_INTERVAL.as_secs(),
        value_name = "SECONDS",
        help = "Delay between agent status probes"
    )]
    pub poll_interval: u64,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("{0}")]
    Provisioning(String),
}

/// Split `user@host` into its parts, defaulting the user to root the way
/// provisioning images expect.
pub fn parse_ssh_target(raw: &str) -> Result<(String, String), CliError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CliError::InvalidArgument("ssh target is empty".into()));
    }
    match trimmed.split_once('@') {
        Some(("", _)) => Err(CliError::InvalidArgument(format!(
            "ssh target '{trimmed}' has an empty user"
        ))),
        Some((_, "")) => Err(CliError::InvalidArgument(format!(
            "ssh target '{trimmed}' has an empty host"
        ))),
        Some((user, host)) => Ok((user.to_string(), host.to_string())),
        None => Ok(("root".to_string(), trimmed.to_string())),
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
