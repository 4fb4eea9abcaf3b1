//! Bootstrapper backed by the system `ssh` binary. Each call is one exec;
//! there is no control channel to keep alive, so a "session" here is just a
//! target whose reachability and auth already checked out.

use super::{BootstrapAuth, BootstrapError, BootstrapSession, Bootstrapper, BootstrapTarget};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tracing::debug;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SshBootstrapper {
    ssh_binary: String,
    extra_flags: Vec<String>,
    batch_mode: bool,
    connect_timeout: Duration,
}

impl SshBootstrapper {
    pub fn new(ssh_binary: impl Into<String>) -> Self {
        Self {
            ssh_binary: ssh_binary.into(),
            extra_flags: Vec::new(),
            batch_mode: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Extra flags passed through to ssh verbatim, before the destination.
    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.extra_flags = flags;
        self
    }

    /// BatchMode refuses interactive prompts so a headless run fails fast
    /// instead of hanging on a password question. On by default.
    pub fn with_batch_mode(mut self, enabled: bool) -> Self {
        self.batch_mode = enabled;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn invocation_args(&self, target: &BootstrapTarget) -> Result<Vec<String>, BootstrapError> {
        let mut args = Vec::new();
        if self.batch_mode {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        args.push("-T".to_string());
        if target.port != 22 {
            args.push("-p".to_string());
            args.push(target.port.to_string());
        }
        match &target.auth {
            BootstrapAuth::Default => {}
            BootstrapAuth::KeyFile(path) => {
                args.push("-i".to_string());
                args.push(path.display().to_string());
            }
            BootstrapAuth::Password(_) => {
                return Err(BootstrapError::UnsupportedAuth("password"));
            }
        }
        args.extend(self.extra_flags.iter().cloned());
        args.push(target.destination());
        Ok(args)
    }
}

#[async_trait]
impl Bootstrapper for SshBootstrapper {
    async fn connect(
        &self,
        target: &BootstrapTarget,
    ) -> Result<Box<dyn BootstrapSession>, BootstrapError> {
        let args = self.invocation_args(target)?;

        // Probe with a no-op remote command so auth and reachability fail
        // here, not halfway into shipping the bootstrap.
        let probe = run_ssh(&self.ssh_binary, &args, "true");
        let output = tokio::time::timeout(self.connect_timeout, probe)
            .await
            .map_err(|_| BootstrapError::Connect {
                host: target.host.clone(),
                message: format!("timed out after {}s", self.connect_timeout.as_secs()),
            })??;

        if !output.status.success() {
            return Err(BootstrapError::Connect {
                host: target.host.clone(),
                message: failure_detail(&output),
            });
        }
        debug!(target = %target.destination(), "ssh reachability probe succeeded");

        Ok(Box::new(SshSession {
            ssh_binary: self.ssh_binary.clone(),
            args,
            destination: target.destination(),
        }))
    }
}

struct SshSession {
    ssh_binary: String,
    args: Vec<String>,
    destination: String,
}

#[async_trait]
impl BootstrapSession for SshSession {
    async fn run_bootstrap(&mut self, script: &str) -> Result<(), BootstrapError> {
        debug!(target = %self.destination, "running bootstrap over ssh");
        let output = run_ssh(&self.ssh_binary, &self.args, script).await?;
        if !output.status.success() {
            return Err(BootstrapError::Command(failure_detail(&output)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines().filter(|line| !line.trim().is_empty()) {
            debug!(target: "skiff::ssh", stream = "stdout", message = line);
        }
        Ok(())
    }
}

async fn run_ssh(
    binary: &str,
    args: &[String],
    remote_command: &str,
) -> Result<std::process::Output, BootstrapError> {
    let mut command = TokioCommand::new(binary);
    command.args(args);
    command.arg(remote_command);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    Ok(command.output().await?)
}

fn failure_detail(output: &std::process::Output) -> String {
    let status = describe_exit_status(output.status);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if lines.is_empty() {
        status
    } else {
        let tail = lines[lines.len().saturating_sub(3)..].join(" | ");
        format!("{status}; stderr: {tail}")
    }
}

fn describe_exit_status(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }

    "unknown status".to_string()
}
