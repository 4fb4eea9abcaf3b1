use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_AGENT_PORT: u16 = 8400;
pub const DEFAULT_WAIT_BUDGET: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PROVISION_ATTEMPTS: u32 = 3;

/// Knobs for a provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Agent-reported running time tolerated before the session times out.
    pub wait_budget: Duration,
    /// Delay between agent status probes.
    pub poll_interval: Duration,
    /// Full provisioning attempts (create, boot, bootstrap) before giving up.
    pub max_provision_attempts: u32,
    /// TCP port the setup agent listens on.
    pub agent_port: u16,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            wait_budget: DEFAULT_WAIT_BUDGET,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_provision_attempts: DEFAULT_PROVISION_ATTEMPTS,
            agent_port: DEFAULT_AGENT_PORT,
        }
    }
}

impl ProvisionConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_parse::<u64>("SKIFF_WAIT_BUDGET_SECS") {
            config.wait_budget = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SKIFF_POLL_INTERVAL_SECS") {
            config.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(attempts) = env_parse::<u32>("SKIFF_PROVISION_ATTEMPTS") {
            config.max_provision_attempts = attempts.max(1);
        }
        if let Some(port) = env_parse::<u16>("SKIFF_AGENT_PORT") {
            config.agent_port = port;
        }
        config
    }

    /// Number of probes that exhausts the wait budget at the configured
    /// interval. Caps the poll loop even when the agent never reports a
    /// running time of its own.
    pub fn max_poll_attempts(&self) -> u32 {
        let interval = self.poll_interval.max(Duration::from_millis(1)).as_millis();
        let budget = self.wait_budget.as_millis();
        u32::try_from(budget.div_ceil(interval))
            .unwrap_or(u32::MAX)
            .max(1)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse().ok()
}
