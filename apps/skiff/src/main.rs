use skiff_core::agent::AgentKey;
use skiff_core::bootstrap::{BootstrapAuth, BootstrapTarget, SshBootstrapper};
use skiff_core::cancel::CancelMediator;
use skiff_core::cli::{self, CliError, Command, DeployArgs};
use skiff_core::config::ProvisionConfig;
use skiff_core::notify::ConsoleSink;
use skiff_core::provision::{ExistingTargetRequest, Orchestrator, SessionStatus};
use skiff_core::telemetry::logging;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;

    match cli.command {
        Command::Deploy(args) => deploy(args).await,
    }
}

async fn deploy(args: DeployArgs) -> Result<(), CliError> {
    let bootstrap_command = fs::read_to_string(&args.script)?;
    let agent_key = AgentKey::from_base64(&args.agent_key)
        .map_err(|err| CliError::InvalidArgument(format!("--agent-key: {err}")))?;
    let (user, host) = cli::parse_ssh_target(&args.target)?;
    let auth = match args.identity {
        Some(path) => BootstrapAuth::KeyFile(path),
        None => BootstrapAuth::Default,
    };
    let target = BootstrapTarget {
        host,
        port: args.ssh_port,
        user,
        auth,
    };

    let config = ProvisionConfig {
        wait_budget: Duration::from_secs(args.wait_budget.max(1)),
        poll_interval: Duration::from_secs(args.poll_interval.max(1)),
        agent_port: args.agent_port,
        ..ProvisionConfig::default()
    };

    let bootstrapper = SshBootstrapper::new(args.ssh_binary)
        .with_flags(args.ssh_flag)
        .with_batch_mode(!args.no_batch);

    let mediator = CancelMediator::new();
    let scope = mediator
        .begin_session()
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    {
        let mediator = mediator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupt received; cancelling");
                mediator.cancel();
            }
        });
    }

    let orchestrator = Orchestrator::new(
        Arc::new(bootstrapper),
        Arc::new(ConsoleSink::default()),
        config,
    )
    .map_err(|err| CliError::Runtime(err.to_string()))?;

    let session = orchestrator
        .run_existing(
            ExistingTargetRequest {
                target,
                bootstrap_command,
                agent_key,
            },
            scope,
        )
        .await;

    match session.status() {
        SessionStatus::Completed => {
            if let Some(config) = session.result_config() {
                println!("{config}");
            }
            Ok(())
        }
        SessionStatus::Cancelled => {
            eprintln!("provisioning cancelled");
            std::process::exit(130);
        }
        _ => Err(CliError::Provisioning(
            session
                .last_error()
                .unwrap_or("provisioning failed")
                .to_string(),
        )),
    }
}
