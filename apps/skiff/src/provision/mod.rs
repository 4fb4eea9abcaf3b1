//! Provisioning orchestrator: drives a session from nothing to a terminal
//! state, pairing every provider resource with exactly one delete on the way
//! out. Callers never see an `Err`; every failure lands in the returned
//! session as a terminal status plus message.

pub mod session;

pub use session::{Session, SessionMode, SessionStatus};

use crate::agent::{
    AgentEndpoint, AgentKey, AgentPoller, PollOutcome, TransportError as AgentTransportError,
};
use crate::bootstrap::{BootstrapAuth, BootstrapError, Bootstrapper, BootstrapTarget};
use crate::cancel::SessionScope;
use crate::config::ProvisionConfig;
use crate::notify::{EventSink, SessionEvent};
use crate::provider::{CredentialHandle, Provider, ProviderError, ServerHandle};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provider operation failed: {0}")]
    Provision(#[from] ProviderError),
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("agent responses could not be decoded; the session key may be wrong")]
    AgentDecode,
    #[error("{0}")]
    AgentReported(String),
    #[error("setup did not finish within the wait budget ({0:?})")]
    WaitBudgetExceeded(std::time::Duration),
    #[error("setup agent port {port} is unreachable: {message}")]
    TransportUnreachable { port: u16, message: String },
    #[error("gave up after {attempts} provisioning attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("cancelled")]
    Cancelled,
}

/// Inputs for a session that creates its own server.
pub struct CloudRequest {
    /// Public key material to register with the provider.
    pub ssh_key_material: String,
    pub region: String,
    /// Command that installs and starts the setup agent on the new host.
    pub bootstrap_command: String,
    /// How to reach whatever server comes up.
    pub ssh_user: String,
    pub ssh_port: u16,
    pub ssh_auth: BootstrapAuth,
}

/// Inputs for a session against a machine the caller already owns.
pub struct ExistingTargetRequest {
    pub target: BootstrapTarget,
    pub bootstrap_command: String,
    /// Session key the agent on the host will encrypt its status with.
    pub agent_key: AgentKey,
}

pub struct Orchestrator {
    bootstrapper: Arc<dyn Bootstrapper>,
    poller: AgentPoller,
    events: Arc<dyn EventSink>,
    config: ProvisionConfig,
}

impl Orchestrator {
    pub fn new(
        bootstrapper: Arc<dyn Bootstrapper>,
        events: Arc<dyn EventSink>,
        config: ProvisionConfig,
    ) -> Result<Self, AgentTransportError> {
        Ok(Self {
            bootstrapper,
            poller: AgentPoller::new()?,
            events,
            config,
        })
    }

    /// Provision a fresh server through `provider` and install onto it.
    /// Consumes the scope; the mediator slot frees when this returns.
    pub async fn run_cloud(
        &self,
        provider: &dyn Provider,
        request: CloudRequest,
        scope: SessionScope,
    ) -> Session {
        let mut session = Session::new(SessionMode::CloudProvisioned);
        info!(
            target: "skiff::provision",
            session = %session.id(),
            region = %request.region,
            "starting cloud provisioning session"
        );

        match self.drive_cloud(provider, &request, &scope, &mut session).await {
            Ok(config) => {
                session.complete(config);
                self.events.emit(SessionEvent::ServerListStale);
            }
            Err(ProvisionError::Cancelled) => {
                session.mark_cancel_requested();
                self.teardown(provider, &mut session).await;
                session.cancel();
            }
            Err(err) => {
                self.teardown(provider, &mut session).await;
                session.fail(err.to_string());
            }
        }

        info!(
            target: "skiff::provision",
            session = %session.id(),
            status = ?session.status(),
            "session finished"
        );
        session
    }

    /// Install onto a machine the caller already has. No provider resources
    /// exist in this mode, so there is nothing to tear down on failure.
    pub async fn run_existing(
        &self,
        request: ExistingTargetRequest,
        scope: SessionScope,
    ) -> Session {
        let mut session = Session::new(SessionMode::PreExistingTarget);
        info!(
            target: "skiff::provision",
            session = %session.id(),
            host = %request.target.host,
            "starting provisioning session against existing host"
        );

        match self.drive_existing(&request, &scope, &mut session).await {
            Ok(config) => session.complete(config),
            Err(ProvisionError::Cancelled) => {
                session.mark_cancel_requested();
                session.cancel();
            }
            Err(err) => session.fail(err.to_string()),
        }

        info!(
            target: "skiff::provision",
            session = %session.id(),
            status = ?session.status(),
            "session finished"
        );
        session
    }

    async fn drive_cloud(
        &self,
        provider: &dyn Provider,
        request: &CloudRequest,
        scope: &SessionScope,
        session: &mut Session,
    ) -> Result<String, ProvisionError> {
        let credential = provider.add_ssh_key(&request.ssh_key_material).await?;
        session.record_credential(credential.clone());
        session.advance(SessionStatus::KeyRegistered);
        ensure_live(scope)?;

        let mut attempt = 0u32;
        let server = loop {
            attempt += 1;
            match self
                .provision_attempt(provider, request, scope, session, &credential)
                .await
            {
                Ok(server) => break server,
                Err(ProvisionError::Cancelled) => return Err(ProvisionError::Cancelled),
                Err(err) => {
                    // This attempt's server is useless; replace it rather
                    // than aborting the whole session.
                    if let Some(stale) = session.take_server() {
                        if let Err(cleanup) = provider.delete_server(&stale).await {
                            self.events.emit(SessionEvent::CleanupFailed {
                                resource: "server",
                                message: cleanup.to_string(),
                            });
                        }
                    }
                    if attempt >= self.config.max_provision_attempts {
                        warn!(
                            target: "skiff::provision",
                            session = %session.id(),
                            attempt,
                            error = %err,
                            "provisioning attempts exhausted"
                        );
                        return Err(ProvisionError::RetriesExhausted {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    warn!(
                        target: "skiff::provision",
                        session = %session.id(),
                        attempt,
                        error = %err,
                        "provisioning attempt failed; requesting a fresh server"
                    );
                    self.events.emit(SessionEvent::Progress(format!(
                        "Attempt {attempt} failed ({err}); creating a replacement server"
                    )));
                }
            }
        };

        session.advance(SessionStatus::Polling);
        let endpoint = match server.addr {
            Some(addr) => AgentEndpoint::new(addr.to_string(), self.config.agent_port),
            None => return Err(ProviderError::NoAddress(server.id.clone()).into()),
        };
        let config = self
            .poll_until_ready(&endpoint, &server.agent_key, scope, session)
            .await?;

        // The server now belongs to the caller (it was handed over via
        // ServerSaved); only the registered key comes back.
        provider.delete_ssh_key(&credential, session.server()).await?;
        let _ = session.take_credential();
        Ok(config)
    }

    /// Steps 3 to 6 of a cloud session: create, boot, bootstrap. Returns the
    /// refreshed handle with its routable address on success; any failure
    /// leaves the stale handle recorded on the session for the caller to
    /// clean up.
    async fn provision_attempt(
        &self,
        provider: &dyn Provider,
        request: &CloudRequest,
        scope: &SessionScope,
        session: &mut Session,
        credential: &CredentialHandle,
    ) -> Result<ServerHandle, ProvisionError> {
        ensure_live(scope)?;
        self.events
            .emit(SessionEvent::Progress("Creating a new server".into()));
        session.advance(SessionStatus::ServerRequested);
        let server = provider
            .create_server(credential, &request.region, &request.bootstrap_command)
            .await?;
        // Record the handle and observe cancellation in the same scheduling
        // turn. No await may sit between these lines, or a cancel that raced
        // the creation call could strand the machine.
        session.record_server(server.clone());
        self.events.emit(SessionEvent::ServerSaved(server.clone()));
        if scope.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }

        self.events
            .emit(SessionEvent::Progress("Waiting for the server to start".into()));
        session.advance(SessionStatus::ServerBooting);
        let server = tokio::select! {
            checked = provider.check_server(&server) => checked?,
            _ = scope.cancelled() => return Err(ProvisionError::Cancelled),
        };
        // Same rule as above: persist the refreshed handle (it now carries
        // the address) before anything else can suspend.
        session.record_server(server.clone());
        self.events.emit(SessionEvent::ServerSaved(server.clone()));
        if scope.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }

        let host = match server.addr {
            Some(addr) => addr.to_string(),
            None => return Err(ProviderError::NoAddress(server.id.clone()).into()),
        };
        self.events
            .emit(SessionEvent::Progress(format!("Connecting to the server {host}")));
        let target = BootstrapTarget {
            host,
            port: request.ssh_port,
            user: request.ssh_user.clone(),
            auth: request.ssh_auth.clone(),
        };
        let mut link = self.bootstrapper.connect(&target).await?;
        self.events.emit(SessionEvent::Progress(format!(
            "Starting the setup agent. Make sure that port {} is open on the server",
            self.config.agent_port
        )));
        link.run_bootstrap(&request.bootstrap_command).await?;
        session.advance(SessionStatus::Connected);
        ensure_live(scope)?;
        Ok(server)
    }

    async fn drive_existing(
        &self,
        request: &ExistingTargetRequest,
        scope: &SessionScope,
        session: &mut Session,
    ) -> Result<String, ProvisionError> {
        ensure_live(scope)?;
        self.events.emit(SessionEvent::Progress(format!(
            "Connecting to the server {}",
            request.target.host
        )));
        let mut link = self.bootstrapper.connect(&request.target).await?;
        self.events.emit(SessionEvent::Progress(format!(
            "Starting the setup agent. Make sure that port {} is open on the server",
            self.config.agent_port
        )));
        link.run_bootstrap(&request.bootstrap_command).await?;
        session.advance(SessionStatus::Connected);
        ensure_live(scope)?;

        session.advance(SessionStatus::Polling);
        let endpoint = AgentEndpoint::new(request.target.host.clone(), self.config.agent_port);
        self.poll_until_ready(&endpoint, &request.agent_key, scope, session)
            .await
    }

    /// Probe the agent at a fixed interval until it reports a terminal
    /// installation state or the wait budget runs out. The budget is tracked
    /// against the agent's self-reported running time, with the local
    /// attempt cap as a backstop for agents that never report one.
    async fn poll_until_ready(
        &self,
        endpoint: &AgentEndpoint,
        key: &AgentKey,
        scope: &SessionScope,
        session: &mut Session,
    ) -> Result<String, ProvisionError> {
        let max_attempts = self.config.max_poll_attempts();
        let mut decoding_broken = false;
        for attempt in 1..=max_attempts {
            ensure_live(scope)?;
            let report = self.poller.poll(endpoint, key).await;
            debug!(
                target: "skiff::provision",
                session = %session.id(),
                attempt,
                outcome = ?report.outcome,
                "agent probe"
            );
            if let Some(running) = report.running {
                session.record_elapsed(running);
            }

            match report.outcome {
                PollOutcome::Completed(config) => {
                    self.events.emit(SessionEvent::Progress(
                        "Software installation is complete".into(),
                    ));
                    return Ok(config);
                }
                PollOutcome::AgentError(message) => {
                    self.events.emit(SessionEvent::Progress(
                        "Software installation failed on the server".into(),
                    ));
                    return Err(ProvisionError::AgentReported(message));
                }
                PollOutcome::TransportFailure(message) => {
                    self.events.emit(SessionEvent::ReconnectAdvisory);
                    return Err(ProvisionError::TransportUnreachable {
                        port: endpoint.port(),
                        message,
                    });
                }
                PollOutcome::Idle => {
                    decoding_broken = false;
                    self.events.emit(SessionEvent::Progress(
                        "Waiting for software setup to start on the server".into(),
                    ));
                }
                PollOutcome::SettingUp => {
                    decoding_broken = false;
                    self.events.emit(SessionEvent::Progress(
                        "Waiting for software installation".into(),
                    ));
                }
                PollOutcome::DecodeFailure => {
                    decoding_broken = true;
                    self.events.emit(SessionEvent::Progress(
                        "Agent response could not be decrypted".into(),
                    ));
                }
            }

            if session.poll_elapsed() > self.config.wait_budget {
                return Err(self.budget_error(decoding_broken));
            }
            if attempt == max_attempts {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = scope.cancelled() => return Err(ProvisionError::Cancelled),
            }
        }
        Err(self.budget_error(decoding_broken))
    }

    fn budget_error(&self, decoding_broken: bool) -> ProvisionError {
        if decoding_broken {
            // Every recent probe died in decryption; the timeout is a
            // symptom, the key mismatch is the story.
            ProvisionError::AgentDecode
        } else {
            ProvisionError::WaitBudgetExceeded(self.config.wait_budget)
        }
    }

    /// Delete whatever handles the session still owns, server first. Errors
    /// are reported through the sink but never replace the terminal reason.
    async fn teardown(&self, provider: &dyn Provider, session: &mut Session) {
        let server = session.take_server();
        if let Some(server) = &server {
            if let Err(err) = provider.delete_server(server).await {
                self.events.emit(SessionEvent::CleanupFailed {
                    resource: "server",
                    message: err.to_string(),
                });
            }
        }
        if let Some(credential) = session.take_credential() {
            if let Err(err) = provider.delete_ssh_key(&credential, server.as_ref()).await {
                self.events.emit(SessionEvent::CleanupFailed {
                    resource: "ssh key",
                    message: err.to_string(),
                });
            }
        }
    }
}

fn ensure_live(scope: &SessionScope) -> Result<(), ProvisionError> {
    if scope.is_cancelled() {
        return Err(ProvisionError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentTransport, seal_envelope};
    use crate::bootstrap::BootstrapSession;
    use crate::cancel::CancelMediator;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    const TEST_KEY: [u8; 32] = [7; 32];

    fn test_config() -> ProvisionConfig {
        ProvisionConfig {
            wait_budget: Duration::from_secs(300),
            poll_interval: Duration::from_millis(5),
            max_provision_attempts: 3,
            agent_port: 8400,
        }
    }

    fn sealed(json: &str) -> String {
        let envelope = seal_envelope(&AgentKey::from_bytes(TEST_KEY), json.as_bytes()).unwrap();
        serde_json::to_string(&envelope).unwrap()
    }

    #[derive(Clone)]
    enum Step {
        Body(String),
        Refused,
    }

    fn idle(running: u64) -> Step {
        Step::Body(sealed(&format!(
            r#"{{"status":{{"code":"idle"}},"time_running":{running}}}"#
        )))
    }

    fn setting_up(running: u64) -> Step {
        Step::Body(sealed(&format!(
            r#"{{"status":{{"code":"setup"}},"time_running":{running}}}"#
        )))
    }

    fn completed(config: &str, running: u64) -> Step {
        Step::Body(sealed(&format!(
            r#"{{"status":{{"code":"completed","client_config":"{config}"}},"time_running":{running}}}"#
        )))
    }

    fn agent_error(text: &str, running: u64) -> Step {
        Step::Body(sealed(&format!(
            r#"{{"status":{{"code":"error","error_text":"{text}"}},"time_running":{running}}}"#
        )))
    }

    fn garbage() -> Step {
        Step::Body("not an envelope".into())
    }

    struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        repeat: Option<Step>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                repeat: None,
                calls: AtomicU32::new(0),
            })
        }

        fn repeating(step: Step) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(VecDeque::new()),
                repeat: Some(step),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentTransport for ScriptedTransport {
        async fn fetch_status(
            &self,
            _endpoint: &AgentEndpoint,
        ) -> Result<String, AgentTransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .steps
                .lock()
                .pop_front()
                .or_else(|| self.repeat.clone())
                .unwrap_or(Step::Refused);
            match step {
                Step::Body(body) => Ok(body),
                Step::Refused => Err(AgentTransportError::Request("connection refused".into())),
            }
        }
    }

    #[derive(Clone)]
    struct Gate {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    impl Gate {
        fn new() -> Self {
            Self {
                entered: Arc::new(Notify::new()),
                release: Arc::new(Notify::new()),
            }
        }
    }

    #[derive(Default)]
    struct ProviderLog {
        keys_added: u32,
        keys_deleted: u32,
        servers_created: Vec<String>,
        servers_deleted: Vec<String>,
    }

    #[derive(Default)]
    struct MockProvider {
        log: Mutex<ProviderLog>,
        counter: AtomicU32,
        fail_add_key: bool,
        fail_creates: AtomicU32,
        fail_checks: AtomicU32,
        fail_server_deletes: bool,
        fail_key_deletes: bool,
        create_gate: Option<Gate>,
        check_gate: Option<Gate>,
    }

    impl MockProvider {
        fn log(&self) -> parking_lot::MutexGuard<'_, ProviderLog> {
            self.log.lock()
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        async fn add_ssh_key(&self, _material: &str) -> Result<CredentialHandle, ProviderError> {
            self.log.lock().keys_added += 1;
            if self.fail_add_key {
                return Err(ProviderError::Rejected("key quota exceeded".into()));
            }
            Ok(CredentialHandle::new("cred-1"))
        }

        async fn create_server(
            &self,
            _credential: &CredentialHandle,
            _region: &str,
            _bootstrap_command: &str,
        ) -> Result<ServerHandle, ProviderError> {
            if let Some(gate) = &self.create_gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            if self
                .fail_creates
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProviderError::Api("create failed".into()));
            }
            let id = format!("srv-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
            self.log.lock().servers_created.push(id.clone());
            Ok(ServerHandle {
                id,
                addr: None,
                agent_key: AgentKey::from_bytes(TEST_KEY),
            })
        }

        async fn check_server(&self, server: &ServerHandle) -> Result<ServerHandle, ProviderError> {
            if let Some(gate) = &self.check_gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            if self
                .fail_checks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProviderError::Api("boot failed".into()));
            }
            Ok(ServerHandle {
                addr: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                ..server.clone()
            })
        }

        async fn delete_server(&self, server: &ServerHandle) -> Result<(), ProviderError> {
            if self.fail_server_deletes {
                return Err(ProviderError::Api("delete refused".into()));
            }
            self.log.lock().servers_deleted.push(server.id.clone());
            Ok(())
        }

        async fn delete_ssh_key(
            &self,
            _credential: &CredentialHandle,
            _server: Option<&ServerHandle>,
        ) -> Result<(), ProviderError> {
            if self.fail_key_deletes {
                return Err(ProviderError::Api("key delete refused".into()));
            }
            self.log.lock().keys_deleted += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockBootstrapper {
        connects: AtomicU32,
        fail_connects: AtomicU32,
        fail_commands: AtomicU32,
        targets: Mutex<Vec<BootstrapTarget>>,
    }

    #[async_trait]
    impl Bootstrapper for MockBootstrapper {
        async fn connect(
            &self,
            target: &BootstrapTarget,
        ) -> Result<Box<dyn BootstrapSession>, BootstrapError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.targets.lock().push(target.clone());
            if self
                .fail_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BootstrapError::Connect {
                    host: target.host.clone(),
                    message: "probe refused".into(),
                });
            }
            let fail_command = self
                .fail_commands
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Ok(Box::new(MockLink { fail_command }))
        }
    }

    struct MockLink {
        fail_command: bool,
    }

    #[async_trait]
    impl BootstrapSession for MockLink {
        async fn run_bootstrap(&mut self, _script: &str) -> Result<(), BootstrapError> {
            if self.fail_command {
                return Err(BootstrapError::Command("exit code 1".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<SessionEvent>>,
    }

    impl RecordingSink {
        fn progress_contains(&self, needle: &str) -> bool {
            self.events.lock().iter().any(|event| {
                matches!(event, SessionEvent::Progress(message) if message.contains(needle))
            })
        }

        fn server_saved_count(&self) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|event| matches!(event, SessionEvent::ServerSaved(_)))
                .count()
        }

        fn saw_reconnect_advisory(&self) -> bool {
            self.events
                .lock()
                .iter()
                .any(|event| matches!(event, SessionEvent::ReconnectAdvisory))
        }

        fn saw_list_refresh(&self) -> bool {
            self.events
                .lock()
                .iter()
                .any(|event| matches!(event, SessionEvent::ServerListStale))
        }

        fn cleanup_failures(&self) -> Vec<&'static str> {
            self.events
                .lock()
                .iter()
                .filter_map(|event| match event {
                    SessionEvent::CleanupFailed { resource, .. } => Some(*resource),
                    _ => None,
                })
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: SessionEvent) {
            self.events.lock().push(event);
        }
    }

    struct Rig {
        orchestrator: Orchestrator,
        transport: Arc<ScriptedTransport>,
        bootstrapper: Arc<MockBootstrapper>,
        sink: Arc<RecordingSink>,
    }

    fn rig(transport: Arc<ScriptedTransport>, config: ProvisionConfig) -> Rig {
        rig_with(transport, Arc::new(MockBootstrapper::default()), config)
    }

    fn rig_with(
        transport: Arc<ScriptedTransport>,
        bootstrapper: Arc<MockBootstrapper>,
        config: ProvisionConfig,
    ) -> Rig {
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Orchestrator {
            bootstrapper: bootstrapper.clone(),
            poller: AgentPoller::with_transport(transport.clone()),
            events: sink.clone(),
            config,
        };
        Rig {
            orchestrator,
            transport,
            bootstrapper,
            sink,
        }
    }

    fn cloud_request() -> CloudRequest {
        CloudRequest {
            ssh_key_material: "ssh-ed25519 AAAAC3Nza test".into(),
            region: "ams3".into(),
            bootstrap_command: "curl -fsSL https://get.example.net | sh".into(),
            ssh_user: "root".into(),
            ssh_port: 22,
            ssh_auth: BootstrapAuth::Default,
        }
    }

    fn existing_request() -> ExistingTargetRequest {
        ExistingTargetRequest {
            target: BootstrapTarget {
                host: "198.51.100.4".into(),
                port: 22,
                user: "root".into(),
                auth: BootstrapAuth::Default,
            },
            bootstrap_command: "curl -fsSL https://get.example.net | sh".into(),
            agent_key: AgentKey::from_bytes(TEST_KEY),
        }
    }

    fn scope() -> SessionScope {
        CancelMediator::new().begin_session().unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn cloud_happy_path_completes_and_returns_the_key() {
        let rig = rig(
            ScriptedTransport::new(vec![idle(5), setting_up(60), completed("conf", 120)]),
            test_config(),
        );
        let provider = MockProvider::default();

        let session = rig
            .orchestrator
            .run_cloud(&provider, cloud_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.result_config(), Some("conf"));
        assert_eq!(session.poll_elapsed(), Duration::from_secs(120));
        assert!(!session.cancel_requested());
        // Ownership of the server transferred to the caller; only the key
        // was retracted.
        assert!(session.server().is_some());
        assert!(session.credential().is_none());

        let log = provider.log();
        assert_eq!(log.keys_added, 1);
        assert_eq!(log.keys_deleted, 1);
        assert_eq!(log.servers_created, vec!["srv-1"]);
        assert!(log.servers_deleted.is_empty());

        assert_eq!(rig.sink.server_saved_count(), 2);
        assert!(rig.sink.saw_list_refresh());
        assert!(rig.sink.progress_contains("Creating a new server"));
        assert!(rig.sink.progress_contains("installation is complete"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn agent_reported_error_fails_and_tears_down() {
        let rig = rig(
            ScriptedTransport::new(vec![agent_error("disk full", 30)]),
            test_config(),
        );
        let provider = MockProvider::default();

        let session = rig
            .orchestrator
            .run_cloud(&provider, cloud_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.last_error(), Some("disk full"));

        let log = provider.log();
        assert_eq!(log.servers_deleted, vec!["srv-1"]);
        assert_eq!(log.keys_deleted, 1);
        assert!(rig.sink.progress_contains("installation failed"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn unreachable_agent_advises_reconnect_and_fails() {
        let rig = rig(ScriptedTransport::repeating(Step::Refused), test_config());
        let provider = MockProvider::default();

        let session = rig
            .orchestrator
            .run_cloud(&provider, cloud_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Failed);
        let message = session.last_error().unwrap();
        assert!(message.contains("port 8400"), "got: {message}");
        assert!(message.contains("unreachable"), "got: {message}");
        assert_eq!(rig.transport.calls(), 1);
        assert!(rig.sink.saw_reconnect_advisory());
        assert_eq!(provider.log().servers_deleted, vec!["srv-1"]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn undecodable_responses_do_not_abort_the_loop() {
        let rig = rig(
            ScriptedTransport::new(vec![garbage(), garbage(), completed("conf", 15)]),
            test_config(),
        );
        let provider = MockProvider::default();

        let session = rig
            .orchestrator
            .run_cloud(&provider, cloud_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.result_config(), Some("conf"));
        assert!(rig.sink.progress_contains("could not be decrypted"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn remote_clock_past_budget_times_out_on_first_probe() {
        let rig = rig(ScriptedTransport::repeating(idle(301)), test_config());
        let provider = MockProvider::default();

        let session = rig
            .orchestrator
            .run_cloud(&provider, cloud_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(session.last_error().unwrap().contains("wait budget"));
        assert_eq!(session.poll_elapsed(), Duration::from_secs(301));
        // The budget is the agent's own clock; one probe was enough.
        assert_eq!(rig.transport.calls(), 1);
        assert_eq!(provider.log().servers_deleted, vec!["srv-1"]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn silent_agent_gets_exactly_sixty_probes() {
        let config = ProvisionConfig {
            wait_budget: Duration::from_millis(300),
            poll_interval: Duration::from_millis(5),
            ..test_config()
        };
        let rig = rig(ScriptedTransport::repeating(idle(0)), config);
        let provider = MockProvider::default();

        let session = rig
            .orchestrator
            .run_cloud(&provider, cloud_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(session.last_error().unwrap().contains("wait budget"));
        assert_eq!(rig.transport.calls(), 60);
    }

    #[test_timeout::tokio_timeout_test]
    async fn persistent_decode_failures_blame_the_key() {
        let config = ProvisionConfig {
            wait_budget: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
            ..test_config()
        };
        let rig = rig(ScriptedTransport::repeating(garbage()), config);
        let provider = MockProvider::default();

        let session = rig
            .orchestrator
            .run_cloud(&provider, cloud_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(session.last_error().unwrap().contains("could not be decoded"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn cancel_mid_boot_cleans_up_without_error() {
        let gate = Gate::new();
        let provider = Arc::new(MockProvider {
            check_gate: Some(gate.clone()),
            ..Default::default()
        });
        let rig = rig(ScriptedTransport::repeating(idle(0)), test_config());
        let mediator = CancelMediator::new();
        let scope = mediator.begin_session().unwrap();

        let task_provider = provider.clone();
        let orchestrator = rig.orchestrator;
        let handle = tokio::spawn(async move {
            orchestrator
                .run_cloud(task_provider.as_ref(), cloud_request(), scope)
                .await
        });

        gate.entered.notified().await;
        mediator.cancel();
        let session = handle.await.unwrap();

        assert_eq!(session.status(), SessionStatus::Cancelled);
        assert!(session.cancel_requested());
        assert_eq!(session.last_error(), None);
        let log = provider.log();
        assert_eq!(log.servers_deleted, vec!["srv-1"]);
        assert_eq!(log.keys_deleted, 1);
        assert!(!mediator.is_active());
    }

    #[test_timeout::tokio_timeout_test]
    async fn cancel_racing_creation_deletes_exactly_once() {
        let gate = Gate::new();
        let provider = Arc::new(MockProvider {
            create_gate: Some(gate.clone()),
            ..Default::default()
        });
        let rig = rig(ScriptedTransport::repeating(idle(0)), test_config());
        let mediator = CancelMediator::new();
        let scope = mediator.begin_session().unwrap();

        let task_provider = provider.clone();
        let orchestrator = rig.orchestrator;
        let handle = tokio::spawn(async move {
            orchestrator
                .run_cloud(task_provider.as_ref(), cloud_request(), scope)
                .await
        });

        // Cancel lands while create_server is in flight; the handle must
        // still be recorded and released exactly once.
        gate.entered.notified().await;
        mediator.cancel();
        mediator.cancel();
        gate.release.notify_one();
        let session = handle.await.unwrap();

        assert_eq!(session.status(), SessionStatus::Cancelled);
        let log = provider.log();
        assert_eq!(log.servers_created, vec!["srv-1"]);
        assert_eq!(log.servers_deleted, vec!["srv-1"]);
        assert_eq!(log.keys_deleted, 1);
        assert_eq!(rig.sink.server_saved_count(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn bootstrap_failures_burn_bounded_attempts() {
        let bootstrapper = Arc::new(MockBootstrapper {
            fail_connects: AtomicU32::new(3),
            ..Default::default()
        });
        let rig = rig_with(
            ScriptedTransport::repeating(idle(0)),
            bootstrapper,
            test_config(),
        );
        let provider = MockProvider::default();

        let session = rig
            .orchestrator
            .run_cloud(&provider, cloud_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(session.last_error().unwrap().contains("gave up after 3"));
        let log = provider.log();
        assert_eq!(log.servers_created.len(), 3);
        assert_eq!(log.servers_deleted.len(), 3);
        assert_eq!(log.keys_added, 1);
        assert_eq!(log.keys_deleted, 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn transient_boot_failure_recovers_with_a_fresh_server() {
        let provider = MockProvider {
            fail_checks: AtomicU32::new(1),
            ..Default::default()
        };
        let rig = rig(
            ScriptedTransport::new(vec![completed("conf", 10)]),
            test_config(),
        );

        let session = rig
            .orchestrator
            .run_cloud(&provider, cloud_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.result_config(), Some("conf"));
        let log = provider.log();
        assert_eq!(log.servers_created, vec!["srv-1", "srv-2"]);
        assert_eq!(log.servers_deleted, vec!["srv-1"]);
        assert_eq!(log.keys_deleted, 1);
        assert!(rig.sink.progress_contains("replacement server"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn key_registration_failure_is_immediately_fatal() {
        let provider = MockProvider {
            fail_add_key: true,
            ..Default::default()
        };
        let rig = rig(ScriptedTransport::repeating(idle(0)), test_config());

        let session = rig
            .orchestrator
            .run_cloud(&provider, cloud_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(session.last_error().unwrap().contains("key quota"));
        let log = provider.log();
        assert_eq!(log.keys_added, 1);
        assert!(log.servers_created.is_empty());
        assert_eq!(log.keys_deleted, 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn cleanup_failure_is_reported_but_never_masks_the_cause() {
        let provider = MockProvider {
            fail_server_deletes: true,
            ..Default::default()
        };
        let rig = rig(
            ScriptedTransport::new(vec![agent_error("disk full", 1)]),
            test_config(),
        );

        let session = rig
            .orchestrator
            .run_cloud(&provider, cloud_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.last_error(), Some("disk full"));
        assert_eq!(rig.sink.cleanup_failures(), vec!["server"]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn key_delete_failure_withholds_the_config_and_tears_down() {
        let provider = MockProvider {
            fail_key_deletes: true,
            ..Default::default()
        };
        let rig = rig(
            ScriptedTransport::new(vec![completed("conf", 20)]),
            test_config(),
        );

        let session = rig
            .orchestrator
            .run_cloud(&provider, cloud_request(), scope())
            .await;

        // The agent finished, but the session must not report success while
        // the registered key is still on the account.
        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(session.last_error().unwrap().contains("key delete refused"));
        assert_eq!(session.result_config(), None);
        assert!(session.server().is_none());

        let log = provider.log();
        assert_eq!(log.servers_deleted, vec!["srv-1"]);
        assert_eq!(log.keys_deleted, 0);
        assert_eq!(rig.sink.cleanup_failures(), vec!["ssh key"]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn existing_target_installs_without_provider_resources() {
        let rig = rig(
            ScriptedTransport::new(vec![setting_up(3), completed("conf", 8)]),
            test_config(),
        );

        let session = rig
            .orchestrator
            .run_existing(existing_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.mode(), SessionMode::PreExistingTarget);
        assert_eq!(session.result_config(), Some("conf"));
        assert_eq!(session.poll_elapsed(), Duration::from_secs(8));
        assert!(session.server().is_none());
        assert!(session.credential().is_none());

        let targets = rig.bootstrapper.targets.lock();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].host, "198.51.100.4");
    }

    #[test_timeout::tokio_timeout_test]
    async fn existing_target_surfaces_agent_errors() {
        let rig = rig(
            ScriptedTransport::new(vec![agent_error("apt broke", 2)]),
            test_config(),
        );

        let session = rig
            .orchestrator
            .run_existing(existing_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.last_error(), Some("apt broke"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn existing_target_does_not_retry_bootstrap() {
        let bootstrapper = Arc::new(MockBootstrapper {
            fail_commands: AtomicU32::new(1),
            ..Default::default()
        });
        let rig = rig_with(
            ScriptedTransport::repeating(idle(0)),
            bootstrapper,
            test_config(),
        );

        let session = rig
            .orchestrator
            .run_existing(existing_request(), scope())
            .await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(session.last_error().unwrap().contains("bootstrap command failed"));
        assert_eq!(rig.bootstrapper.connects.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn cancel_during_poll_ends_within_one_cycle() {
        let config = ProvisionConfig {
            poll_interval: Duration::from_millis(50),
            ..test_config()
        };
        let rig = rig(ScriptedTransport::repeating(idle(0)), config);
        let mediator = CancelMediator::new();
        let scope = mediator.begin_session().unwrap();

        let orchestrator = rig.orchestrator;
        let handle =
            tokio::spawn(async move { orchestrator.run_existing(existing_request(), scope).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        mediator.cancel();
        let session = handle.await.unwrap();

        assert_eq!(session.status(), SessionStatus::Cancelled);
        assert!(session.cancel_requested());
        assert_eq!(session.last_error(), None);
        assert!(!mediator.is_active());
    }
}
