use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::{Result, WsbError};
use crate::sandbox::channel::ExecutionChannel;
use crate::sandbox::monitor::ProcessSampler;
use crate::sandbox::platform::{IsolationPlatform, IsolationSession};
use crate::sandbox::state::StateCell;
use crate::sandbox::{
    ExecutionResult, IsolationDescriptor, ResourceMonitor, ResourceStats, SandboxEvent, SandboxId,
    SandboxState,
};
use crate::security::{AuditEvent, AuditLogger, CommandValidator};

/// Upper bound for a single readiness probe.
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause after a probe that failed outright rather than timing out.
const READY_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Host-side settings shared by every sandbox of a manager.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Each sandbox gets `<work_dir>/<id>/`
    pub work_dir: PathBuf,
    /// Host folder holding the guest agent binary
    pub agent_dir: PathBuf,
    /// Extra process names attributed to sandboxes when sampling
    pub monitored_processes: Vec<String>,
    /// How long the guest gets to acknowledge a shutdown request
    pub guest_shutdown_grace: Duration,
    /// How long a forced termination may take before it is abandoned
    pub force_kill_grace: Duration,
}

impl SandboxSettings {
    pub fn new(work_dir: PathBuf, agent_dir: PathBuf) -> Self {
        Self {
            work_dir,
            agent_dir,
            monitored_processes: Vec::new(),
            guest_shutdown_grace: Duration::from_secs(2),
            force_kill_grace: Duration::from_secs(2),
        }
    }
}

/// Collaborators a sandbox calls into.
#[derive(Clone)]
pub struct SandboxServices {
    pub platform: Arc<dyn IsolationPlatform>,
    pub validator: Arc<dyn CommandValidator>,
    pub audit: Arc<dyn AuditLogger>,
    pub settings: Arc<SandboxSettings>,
}

/// Point-in-time view of a sandbox for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxSummary {
    pub id: SandboxId,
    pub name: String,
    pub state: SandboxState,
    pub memory_mb: u64,
    pub cpu_cores: u32,
    pub created_at: DateTime<Utc>,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// One isolated guest environment.
///
/// Created and driven by the [`SandboxManager`](crate::manager::SandboxManager).
/// State only changes through [`SandboxEvent`] transitions; reads of the
/// state and of the latest resource sample never wait on a writer.
pub struct Sandbox {
    id: SandboxId,
    config: SandboxConfig,
    created_at: DateTime<Utc>,
    state: StateCell,
    services: SandboxServices,
    workdir: PathBuf,
    session: Mutex<Option<Arc<dyn IsolationSession>>>,
    channel: Mutex<Option<Arc<ExecutionChannel>>>,
    monitor: ResourceMonitor,
    failure: Mutex<Option<String>>,
}

impl Sandbox {
    pub(crate) fn new(config: SandboxConfig, services: SandboxServices) -> Self {
        let id = SandboxId::new();
        let workdir = services.settings.work_dir.join(id.to_string());
        let monitor = ResourceMonitor::new(id, config.monitoring.interval(), services.audit.clone());

        Self {
            id,
            config,
            created_at: Utc::now(),
            state: StateCell::new(),
            services,
            workdir,
            session: Mutex::new(None),
            channel: Mutex::new(None),
            monitor,
            failure: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SandboxId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn state(&self) -> SandboxState {
        self.state.load()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SandboxState::Running
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    /// Why the sandbox ended up FAILED, if it did.
    pub fn failure_reason(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Latest resource sample; zero before the first one. Never blocks.
    pub fn get_stats(&self) -> ResourceStats {
        self.monitor.get_stats()
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn summary(&self) -> SandboxSummary {
        SandboxSummary {
            id: self.id,
            name: self.config.name.clone(),
            state: self.state(),
            memory_mb: self.config.memory_mb,
            cpu_cores: self.config.cpu_cores,
            created_at: self.created_at,
            uptime_secs: self.uptime().as_secs(),
            failure: self.failure_reason(),
        }
    }

    fn session(&self) -> Option<Arc<dyn IsolationSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn channel(&self) -> Option<Arc<ExecutionChannel>> {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_failure(&self, reason: String) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(reason);
        }
    }

    /// Run `command` in the guest.
    ///
    /// `timeout` defaults to the configured exec timeout. A command that does
    /// not answer in time yields `timed_out = true` rather than an error, and
    /// may still be running inside the guest. If the sandbox leaves RUNNING
    /// while the command is pending, this fails fast with
    /// [`WsbError::SandboxNotRunning`].
    pub async fn execute(&self, command: &str, timeout: Option<Duration>) -> Result<ExecutionResult> {
        let timeout = timeout.unwrap_or_else(|| self.config.timeouts.exec());

        if let Err(reason) = self.services.validator.validate_command(command) {
            warn!(sandbox_id = %self.id, reason = %reason, "Command rejected");
            self.services.audit.record(AuditEvent::CommandRejected {
                sandbox_id: self.id,
                command: command.to_string(),
                reason: reason.clone(),
            });
            return Err(WsbError::Security { reason });
        }

        let not_running = |state: SandboxState| WsbError::SandboxNotRunning { id: self.id, state };
        let state = self.state();
        if state != SandboxState::Running {
            return Err(not_running(state));
        }
        let channel = self.channel().ok_or_else(|| not_running(state))?;

        debug!(sandbox_id = %self.id, command = %command, timeout_ms = timeout.as_millis() as u64, "Executing command");

        let mut state_rx = self.state.subscribe();
        let result = tokio::select! {
            biased;
            _ = async { state_rx.wait_for(|s| *s != SandboxState::Running).await.map(|_| ()) } => {
                return Err(not_running(self.state()));
            }
            result = channel.execute(command, &self.config.environment, timeout) => result?,
        };

        if result.timed_out {
            warn!(sandbox_id = %self.id, command = %command, "Command timed out");
        } else {
            info!(
                sandbox_id = %self.id,
                exit_code = result.exit_code,
                duration_ms = result.duration.as_millis() as u64,
                "Command completed"
            );
        }
        self.services.audit.record(AuditEvent::CommandExecuted {
            sandbox_id: self.id,
            command: command.to_string(),
            exit_code: result.exit_code,
            duration_ms: result.duration.as_millis() as u64,
            timed_out: result.timed_out,
        });

        Ok(result)
    }

    /// Drive PENDING → CREATING → RUNNING.
    ///
    /// On failure the sandbox is left FAILED (unless a concurrent shutdown
    /// already owns the teardown) and the cause is wrapped in
    /// [`WsbError::SandboxCreation`].
    pub(crate) async fn start(&self) -> Result<()> {
        // A shutdown can reach a sandbox that is still PENDING.
        if let Err(e) = self.state.transition(SandboxEvent::Provision) {
            debug!(sandbox_id = %self.id, error = %e, "Sandbox shut down before start");
            return Err(WsbError::SandboxCreation {
                id: self.id,
                source: Box::new(e),
            });
        }
        info!(
            sandbox_id = %self.id,
            name = %self.config.name,
            platform = self.services.platform.name(),
            "Creating sandbox"
        );

        match self.provision().await {
            Ok(()) => {
                info!(sandbox_id = %self.id, "Sandbox running");
                Ok(())
            }
            Err(e) => {
                warn!(sandbox_id = %self.id, error = %e, "Sandbox creation failed");
                self.record_failure(e.to_string());
                self.abort_creation().await;
                Err(WsbError::SandboxCreation {
                    id: self.id,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn provision(&self) -> Result<()> {
        let settings = &self.services.settings;
        tokio::fs::create_dir_all(&self.workdir).await?;

        let channel =
            Arc::new(ExecutionChannel::open(&self.config.channel, &self.workdir.join("channel")).await?);
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = Some(channel.clone());

        let descriptor =
            IsolationDescriptor::build(&self.config, &channel.guest_setup(), &settings.agent_dir);
        let session: Arc<dyn IsolationSession> = Arc::from(
            self.services
                .platform
                .launch(self.id, &descriptor, &self.workdir)
                .await?,
        );

        // Checked under the session lock so a racing shutdown either sees the
        // session or makes us discard it.
        let rejected = {
            let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            match self.state() {
                SandboxState::Creating => {
                    *slot = Some(session.clone());
                    None
                }
                state => Some(state),
            }
        };
        if let Some(state) = rejected {
            self.terminate_session(session.as_ref()).await;
            return Err(WsbError::SandboxNotRunning { id: self.id, state });
        }

        self.wait_until_ready(&channel, session.as_ref()).await?;
        self.state.transition(SandboxEvent::Ready)?;

        if self.config.monitoring.enabled {
            let mut names = self.services.platform.session_process_names();
            names.extend(settings.monitored_processes.iter().cloned());
            self.monitor
                .start(Box::new(ProcessSampler::new(session.pid(), names)));
        }

        Ok(())
    }

    /// Ping the agent until it answers, the startup timeout elapses, the
    /// session dies, or someone else moves the state on.
    async fn wait_until_ready(
        &self,
        channel: &ExecutionChannel,
        session: &dyn IsolationSession,
    ) -> Result<()> {
        let timeout = self.config.timeouts.startup();
        let deadline = Instant::now() + timeout;
        let mut state_rx = self.state.subscribe();
        let mut attempt = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WsbError::Platform(format!(
                    "Guest agent did not become ready within {:?}",
                    timeout
                )));
            }
            if session.has_exited().await {
                return Err(WsbError::Platform(
                    "Isolation session exited before the guest agent became ready".to_string(),
                ));
            }

            attempt += 1;
            tokio::select! {
                biased;
                _ = async { state_rx.wait_for(|s| *s != SandboxState::Creating).await.map(|_| ()) } => {
                    return Err(WsbError::SandboxNotRunning { id: self.id, state: self.state() });
                }
                ready = channel.ping(remaining.min(READY_PROBE_TIMEOUT)) => match ready {
                    Ok(true) => {
                        debug!(sandbox_id = %self.id, attempt, "Guest agent ready");
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(e) => {
                        debug!(sandbox_id = %self.id, attempt, error = %e, "Readiness probe failed");
                        tokio::time::sleep(READY_RETRY_DELAY.min(remaining)).await;
                    }
                },
            }
        }
    }

    async fn abort_creation(&self) {
        // A shutdown that raced creation owns the teardown from here.
        if self.state() == SandboxState::Stopping {
            return;
        }
        if let Err(e) = self.state.transition(SandboxEvent::Fail) {
            debug!(sandbox_id = %self.id, error = %e, "Sandbox already terminal");
        }

        self.monitor.stop().await;
        if let Some(session) = self.session() {
            self.terminate_session(session.as_ref()).await;
        }
        if let Some(channel) = self.channel() {
            channel.close().await;
        }
    }

    /// Force the session down, giving up after the kill grace.
    async fn terminate_session(&self, session: &dyn IsolationSession) -> bool {
        let grace = self.services.settings.force_kill_grace;
        match tokio::time::timeout(grace, session.terminate()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(sandbox_id = %self.id, error = %e, "Failed to terminate isolation session");
                false
            }
            Err(_) => {
                warn!(sandbox_id = %self.id, grace_ms = grace.as_millis() as u64, "Isolation session did not die within grace period");
                false
            }
        }
    }

    /// Shut down within `timeout`, or within the configured
    /// `[timeouts] shutdown_seconds` when `None`.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or_else(|| self.config.timeouts.shutdown());
        self.shutdown_until(Instant::now() + timeout).await
    }

    /// Tear the sandbox down, waiting until `deadline` for the session to exit.
    ///
    /// Already-terminal sandboxes return `Ok`. If another shutdown is in
    /// flight this waits for it instead and reports
    /// [`WsbError::ShutdownFailed`] if it ends FAILED. On timeout the session is killed,
    /// the sandbox becomes FAILED and [`WsbError::ShutdownTimeout`] is
    /// returned.
    pub async fn shutdown_until(&self, deadline: Instant) -> Result<()> {
        let timeout = deadline.saturating_duration_since(Instant::now());

        match self.state.transition(SandboxEvent::Stop) {
            Ok(_) => {}
            Err(WsbError::InvalidStateTransition { from, .. }) if from.is_terminal() => {
                debug!(sandbox_id = %self.id, state = %from, "Sandbox already shut down");
                return Ok(());
            }
            Err(WsbError::InvalidStateTransition { .. }) => {
                return self.wait_for_terminal(deadline, timeout).await;
            }
            Err(e) => return Err(e),
        }

        info!(sandbox_id = %self.id, timeout_ms = timeout.as_millis() as u64, "Shutting down sandbox");
        self.monitor.stop().await;

        let session = self.session();
        let channel = self.channel();

        if let (Some(channel), Some(_)) = (&channel, &session) {
            let grace = self.services.settings.guest_shutdown_grace.min(timeout);
            match channel.request_shutdown(grace).await {
                Ok(true) => debug!(sandbox_id = %self.id, "Guest acknowledged shutdown"),
                Ok(false) => debug!(sandbox_id = %self.id, "Guest did not acknowledge shutdown"),
                Err(e) => debug!(sandbox_id = %self.id, error = %e, "Shutdown request failed"),
            }
        }

        let outcome = match &session {
            None => Ok(()),
            Some(session) => match tokio::time::timeout_at(deadline, session.wait()).await {
                Ok(result) => result,
                Err(_) => Err(WsbError::ShutdownTimeout {
                    id: self.id,
                    timeout,
                }),
            },
        };

        if let Some(channel) = &channel {
            channel.close().await;
        }

        match outcome {
            Ok(()) => {
                self.state.transition(SandboxEvent::Exited)?;
                if let Err(e) = tokio::fs::remove_dir_all(&self.workdir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(sandbox_id = %self.id, path = %self.workdir.display(), error = %e, "Failed to remove sandbox work dir");
                    }
                }
                info!(sandbox_id = %self.id, "Sandbox stopped");
                self.services.audit.record(AuditEvent::SandboxStopped {
                    sandbox_id: self.id,
                });
                Ok(())
            }
            Err(e) => {
                warn!(sandbox_id = %self.id, error = %e, "Graceful shutdown failed, forcing");
                let forced = match &session {
                    Some(session) => self.terminate_session(session.as_ref()).await,
                    None => false,
                };
                self.record_failure(e.to_string());
                if let Err(err) = self.state.transition(SandboxEvent::Fail) {
                    debug!(sandbox_id = %self.id, error = %err, "Sandbox already terminal");
                }
                self.services.audit.record(AuditEvent::SandboxShutdownFailed {
                    sandbox_id: self.id,
                    reason: e.to_string(),
                    forced,
                });
                Err(e)
            }
        }
    }

    async fn wait_for_terminal(&self, deadline: Instant, timeout: Duration) -> Result<()> {
        debug!(sandbox_id = %self.id, "Shutdown already in progress, waiting");
        let mut state_rx = self.state.subscribe();
        let waited = tokio::time::timeout_at(deadline, async {
            state_rx.wait_for(|s| s.is_terminal()).await.map(|s| *s)
        })
        .await;

        match waited {
            Ok(Ok(SandboxState::Failed)) => Err(WsbError::ShutdownFailed {
                id: self.id,
                reason: self
                    .failure_reason()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            }),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(WsbError::Channel("State channel closed".to_string())),
            Err(_) => Err(WsbError::ShutdownTimeout {
                id: self.id,
                timeout,
            }),
        }
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}
