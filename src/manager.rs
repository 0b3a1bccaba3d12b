//! The authoritative registry of sandboxes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{get_data_dir, validate_config, SandboxConfig, WsbConfig};
use crate::error::{Result, WsbError};
use crate::sandbox::platform::create_platform;
use crate::sandbox::{
    ExecutionResult, ResourceStats, Sandbox, SandboxId, SandboxServices, SandboxSettings,
    SandboxState,
};
use crate::security::{
    AuditEvent, AuditLogger, DefaultCommandValidator, JsonlAuditLogger, TracingAuditLogger,
};

#[derive(Default)]
struct Registry {
    by_id: HashMap<SandboxId, Arc<Sandbox>>,
    /// Points at the most recently registered sandbox with that name
    by_name: HashMap<String, SandboxId>,
}

impl Registry {
    fn insert(&mut self, sandbox: Arc<Sandbox>) {
        self.by_name.insert(sandbox.name().to_string(), sandbox.id());
        self.by_id.insert(sandbox.id(), sandbox);
    }

    fn remove(&mut self, id: &SandboxId) -> Option<Arc<Sandbox>> {
        let sandbox = self.by_id.remove(id)?;
        if self.by_name.get(sandbox.name()) == Some(id) {
            self.by_name.remove(sandbox.name());
            // Fall back to another sandbox with the same name, newest first.
            if let Some(other) = self
                .by_id
                .values()
                .filter(|s| s.name() == sandbox.name())
                .max_by_key(|s| s.created_at())
            {
                self.by_name.insert(other.name().to_string(), other.id());
            }
        }
        Some(sandbox)
    }
}

/// Outcome of [`SandboxManager::shutdown_all`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub stopped: Vec<SandboxId>,
    pub failed: Vec<(SandboxId, WsbError)>,
}

impl ShutdownReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Creates, tracks, and tears down sandboxes.
///
/// Sandboxes are registered once creation has finished, whether they ended
/// RUNNING or FAILED, and stay registered until [`prune_terminated`] drops
/// them. Registry state lives only as long as this value.
///
/// [`prune_terminated`]: SandboxManager::prune_terminated
pub struct SandboxManager {
    services: SandboxServices,
    default_shutdown_timeout: Duration,
    registry: RwLock<Registry>,
    /// Sandboxes between allocation and registration
    in_flight: Mutex<HashMap<SandboxId, Arc<Sandbox>>>,
}

impl SandboxManager {
    pub fn new(services: SandboxServices) -> Self {
        Self {
            services,
            default_shutdown_timeout: Duration::from_secs(30),
            registry: RwLock::new(Registry::default()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Wire up the platform, validator and audit sink from the global config.
    pub fn from_config(config: &WsbConfig) -> Result<Self> {
        let manager = &config.manager;
        let platform = create_platform(manager)?;

        let audit: Arc<dyn AuditLogger> = match &manager.audit_log {
            Some(path) => Arc::new(JsonlAuditLogger::open(path)?),
            None => Arc::new(TracingAuditLogger),
        };

        let work_dir = manager
            .work_dir
            .clone()
            .unwrap_or_else(|| get_data_dir().join("sandboxes"));
        let agent_dir = match &manager.agent_dir {
            Some(dir) => dir.clone(),
            None => default_agent_dir()?,
        };

        let mut settings = SandboxSettings::new(work_dir, agent_dir);
        settings.monitored_processes = manager.monitored_processes.clone();

        info!(
            platform = platform.name(),
            work_dir = %settings.work_dir.display(),
            agent_dir = %settings.agent_dir.display(),
            "Sandbox manager ready"
        );

        let services = SandboxServices {
            platform,
            validator: Arc::new(DefaultCommandValidator::new()),
            audit,
            settings: Arc::new(settings),
        };
        Ok(Self::new(services)
            .with_shutdown_timeout(Duration::from_secs(manager.shutdown_timeout_seconds)))
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.default_shutdown_timeout = timeout;
        self
    }

    pub fn platform_name(&self) -> &str {
        self.services.platform.name()
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate `config`, start a sandbox from it and register the result.
    ///
    /// A sandbox that fails to start is still registered, in FAILED state, and
    /// the error carries its id. Startup commands run once the sandbox is
    /// RUNNING; their failures are logged and audited but not returned.
    pub async fn create_sandbox(&self, config: SandboxConfig) -> Result<Arc<Sandbox>> {
        validate_config(&config)?;
        self.services.platform.check_config(&config)?;

        let sandbox = Arc::new(Sandbox::new(config, self.services.clone()));
        let id = sandbox.id();
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sandbox.clone());

        let started = sandbox.start().await;

        self.write_registry().insert(sandbox.clone());
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        if let Err(e) = started {
            self.services.audit.record(AuditEvent::SandboxCreationFailed {
                sandbox_id: id,
                name: sandbox.name().to_string(),
                reason: sandbox
                    .failure_reason()
                    .unwrap_or_else(|| e.to_string()),
            });
            return Err(e);
        }

        self.services.audit.record(AuditEvent::SandboxCreated {
            sandbox_id: id,
            name: sandbox.name().to_string(),
            memory_mb: sandbox.config().memory_mb,
            cpu_cores: sandbox.config().cpu_cores,
        });

        self.run_startup_commands(&sandbox).await;
        Ok(sandbox)
    }

    async fn run_startup_commands(&self, sandbox: &Sandbox) {
        for command in &sandbox.config().startup_commands {
            let reason = match sandbox.execute(command, None).await {
                Ok(result) if result.success => {
                    debug!(sandbox_id = %sandbox.id(), command = %command, "Startup command succeeded");
                    continue;
                }
                Ok(result) if result.timed_out => "timed out".to_string(),
                Ok(result) => format!(
                    "exit code {}: {}",
                    result.exit_code,
                    result.stderr.trim()
                ),
                Err(e) => e.to_string(),
            };

            warn!(sandbox_id = %sandbox.id(), command = %command, reason = %reason, "Startup command failed");
            self.services.audit.record(AuditEvent::StartupCommandFailed {
                sandbox_id: sandbox.id(),
                command: command.clone(),
                reason,
            });
        }
    }

    pub fn get_sandbox(&self, id: SandboxId) -> Option<Arc<Sandbox>> {
        self.read_registry().by_id.get(&id).cloned()
    }

    /// Most recently created sandbox with this name.
    pub fn get_sandbox_by_name(&self, name: &str) -> Option<Arc<Sandbox>> {
        let registry = self.read_registry();
        registry
            .by_name
            .get(name)
            .and_then(|id| registry.by_id.get(id))
            .cloned()
    }

    /// Snapshot of registered sandboxes, optionally filtered by state.
    pub fn list_sandboxes(&self, state: Option<SandboxState>) -> Vec<Arc<Sandbox>> {
        self.read_registry()
            .by_id
            .values()
            .filter(|sandbox| state.map_or(true, |wanted| sandbox.state() == wanted))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_registry().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn require(&self, id: SandboxId) -> Result<Arc<Sandbox>> {
        self.get_sandbox(id).ok_or_else(|| WsbError::SandboxNotFound {
            id: id.to_string(),
        })
    }

    pub async fn execute(
        &self,
        id: SandboxId,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        self.require(id)?.execute(command, timeout).await
    }

    pub fn get_stats(&self, id: SandboxId) -> Result<ResourceStats> {
        Ok(self.require(id)?.get_stats())
    }

    /// Shut one sandbox down. Already-terminal sandboxes succeed immediately.
    ///
    /// Without a `timeout` the sandbox's own `[timeouts] shutdown_seconds` applies.
    pub async fn shutdown_sandbox(&self, id: SandboxId, timeout: Option<Duration>) -> Result<()> {
        self.require(id)?.shutdown(timeout).await
    }

    /// Shut every live sandbox down concurrently.
    ///
    /// Covers sandboxes still being created. With a `timeout` all sandboxes
    /// share one deadline. Without one each sandbox gets its configured
    /// shutdown timeout, capped at the manager default. Either way wall-clock
    /// time is bounded by the longest deadline plus the force-kill grace,
    /// regardless of how many sandboxes there are.
    pub async fn shutdown_all(&self, timeout: Option<Duration>) -> ShutdownReport {
        let started = Instant::now();

        let mut targets: HashMap<SandboxId, Arc<Sandbox>> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        targets.extend(
            self.read_registry()
                .by_id
                .iter()
                .map(|(id, sandbox)| (*id, sandbox.clone())),
        );
        targets.retain(|_, sandbox| !sandbox.state().is_terminal());

        info!(
            count = targets.len(),
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            "Shutting down all sandboxes"
        );

        let mut tasks = JoinSet::new();
        for (id, sandbox) in targets {
            let deadline = started
                + timeout.unwrap_or_else(|| {
                    sandbox
                        .config()
                        .timeouts
                        .shutdown()
                        .min(self.default_shutdown_timeout)
                });
            tasks.spawn(async move { (id, sandbox.shutdown_until(deadline).await) });
        }

        let mut report = ShutdownReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(()))) => report.stopped.push(id),
                Ok((id, Err(e))) => report.failed.push((id, e)),
                Err(e) => warn!(error = %e, "Shutdown task panicked"),
            }
        }

        if !report.is_success() {
            warn!(
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                "Some sandboxes did not shut down cleanly"
            );
        }
        report
    }

    /// Drop STOPPED and FAILED sandboxes from the registry. Returns how many went.
    pub fn prune_terminated(&self) -> usize {
        let mut registry = self.write_registry();
        let terminated: Vec<SandboxId> = registry
            .by_id
            .values()
            .filter(|sandbox| sandbox.state().is_terminal())
            .map(|sandbox| sandbox.id())
            .collect();

        for id in &terminated {
            registry.remove(id);
        }
        if !terminated.is_empty() {
            debug!(count = terminated.len(), "Pruned terminated sandboxes");
        }
        terminated.len()
    }
}

/// The directory `wsb` itself lives in; the agent ships next to it.
fn default_agent_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(|dir| dir.to_path_buf())
        .ok_or_else(|| WsbError::Config(format!("Cannot locate directory of {}", exe.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::sandbox::platform::WindowsSandboxPlatform;
    use crate::security::audit::tests::RecordingAuditLogger;
    use crate::testing::{manager_config, quick_config, FakeBehavior, FakePlatform};

    struct Fixture {
        _dir: tempfile::TempDir,
        audit: Arc<RecordingAuditLogger>,
        platform: Arc<FakePlatform>,
        manager: SandboxManager,
    }

    fn fixture(behavior: FakeBehavior) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(RecordingAuditLogger::default());
        let platform = Arc::new(FakePlatform::new(behavior));

        let mut settings =
            SandboxSettings::new(dir.path().join("work"), dir.path().join("agent"));
        settings.guest_shutdown_grace = Duration::from_millis(200);
        settings.force_kill_grace = Duration::from_millis(500);

        let manager = SandboxManager::new(SandboxServices {
            platform: platform.clone(),
            validator: Arc::new(DefaultCommandValidator::new()),
            audit: audit.clone(),
            settings: Arc::new(settings),
        });
        Fixture {
            _dir: dir,
            audit,
            platform,
            manager,
        }
    }

    #[tokio::test]
    async fn test_build_env_lifecycle() {
        let fx = fixture(FakeBehavior::default());

        let mut config = quick_config("build-env");
        config.memory_mb = 2048;
        config.cpu_cores = 2;
        let sandbox = fx.manager.create_sandbox(config).await.unwrap();
        let id = sandbox.id();

        assert_eq!(sandbox.state(), SandboxState::Running);
        assert_eq!(sandbox.config().memory_mb, 2048);
        assert_eq!(
            fx.platform.descriptors.lock().unwrap()[0].memory_mb,
            2048
        );

        let result = fx
            .manager
            .execute(id, "echo hi", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hi"));
        assert!(result.success);

        fx.manager
            .shutdown_sandbox(id, Some(Duration::from_secs(30)))
            .await
            .unwrap();
        let sandbox = fx.manager.get_sandbox(id).unwrap();
        assert_eq!(sandbox.state(), SandboxState::Stopped);
        assert!(!sandbox.is_running());
        assert!(!sandbox.monitor().is_running());

        assert_eq!(
            fx.audit
                .count(|e| matches!(e, AuditEvent::SandboxCreated { memory_mb: 2048, .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_list_filter_after_stopping_one() {
        let fx = fixture(FakeBehavior::default());

        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            ids.push(fx.manager.create_sandbox(quick_config(name)).await.unwrap().id());
        }
        fx.manager
            .shutdown_sandbox(ids[1], Some(Duration::from_secs(5)))
            .await
            .unwrap();

        let mut running: Vec<SandboxId> = fx
            .manager
            .list_sandboxes(Some(SandboxState::Running))
            .iter()
            .map(|s| s.id())
            .collect();
        running.sort_by_key(|id| id.to_string());
        let mut expected = vec![ids[0], ids[2]];
        expected.sort_by_key(|id| id.to_string());
        assert_eq!(running, expected);

        assert_eq!(fx.manager.list_sandboxes(None).len(), 3);
        assert_eq!(
            fx.manager
                .list_sandboxes(Some(SandboxState::Stopped))
                .len(),
            1
        );

        fx.manager.shutdown_all(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let fx = fixture(FakeBehavior::default());
        let id = fx
            .manager
            .create_sandbox(quick_config("twice"))
            .await
            .unwrap()
            .id();

        fx.manager
            .shutdown_sandbox(id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        fx.manager
            .shutdown_sandbox(id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(
            fx.manager.get_sandbox(id).unwrap().state(),
            SandboxState::Stopped
        );
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let fx = fixture(FakeBehavior::default());
        let ghost = SandboxId::new();

        assert!(fx.manager.get_sandbox(ghost).is_none());
        assert!(fx.manager.get_sandbox_by_name("ghost").is_none());
        assert!(matches!(
            fx.manager.shutdown_sandbox(ghost, Some(Duration::from_secs(1))).await,
            Err(WsbError::SandboxNotFound { .. })
        ));
        assert!(matches!(
            fx.manager.execute(ghost, "echo hi", None).await,
            Err(WsbError::SandboxNotFound { .. })
        ));
        assert!(matches!(
            fx.manager.get_stats(ghost),
            Err(WsbError::SandboxNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_allocates_nothing() {
        let fx = fixture(FakeBehavior::default());
        let mut config = quick_config("tiny");
        config.memory_mb = 1;

        let err = fx.manager.create_sandbox(config).await.unwrap_err();
        assert!(matches!(err, WsbError::Config(_)));
        assert!(fx.manager.is_empty());
        assert_eq!(fx.platform.launches.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_creation_is_registered() {
        let fx = fixture(FakeBehavior {
            unresponsive: true,
            ..Default::default()
        });
        let mut config = quick_config("mute");
        config.timeouts.startup_seconds = 1;

        let err = fx.manager.create_sandbox(config).await.unwrap_err();
        let id = match &err {
            WsbError::SandboxCreation { id, .. } => *id,
            other => panic!("expected creation error, got {other}"),
        };

        let sandbox = fx.manager.get_sandbox(id).unwrap();
        assert_eq!(sandbox.state(), SandboxState::Failed);
        assert!(sandbox.failure_reason().is_some());
        assert_eq!(
            fx.audit
                .count(|e| matches!(e, AuditEvent::SandboxCreationFailed { .. })),
            1
        );

        // Terminal states never change again.
        fx.manager
            .shutdown_sandbox(id, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(sandbox.state(), SandboxState::Failed);
    }

    #[tokio::test]
    async fn test_exec_timeout_is_bounded() {
        let fx = fixture(FakeBehavior::default());
        let sandbox = fx.manager.create_sandbox(quick_config("slow")).await.unwrap();

        let timeout = Duration::from_millis(300);
        let started = std::time::Instant::now();
        let result = sandbox.execute("sleep 600", Some(timeout)).await.unwrap();

        assert!(result.timed_out);
        assert!(!result.success);
        assert!(started.elapsed() < timeout + Duration::from_secs(1));
        assert!(matches!(
            result.into_result(timeout),
            Err(WsbError::ExecutionTimeout { .. })
        ));

        fx.manager.shutdown_all(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn test_shutdown_all_shares_one_deadline() {
        let fx = fixture(FakeBehavior {
            ignore_shutdown: true,
            ..Default::default()
        });
        for i in 0..4 {
            fx.manager
                .create_sandbox(quick_config(&format!("stuck-{i}")))
                .await
                .unwrap();
        }

        let timeout = Duration::from_millis(500);
        let started = std::time::Instant::now();
        let report = fx.manager.shutdown_all(Some(timeout)).await;
        let elapsed = started.elapsed();

        // Sequential shutdowns would take at least 4 x 500ms.
        assert!(elapsed < Duration::from_millis(1800), "took {elapsed:?}");
        assert_eq!(report.failed.len(), 4);
        assert!(report.stopped.is_empty());
        assert!(report
            .failed
            .iter()
            .all(|(_, e)| matches!(e, WsbError::ShutdownTimeout { .. })));
        assert!(fx
            .manager
            .list_sandboxes(None)
            .iter()
            .all(|s| s.state() == SandboxState::Failed));
    }

    #[tokio::test]
    async fn test_shutdown_all_mixed_results() {
        let fx = fixture(FakeBehavior::default());
        let a = fx.manager.create_sandbox(quick_config("a")).await.unwrap();
        let b = fx.manager.create_sandbox(quick_config("b")).await.unwrap();
        b.shutdown(Some(Duration::from_secs(5))).await.unwrap();

        let report = fx.manager.shutdown_all(Some(Duration::from_secs(5))).await;
        assert!(report.is_success());
        // Already-stopped sandboxes are skipped.
        assert_eq!(report.stopped, vec![a.id()]);
    }

    #[tokio::test]
    async fn test_name_lookup_and_prune() {
        let fx = fixture(FakeBehavior::default());
        let first = fx.manager.create_sandbox(quick_config("dup")).await.unwrap();
        let second = fx.manager.create_sandbox(quick_config("dup")).await.unwrap();

        assert_eq!(
            fx.manager.get_sandbox_by_name("dup").unwrap().id(),
            second.id()
        );

        second.shutdown(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(fx.manager.prune_terminated(), 1);
        assert!(fx.manager.get_sandbox(second.id()).is_none());
        assert_eq!(
            fx.manager.get_sandbox_by_name("dup").unwrap().id(),
            first.id()
        );
        assert_eq!(fx.manager.len(), 1);

        fx.manager.shutdown_all(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn test_startup_command_failures_are_audited() {
        let fx = fixture(FakeBehavior::default());
        let mut config = quick_config("boot");
        config.startup_commands = vec!["echo ok".to_string(), "exit 2".to_string()];

        let sandbox = fx.manager.create_sandbox(config).await.unwrap();
        assert!(sandbox.is_running());
        assert_eq!(
            fx.audit
                .count(|e| matches!(e, AuditEvent::StartupCommandFailed { .. })),
            1
        );
        assert_eq!(
            fx.audit
                .count(|e| matches!(e, AuditEvent::CommandExecuted { .. })),
            2
        );

        fx.manager.shutdown_all(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn test_stats_zero_before_sampling() {
        let fx = fixture(FakeBehavior::default());
        let mut config = quick_config("quiet");
        config.monitoring.enabled = false;
        let sandbox = fx.manager.create_sandbox(config).await.unwrap();

        let stats = fx.manager.get_stats(sandbox.id()).unwrap();
        assert_eq!(stats.memory_mb, 0);
        assert_eq!(stats.cpu_percent, 0.0);
        assert_eq!(stats.disk_mb, 0);

        fx.manager.shutdown_all(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn test_shutdown_all_covers_in_flight_creation() {
        let fx = fixture(FakeBehavior {
            unresponsive: true,
            ..Default::default()
        });
        let manager = Arc::new(fx.manager);

        let creating = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.create_sandbox(quick_config("slow-boot")).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Still creating, so not registered yet.
        assert!(manager.is_empty());

        let started = std::time::Instant::now();
        let report = manager.shutdown_all(Some(Duration::from_secs(1))).await;
        assert_eq!(report.stopped.len() + report.failed.len(), 1);

        let err = creating.await.unwrap().unwrap_err();
        assert!(matches!(err, WsbError::SandboxCreation { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));

        let sandboxes = manager.list_sandboxes(None);
        assert_eq!(sandboxes.len(), 1);
        assert!(sandboxes[0].state().is_terminal());
        assert_eq!(
            fx.audit
                .count(|e| matches!(e, AuditEvent::SandboxCreated { .. })),
            0
        );
    }

    #[tokio::test]
    async fn test_shutdown_defaults_to_configured_timeout() {
        let fx = fixture(FakeBehavior {
            ignore_shutdown: true,
            ..Default::default()
        });
        let mut config = quick_config("stubborn");
        config.timeouts.shutdown_seconds = 1;
        let id = fx.manager.create_sandbox(config).await.unwrap().id();

        let started = std::time::Instant::now();
        let err = fx.manager.shutdown_sandbox(id, None).await.unwrap_err();
        assert!(matches!(err, WsbError::ShutdownTimeout { .. }));
        // The 30s manager default does not apply.
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(
            fx.manager.get_sandbox(id).unwrap().state(),
            SandboxState::Failed
        );
    }

    #[tokio::test]
    async fn test_shutdown_all_default_is_per_sandbox_and_capped() {
        let fx = fixture(FakeBehavior {
            ignore_shutdown: true,
            ..Default::default()
        });
        let manager = fx.manager.with_shutdown_timeout(Duration::from_secs(1));

        let mut quick = quick_config("quick");
        quick.timeouts.shutdown_seconds = 1;
        let mut slow = quick_config("slow");
        slow.timeouts.shutdown_seconds = 600;
        manager.create_sandbox(quick).await.unwrap();
        manager.create_sandbox(slow).await.unwrap();

        let started = std::time::Instant::now();
        let report = manager.shutdown_all(None).await;
        let elapsed = started.elapsed();

        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().all(|(_, e)| matches!(
            e,
            WsbError::ShutdownTimeout { timeout, .. } if *timeout <= Duration::from_secs(1)
        )));
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_platform_rejects_unreachable_transport() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(RecordingAuditLogger::default());
        // Any existing executable stands in for the launcher; nothing is launched.
        let launcher = std::env::current_exe().unwrap();
        let manager = SandboxManager::new(SandboxServices {
            platform: Arc::new(WindowsSandboxPlatform::new(Some(&launcher)).unwrap()),
            validator: Arc::new(DefaultCommandValidator::new()),
            audit: audit.clone(),
            settings: Arc::new(SandboxSettings::new(
                dir.path().join("work"),
                dir.path().join("agent"),
            )),
        });

        let mut config = quick_config("nat");
        config.channel.transport = TransportKind::Loopback;
        config.security.networking = true;

        let err = manager.create_sandbox(config).await.unwrap_err();
        assert!(matches!(err, WsbError::Config(_)));
        assert!(manager.is_empty());
        assert!(!dir.path().join("work").exists());
        assert_eq!(audit.count(|_| true), 0);
    }

    #[test]
    fn test_from_config_uses_local_platform() {
        let dir = tempfile::tempdir().unwrap();
        let config = WsbConfig {
            manager: manager_config(dir.path()),
        };
        let manager = SandboxManager::from_config(&config).unwrap();
        assert_eq!(manager.platform_name(), "local");
        assert!(manager.is_empty());
    }
}
