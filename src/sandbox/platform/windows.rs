use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{IsolationPlatform, IsolationSession, ProcessSession};
use crate::config::{SandboxConfig, TransportKind};
use crate::error::{Result, WsbError};
use crate::sandbox::monitor::{descends_from, snapshot, ProcessInfo};
use crate::sandbox::{IsolationDescriptor, SandboxId};

/// Host processes that make up a running Windows Sandbox.
pub const CLIENT_PROCESSES: &[&str] = &[
    "WindowsSandbox.exe",
    "WindowsSandboxClient.exe",
    "WindowsSandboxRemoteSession.exe",
    "vmmemWindowsSandbox",
];

const DEFAULT_EXECUTABLE: &str = r"C:\Windows\System32\WindowsSandbox.exe";
const CLIENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Launches sessions through `WindowsSandbox.exe` and a generated `.wsb` file.
///
/// Windows Sandbox runs a single instance per host; launching a second one
/// while another is up fails inside the launcher, not here.
#[derive(Debug)]
pub struct WindowsSandboxPlatform {
    executable: PathBuf,
}

impl WindowsSandboxPlatform {
    pub fn new(executable_override: Option<&Path>) -> Result<Self> {
        let executable =
            Self::locate(executable_override).ok_or_else(|| WsbError::PlatformUnavailable {
                platform: "windows".to_string(),
                reason: "WindowsSandbox.exe not found. Enable the 'Windows Sandbox' optional feature"
                    .to_string(),
            })?;
        Ok(Self { executable })
    }

    pub fn locate(executable_override: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = executable_override {
            return path.exists().then(|| path.to_path_buf());
        }
        which::which("WindowsSandbox.exe").ok().or_else(|| {
            let default = PathBuf::from(DEFAULT_EXECUTABLE);
            default.exists().then_some(default)
        })
    }

    pub fn is_available(executable_override: Option<&Path>) -> bool {
        cfg!(windows) && Self::locate(executable_override).is_some()
    }
}

#[async_trait]
impl IsolationPlatform for WindowsSandboxPlatform {
    fn name(&self) -> &str {
        "windows"
    }

    /// The guest sits behind the sandbox's NAT, so a host-side loopback
    /// address never reaches the agent's listener.
    fn check_config(&self, config: &SandboxConfig) -> Result<()> {
        if config.channel.transport == TransportKind::Loopback {
            return Err(WsbError::Config(format!(
                "sandbox '{}': the loopback transport cannot reach a Windows Sandbox guest; use transport = \"shared_folder\"",
                config.name
            )));
        }
        Ok(())
    }

    async fn launch(
        &self,
        id: SandboxId,
        descriptor: &IsolationDescriptor,
        workdir: &Path,
    ) -> Result<Box<dyn IsolationSession>> {
        let wsb_path = workdir.join("sandbox.wsb");
        tokio::fs::write(&wsb_path, descriptor.to_wsb_xml()).await?;

        info!(
            sandbox_id = %id,
            wsb = %wsb_path.display(),
            memory_mb = descriptor.memory_mb,
            "Launching Windows Sandbox"
        );

        // Clients already running belong to someone else and are never touched.
        let preexisting: HashSet<u32> = scan_processes(|_, processes| {
            processes
                .iter()
                .filter(|p| is_client_process(&p.name))
                .map(|p| p.pid)
                .collect()
        })
        .await?;
        if !preexisting.is_empty() {
            warn!(
                sandbox_id = %id,
                count = preexisting.len(),
                "Another Windows Sandbox is already running; the launch will likely fail"
            );
        }

        let mut command = Command::new(&self.executable);
        command.arg(&wsb_path);
        let launcher = ProcessSession::spawn(command, "WindowsSandbox.exe")?;

        Ok(Box::new(WindowsSandboxSession {
            launcher,
            preexisting: Arc::new(preexisting),
        }))
    }

    fn session_process_names(&self) -> Vec<String> {
        CLIENT_PROCESSES.iter().map(|s| s.to_string()).collect()
    }
}

/// The launcher may hand off to the client and exit early, so the session
/// counts as alive while any client process it owns is still running.
struct WindowsSandboxSession {
    launcher: ProcessSession,
    /// Client pids that were running before this session launched
    preexisting: Arc<HashSet<u32>>,
}

fn is_client_process(name: &str) -> bool {
    CLIENT_PROCESSES
        .iter()
        .any(|client| client.eq_ignore_ascii_case(name))
}

/// Processes owned by the session started from `launcher`: its descendants,
/// plus client processes that were not running before the launch. The
/// launcher itself is supervised separately and is not included.
fn owned_processes(
    processes: &[ProcessInfo],
    launcher: Option<u32>,
    preexisting: &HashSet<u32>,
) -> Vec<u32> {
    let by_pid: HashMap<u32, &ProcessInfo> = processes.iter().map(|p| (p.pid, p)).collect();
    processes
        .iter()
        .filter(|p| Some(p.pid) != launcher)
        .filter(|p| {
            let spawned = launcher.is_some_and(|root| descends_from(p, root, &by_pid));
            spawned || (is_client_process(&p.name) && !preexisting.contains(&p.pid))
        })
        .map(|p| p.pid)
        .collect()
}

/// Run `inspect` over a fresh process table on the blocking pool.
async fn scan_processes<T, F>(inspect: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&System, &[ProcessInfo]) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let processes = snapshot(&system);
        inspect(&system, &processes)
    })
    .await
    .map_err(|e| WsbError::Platform(format!("Process scan failed: {}", e)))
}

impl WindowsSandboxSession {
    /// Count (and optionally kill) the processes this session owns.
    async fn sweep(&self, kill: bool) -> Result<usize> {
        let launcher = self.launcher.pid();
        let preexisting = self.preexisting.clone();

        scan_processes(move |system, processes| {
            let owned = owned_processes(processes, launcher, &preexisting);
            if kill {
                for pid in &owned {
                    let killed = system
                        .process(Pid::from_u32(*pid))
                        .map(|process| process.kill())
                        .unwrap_or(false);
                    if !killed {
                        debug!(pid, "Failed to kill sandbox client process");
                    }
                }
            }
            owned.len()
        })
        .await
    }
}

#[async_trait]
impl IsolationSession for WindowsSandboxSession {
    fn pid(&self) -> Option<u32> {
        self.launcher.pid()
    }

    async fn has_exited(&self) -> bool {
        self.launcher.exited() && matches!(self.sweep(false).await, Ok(0))
    }

    async fn wait(&self) -> Result<()> {
        self.launcher.wait().await?;
        while self.sweep(false).await? > 0 {
            tokio::time::sleep(CLIENT_POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.launcher.start_kill();
        let killed = self.sweep(true).await?;
        debug!(killed, "Swept Windows Sandbox client processes");
        self.wait().await
    }
}
