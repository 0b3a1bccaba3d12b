//! In-process stand-ins for the isolation platform and guest agent.
//!
//! The fake agent speaks the real shared-folder protocol, so sandbox and
//! manager tests exercise the same channel code as production.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{ManagerConfig, PlatformKind, SandboxConfig};
use crate::error::{Result, WsbError};
use crate::sandbox::channel::{
    AgentRequest, AgentResponse, RequestBody, ResponseBody, REQUESTS_DIR, RESPONSES_DIR,
};
use crate::sandbox::platform::{IsolationPlatform, IsolationSession};
use crate::sandbox::{IsolationDescriptor, SandboxId, CHANNEL_GUEST_DIR};

const AGENT_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FakeBehavior {
    /// Session starts but no agent ever answers
    pub unresponsive: bool,
    /// Agent acknowledges shutdown but the session keeps running
    pub ignore_shutdown: bool,
    /// `launch` itself fails
    pub fail_launch: bool,
}

#[derive(Default)]
pub(crate) struct FakePlatform {
    behavior: FakeBehavior,
    pub launches: AtomicUsize,
    pub descriptors: Mutex<Vec<IsolationDescriptor>>,
}

impl FakePlatform {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            ..Default::default()
        }
    }
}

#[async_trait]
impl IsolationPlatform for FakePlatform {
    fn name(&self) -> &str {
        "fake"
    }

    async fn launch(
        &self,
        _id: SandboxId,
        descriptor: &IsolationDescriptor,
        _workdir: &Path,
    ) -> Result<Box<dyn IsolationSession>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.descriptors.lock().unwrap().push(descriptor.clone());

        if self.behavior.fail_launch {
            return Err(WsbError::Platform("fake launch failure".to_string()));
        }

        let channel_dir = descriptor
            .resolve_guest_path(CHANNEL_GUEST_DIR)
            .ok_or_else(|| WsbError::Platform("no channel folder mapped".to_string()))?;

        let (exited_tx, exited) = watch::channel(false);
        let exited_tx = Arc::new(exited_tx);
        let agent = (!self.behavior.unresponsive).then(|| {
            spawn_agent(channel_dir, !self.behavior.ignore_shutdown, exited_tx.clone())
        });

        Ok(Box::new(FakeSession {
            exited_tx,
            exited,
            agent: Mutex::new(agent),
        }))
    }
}

struct FakeSession {
    exited_tx: Arc<watch::Sender<bool>>,
    exited: watch::Receiver<bool>,
    agent: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl IsolationSession for FakeSession {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    async fn wait(&self) -> Result<()> {
        let mut exited = self.exited.clone();
        exited
            .wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| WsbError::Platform("fake session dropped".to_string()))
    }

    async fn terminate(&self) -> Result<()> {
        if let Some(agent) = self.agent.lock().unwrap().take() {
            agent.abort();
        }
        self.exited_tx.send_replace(true);
        Ok(())
    }
}

/// Serve a channel folder with the fake agent until aborted.
pub(crate) fn serve_channel_dir(root: PathBuf, honor_shutdown: bool) -> JoinHandle<()> {
    let (exited, _) = watch::channel(false);
    spawn_agent(root, honor_shutdown, Arc::new(exited))
}

fn spawn_agent(
    root: PathBuf,
    honor_shutdown: bool,
    exited: Arc<watch::Sender<bool>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok(mut entries) = tokio::fs::read_dir(root.join(REQUESTS_DIR)).await else {
                tokio::time::sleep(AGENT_POLL).await;
                continue;
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(content) = tokio::fs::read_to_string(&path).await else {
                    continue;
                };
                let _ = tokio::fs::remove_file(&path).await;
                let Ok(request) = serde_json::from_str::<AgentRequest>(&content) else {
                    continue;
                };

                let shutdown = request.body == RequestBody::Shutdown;
                if let Some(body) = respond(&request.body) {
                    write_response(&root, &request.id, body).await;
                }
                if shutdown && honor_shutdown {
                    exited.send_replace(true);
                    return;
                }
            }

            tokio::time::sleep(AGENT_POLL).await;
        }
    })
}

/// `echo X` prints X, `exit N` exits with N, `sleep ...` never answers.
fn respond(body: &RequestBody) -> Option<ResponseBody> {
    match body {
        RequestBody::Ping => Some(ResponseBody::Pong),
        RequestBody::Shutdown => Some(ResponseBody::ShutdownAck),
        RequestBody::Execute { command, .. } => {
            if command.starts_with("sleep") {
                return None;
            }
            if let Some(text) = command.strip_prefix("echo ") {
                return Some(ResponseBody::Execute {
                    exit_code: 0,
                    stdout: format!("{}\n", text),
                    stderr: String::new(),
                });
            }
            if let Some(code) = command.strip_prefix("exit ") {
                return Some(ResponseBody::Execute {
                    exit_code: code.trim().parse().unwrap_or(1),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            Some(ResponseBody::Execute {
                exit_code: 127,
                stdout: String::new(),
                stderr: format!("{}: command not found\n", command),
            })
        }
    }
}

async fn write_response(root: &Path, id: &str, body: ResponseBody) {
    let response = AgentResponse {
        id: id.to_string(),
        body,
    };
    let dir = root.join(RESPONSES_DIR);
    let tmp = dir.join(format!("{}.json.tmp", id));
    let path = dir.join(format!("{}.json", id));
    let json = serde_json::to_vec(&response).unwrap();
    if tokio::fs::write(&tmp, json).await.is_ok() {
        let _ = tokio::fs::rename(&tmp, &path).await;
    }
}

/// A config that starts fast against the fake platform.
pub(crate) fn quick_config(name: &str) -> SandboxConfig {
    let mut config = SandboxConfig {
        name: name.to_string(),
        memory_mb: 2048,
        cpu_cores: 2,
        ..Default::default()
    };
    config.timeouts.startup_seconds = 5;
    config.timeouts.exec_seconds = 5;
    config.timeouts.shutdown_seconds = 5;
    config.monitoring.interval_ms = 50;
    config.channel.poll_interval_ms = 10;
    config
}

pub(crate) fn manager_config(work_dir: &Path) -> ManagerConfig {
    ManagerConfig {
        platform: PlatformKind::Local,
        work_dir: Some(work_dir.to_path_buf()),
        agent_dir: Some(work_dir.join("agent")),
        ..Default::default()
    }
}
