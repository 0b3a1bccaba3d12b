use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::IsolationSession;
use crate::error::{Result, WsbError};

/// A child process supervised by a background task.
///
/// The task owns the [`Child`] and races its exit against a kill request, so
/// `wait` and `terminate` can be called through `&self` from any task.
pub struct ProcessSession {
    label: String,
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
    kill: watch::Sender<bool>,
}

impl ProcessSession {
    pub fn spawn(mut command: Command, label: &str) -> Result<Self> {
        command.kill_on_drop(true);
        let child = command
            .spawn()
            .map_err(|e| WsbError::Platform(format!("Failed to spawn {}: {}", label, e)))?;
        Ok(Self::supervise(child, label))
    }

    fn supervise(child: Child, label: &str) -> Self {
        let pid = child.id();
        let (kill, kill_rx) = watch::channel(false);
        let (exited_tx, exited) = watch::channel(false);

        tokio::spawn(supervise_child(child, label.to_string(), kill_rx, exited_tx));
        debug!(label = %label, pid = ?pid, "Session process started");

        Self {
            label: label.to_string(),
            pid,
            exited,
            kill,
        }
    }

    pub fn exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Request a kill without waiting for the exit.
    pub fn start_kill(&self) {
        self.kill.send_replace(true);
    }
}

async fn supervise_child(
    mut child: Child,
    label: String,
    mut kill: watch::Receiver<bool>,
    exited: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = async { kill.wait_for(|requested| *requested).await.map(|_| ()) } => {
            debug!(label = %label, "Killing session process");
            if let Err(e) = child.start_kill() {
                debug!(label = %label, error = %e, "Kill failed, process may already be gone");
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => debug!(label = %label, status = %status, "Session process exited"),
        Err(e) => warn!(label = %label, error = %e, "Failed to wait for session process"),
    }
    exited.send_replace(true);
}

#[async_trait]
impl IsolationSession for ProcessSession {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn has_exited(&self) -> bool {
        self.exited()
    }

    async fn wait(&self) -> Result<()> {
        let mut exited = self.exited.clone();
        exited
            .wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| WsbError::Platform(format!("Supervisor for {} vanished", self.label)))
    }

    async fn terminate(&self) -> Result<()> {
        self.start_kill();
        self.wait().await
    }
}
