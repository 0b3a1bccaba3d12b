use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::pending::PendingTable;
use super::protocol::{AgentRequest, AgentResponse, ResponseBody};
use super::{GuestChannelSetup, Transport};
use crate::config::FolderMapping;
use crate::error::{Result, WsbError};
use crate::sandbox::CHANNEL_GUEST_DIR;

pub const REQUESTS_DIR: &str = "requests";
pub const RESPONSES_DIR: &str = "responses";

/// Message exchange through a folder mapped read-write into the guest.
///
/// The host writes `requests/<id>.json`; the agent answers with
/// `responses/<id>.json`. Both sides write to a `.tmp` file and rename, so a
/// reader never sees a partial message. A background task polls the
/// responses folder and resolves waiters.
pub struct SharedFolderTransport {
    root: PathBuf,
    pending: Arc<PendingTable>,
    stop: watch::Sender<bool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl SharedFolderTransport {
    pub async fn open(root: &Path, poll_interval: Duration) -> Result<Self> {
        tokio::fs::create_dir_all(root.join(REQUESTS_DIR)).await?;
        tokio::fs::create_dir_all(root.join(RESPONSES_DIR)).await?;

        let pending = Arc::new(PendingTable::default());
        let (stop, stop_rx) = watch::channel(false);
        let poller = tokio::spawn(poll_responses(
            root.join(RESPONSES_DIR),
            pending.clone(),
            poll_interval,
            stop_rx,
        ));

        debug!(root = %root.display(), "Shared-folder channel opened");

        Ok(Self {
            root: root.to_path_buf(),
            pending,
            stop,
            poller: Mutex::new(Some(poller)),
        })
    }

    fn request_path(&self, id: &str) -> PathBuf {
        self.root.join(REQUESTS_DIR).join(format!("{}.json", id))
    }
}

#[async_trait]
impl Transport for SharedFolderTransport {
    fn name(&self) -> &'static str {
        "shared_folder"
    }

    fn guest_setup(&self) -> GuestChannelSetup {
        GuestChannelSetup {
            folders: vec![FolderMapping {
                host_path: self.root.clone(),
                guest_path: CHANNEL_GUEST_DIR.to_string(),
                readonly: false,
            }],
            agent_args: vec!["--channel-dir".to_string(), CHANNEL_GUEST_DIR.to_string()],
        }
    }

    async fn send(&self, request: &AgentRequest) -> Result<()> {
        let json = serde_json::to_vec(request)?;
        let path = self.request_path(&request.id);
        let tmp = path.with_extension("json.tmp");

        self.pending.register(&request.id);
        let written = async {
            tokio::fs::write(&tmp, &json).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = written {
            self.pending.forget(&request.id);
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(WsbError::Channel(format!(
                "Failed to write request {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }

    async fn poll_or_block_for(&self, id: &str, timeout: Duration) -> Result<Option<ResponseBody>> {
        self.pending.wait(id, timeout).await
    }

    fn cancel(&self, id: &str) {
        self.pending.forget(id);
        // The agent may not have picked it up yet.
        let _ = std::fs::remove_file(self.request_path(id));
    }

    async fn close(&self) {
        self.stop.send_replace(true);
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = poller {
            if let Err(e) = handle.await {
                warn!(error = %e, "Response poller ended abnormally");
            }
        }
        self.pending.close();
    }
}

async fn poll_responses(
    dir: PathBuf,
    pending: Arc<PendingTable>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if let Err(e) = drain_responses(&dir, &pending).await {
            debug!(dir = %dir.display(), error = %e, "Failed to scan responses");
        }

        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(dir = %dir.display(), "Response poller stopped");
}

async fn drain_responses(dir: &Path, pending: &PendingTable) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Response not readable yet");
                continue;
            }
        };
        let _ = tokio::fs::remove_file(&path).await;

        match serde_json::from_str::<AgentResponse>(&content) {
            Ok(response) => {
                pending.resolve(response);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Malformed agent response"),
        }
    }

    Ok(())
}
