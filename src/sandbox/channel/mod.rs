//! Request/response bridge between the host and the in-guest agent.
//!
//! The isolation boundary offers no RPC primitive, so every request carries a
//! correlation id and the transport matches responses back to waiters. The
//! [`Transport`] trait hides how bytes cross the boundary; [`ExecutionChannel`]
//! speaks the protocol on top of it.

mod loopback;
mod pending;
pub mod protocol;
mod shared_folder;

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::config::{ChannelConfig, FolderMapping, TransportKind};
use crate::error::{Result, WsbError};
use crate::sandbox::ExecutionResult;

pub use loopback::LoopbackTransport;
pub use protocol::{AgentRequest, AgentResponse, RequestBody, ResponseBody};
pub use shared_folder::{SharedFolderTransport, REQUESTS_DIR, RESPONSES_DIR};

/// What the guest side needs to reach the host end of a channel.
#[derive(Debug, Clone, Default)]
pub struct GuestChannelSetup {
    /// Extra folders to map into the guest
    pub folders: Vec<FolderMapping>,
    /// Arguments passed to the guest agent
    pub agent_args: Vec<String>,
}

/// Moves correlated messages across the isolation boundary.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn guest_setup(&self) -> GuestChannelSetup;

    /// Register and transmit `request`. Must not wait for the response.
    async fn send(&self, request: &AgentRequest) -> Result<()>;

    /// Wait for the response correlated to `id`; `Ok(None)` on timeout.
    async fn poll_or_block_for(&self, id: &str, timeout: Duration) -> Result<Option<ResponseBody>>;

    /// Forget a request. A late response for it is discarded.
    fn cancel(&self, id: &str);

    /// Stop background work and fail any waiters.
    async fn close(&self);
}

/// Cancels the request if the owning future is dropped before it completes.
struct CancelOnDrop<'a> {
    transport: &'a dyn Transport,
    id: &'a str,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(id = %self.id, "Abandoning pending request");
            self.transport.cancel(self.id);
        }
    }
}

pub struct ExecutionChannel {
    transport: Box<dyn Transport>,
}

impl ExecutionChannel {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Open the transport selected by `config`, rooted at `host_dir`.
    pub async fn open(config: &ChannelConfig, host_dir: &Path) -> Result<Self> {
        let transport: Box<dyn Transport> = match config.transport {
            TransportKind::SharedFolder => {
                Box::new(SharedFolderTransport::open(host_dir, config.poll_interval()).await?)
            }
            TransportKind::Loopback => Box::new(LoopbackTransport::new(config.loopback_address)),
        };
        debug!(transport = transport.name(), "Execution channel opened");
        Ok(Self::new(transport))
    }

    pub fn guest_setup(&self) -> GuestChannelSetup {
        self.transport.guest_setup()
    }

    /// Send one request and wait for its response. Dropping the returned
    /// future abandons the request.
    pub async fn request(&self, body: RequestBody, timeout: Duration) -> Result<Option<ResponseBody>> {
        let request = AgentRequest::new(body);
        let mut guard = CancelOnDrop {
            transport: self.transport.as_ref(),
            id: &request.id,
            armed: true,
        };

        self.transport.send(&request).await?;
        let response = self.transport.poll_or_block_for(&request.id, timeout).await;
        if let Ok(Some(_)) = response {
            guard.armed = false;
        }
        response
    }

    /// Run `command` in the guest.
    ///
    /// A missing response within `timeout` yields a result with
    /// `timed_out = true`. The command may keep running in the guest: the
    /// agent enforces the same timeout on its side, but only best-effort.
    pub async fn execute(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let body = RequestBody::Execute {
            command: command.to_string(),
            env: env.clone(),
            timeout_secs: timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0),
        };

        match self.request(body, timeout).await? {
            Some(ResponseBody::Execute {
                exit_code,
                stdout,
                stderr,
            }) => Ok(ExecutionResult::completed(
                exit_code,
                stdout,
                stderr,
                started.elapsed(),
            )),
            Some(ResponseBody::Error { message }) => {
                Err(WsbError::Channel(format!("Agent error: {}", message)))
            }
            Some(other) => Err(WsbError::Channel(format!(
                "Unexpected response to execute: {:?}",
                other
            ))),
            None => Ok(ExecutionResult::timed_out(started.elapsed())),
        }
    }

    /// True if the agent answered within `timeout`.
    pub async fn ping(&self, timeout: Duration) -> Result<bool> {
        match self.request(RequestBody::Ping, timeout).await? {
            Some(ResponseBody::Pong) => Ok(true),
            Some(other) => Err(WsbError::Channel(format!(
                "Unexpected response to ping: {:?}",
                other
            ))),
            None => Ok(false),
        }
    }

    /// Ask the agent to power the guest off. True if it acknowledged.
    pub async fn request_shutdown(&self, timeout: Duration) -> Result<bool> {
        match self.request(RequestBody::Shutdown, timeout).await? {
            Some(ResponseBody::ShutdownAck) => Ok(true),
            Some(ResponseBody::Error { message }) => {
                Err(WsbError::Channel(format!("Agent refused shutdown: {}", message)))
            }
            Some(_) | None => Ok(false),
        }
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::serve_channel_dir;

    async fn open_shared(dir: &Path) -> ExecutionChannel {
        let config = ChannelConfig {
            poll_interval_ms: 10,
            ..Default::default()
        };
        ExecutionChannel::open(&config, dir).await.unwrap()
    }

    #[tokio::test]
    async fn test_execute_through_fake_agent() {
        let dir = tempfile::tempdir().unwrap();
        let channel = open_shared(dir.path()).await;
        let agent = serve_channel_dir(dir.path().to_path_buf(), true);

        assert!(channel.ping(Duration::from_secs(2)).await.unwrap());

        let result = channel
            .execute("echo hi", &HashMap::new(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hi"));

        let result = channel
            .execute("exit 3", &HashMap::new(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);

        channel.close().await;
        agent.abort();
    }

    #[tokio::test]
    async fn test_execute_timeout_returns_indicator() {
        let dir = tempfile::tempdir().unwrap();
        let channel = open_shared(dir.path()).await;
        let agent = serve_channel_dir(dir.path().to_path_buf(), true);

        let timeout = Duration::from_millis(200);
        let started = Instant::now();
        let result = channel
            .execute("sleep 60", &HashMap::new(), timeout)
            .await
            .unwrap();

        assert!(result.timed_out);
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(started.elapsed() < timeout + Duration::from_secs(1));

        channel.close().await;
        agent.abort();
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let dir = tempfile::tempdir().unwrap();
        let channel = open_shared(dir.path()).await;
        let agent = serve_channel_dir(dir.path().to_path_buf(), true);

        let env = HashMap::new();
        let (a, b, c) = tokio::join!(
            channel.execute("echo one", &env, Duration::from_secs(2)),
            channel.execute("echo two", &env, Duration::from_secs(2)),
            channel.execute("exit 7", &env, Duration::from_secs(2)),
        );
        assert_eq!(a.unwrap().stdout.trim(), "one");
        assert_eq!(b.unwrap().stdout.trim(), "two");
        assert_eq!(c.unwrap().exit_code, 7);

        channel.close().await;
        agent.abort();
    }

    #[tokio::test]
    async fn test_ping_without_agent_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let channel = open_shared(dir.path()).await;

        assert!(!channel.ping(Duration::from_millis(50)).await.unwrap());
        // The abandoned request must not linger for a late agent to pick up.
        let leftovers = std::fs::read_dir(dir.path().join(REQUESTS_DIR))
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);

        channel.close().await;
    }
}
