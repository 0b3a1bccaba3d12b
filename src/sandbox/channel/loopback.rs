use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use super::pending::PendingTable;
use super::protocol::{AgentRequest, AgentResponse, ResponseBody};
use super::{GuestChannelSetup, Transport};
use crate::error::{Result, WsbError};

/// One TCP connection per request, carrying a single JSON line each way.
///
/// Requires guest networking. Each round trip runs as its own task so
/// concurrent requests never queue behind each other on the host side.
pub struct LoopbackTransport {
    address: SocketAddr,
    pending: Arc<PendingTable>,
    in_flight: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LoopbackTransport {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            pending: Arc::new(PendingTable::default()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn guest_setup(&self) -> GuestChannelSetup {
        GuestChannelSetup {
            folders: Vec::new(),
            agent_args: vec![
                "--listen".to_string(),
                format!("0.0.0.0:{}", self.address.port()),
            ],
        }
    }

    async fn send(&self, request: &AgentRequest) -> Result<()> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        self.pending.register(&request.id);
        let address = self.address;
        let pending = self.pending.clone();
        let id = request.id.clone();

        let task = tokio::spawn(async move {
            match round_trip(address, &line).await {
                Ok(response) => {
                    pending.resolve(response);
                }
                // Leave the waiter in place: the caller's timeout bounds it.
                Err(e) => debug!(id = %id, error = %e, "Loopback request failed"),
            }
        });

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|_, handle| !handle.is_finished());
        in_flight.insert(request.id.clone(), task);
        Ok(())
    }

    async fn poll_or_block_for(&self, id: &str, timeout: Duration) -> Result<Option<ResponseBody>> {
        self.pending.wait(id, timeout).await
    }

    fn cancel(&self, id: &str) {
        self.pending.forget(id);
        if let Some(task) = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
        {
            task.abort();
        }
    }

    async fn close(&self) {
        let tasks: Vec<_> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.pending.close();
    }
}

async fn round_trip(address: SocketAddr, line: &str) -> Result<AgentResponse> {
    let mut stream = TcpStream::connect(address)
        .await
        .map_err(|e| WsbError::Channel(format!("Connection to {} failed: {}", address, e)))?;

    stream
        .write_all(line.as_bytes())
        .await
        .map_err(|e| WsbError::Channel(format!("Write failed: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| WsbError::Channel(format!("Flush failed: {}", e)))?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .await
        .map_err(|e| WsbError::Channel(format!("Read failed: {}", e)))?;

    serde_json::from_str(&response_line)
        .map_err(|e| WsbError::Channel(format!("Failed to parse response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::channel::protocol::RequestBody;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_round_trip_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut line = String::new();
            BufReader::new(read).read_line(&mut line).await.unwrap();
            let request: AgentRequest = serde_json::from_str(&line).unwrap();
            let response = AgentResponse {
                id: request.id,
                body: ResponseBody::Pong,
            };
            let mut out = serde_json::to_string(&response).unwrap();
            out.push('\n');
            write.write_all(out.as_bytes()).await.unwrap();
        });

        let transport = LoopbackTransport::new(address);
        let request = AgentRequest::new(RequestBody::Ping);
        transport.send(&request).await.unwrap();

        let body = transport
            .poll_or_block_for(&request.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(body, Some(ResponseBody::Pong));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_agent_times_out() {
        // Bind then drop to get a port nobody listens on.
        let address = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let transport = LoopbackTransport::new(address);
        let request = AgentRequest::new(RequestBody::Ping);
        transport.send(&request).await.unwrap();

        let body = transport
            .poll_or_block_for(&request.id, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(body.is_none());
    }

    #[test]
    fn test_guest_setup_listens_on_configured_port() {
        let transport = LoopbackTransport::new("127.0.0.1:47800".parse().unwrap());
        let setup = transport.guest_setup();
        assert!(setup.folders.is_empty());
        assert_eq!(setup.agent_args, vec!["--listen", "0.0.0.0:47800"]);
    }
}
