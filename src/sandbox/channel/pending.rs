use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use super::protocol::{AgentResponse, ResponseBody};
use crate::error::{Result, WsbError};

/// Correlation table shared by a transport and its response reader.
///
/// A request is registered before it is sent; the reader resolves it when the
/// matching response arrives. Responses for unknown or already-resolved ids
/// are dropped.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    senders: Mutex<HashMap<String, oneshot::Sender<ResponseBody>>>,
    receivers: Mutex<HashMap<String, oneshot::Receiver<ResponseBody>>>,
}

impl PendingTable {
    pub fn register(&self, id: &str) {
        let (tx, rx) = oneshot::channel();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), tx);
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), rx);
    }

    /// Deliver a response. Returns false if nobody was waiting for it.
    pub fn resolve(&self, response: AgentResponse) -> bool {
        let sender = self
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&response.id);

        match sender {
            Some(tx) => tx.send(response.body).is_ok(),
            None => {
                debug!(id = %response.id, "Discarding response for unknown request");
                false
            }
        }
    }

    /// Wait up to `timeout` for the response to `id`. `Ok(None)` means the
    /// timeout elapsed; the id is forgotten either way.
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<Option<ResponseBody>> {
        let rx = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| WsbError::Channel(format!("No pending request with id {}", id)))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => Ok(Some(body)),
            Ok(Err(_)) => Err(WsbError::Channel("Channel closed".to_string())),
            Err(_) => {
                self.forget(id);
                Ok(None)
            }
        }
    }

    pub fn forget(&self, id: &str) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Drop every waiter; pending `wait` calls fail with a channel error.
    pub fn close(&self) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
