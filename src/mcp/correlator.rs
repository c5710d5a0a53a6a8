//! Matches asynchronous JSON-RPC responses to the callers waiting on them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::debug;

use super::error::McpError;

type Settlement = Result<Value, McpError>;

struct PendingRequest {
    method: String,
    sender: oneshot::Sender<Settlement>,
    timer: AbortHandle,
}

/// Pending-request table for one connection.
///
/// Every entry is settled exactly once: by a response, a rejection, its
/// deadline, or cancellation. Whichever comes first removes the entry, so a
/// late response for a timed-out id is dropped.
#[derive(Clone, Default)]
pub struct RequestCorrelator {
    pending: Arc<Mutex<HashMap<u64, PendingRequest>>>,
}

/// Handle returned by [`RequestCorrelator::register`].
pub struct PendingResponse {
    id: u64,
    receiver: oneshot::Receiver<Settlement>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(self) -> Settlement {
        match self.receiver.await {
            Ok(settlement) => settlement,
            Err(_) => Err(McpError::Closed(format!(
                "request {} dropped before settlement",
                self.id
            ))),
        }
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pending request and arms its deadline.
    pub async fn register(&self, id: u64, method: &str, timeout: Duration) -> PendingResponse {
        let (sender, receiver) = oneshot::channel();
        // Hold the table while arming the timer so it cannot fire before the insert.
        let mut table = self.pending.lock().await;
        let pending = Arc::clone(&self.pending);
        let timer_method = method.to_string();
        let after_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let entry = pending.lock().await.remove(&id);
            if let Some(entry) = entry {
                debug!(id, method = %timer_method, after_ms, "MCP request timed out");
                let _ = entry.sender.send(Err(McpError::Timeout {
                    method: timer_method,
                    after_ms,
                }));
            }
        })
        .abort_handle();

        let previous = table.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                sender,
                timer,
            },
        );
        drop(table);
        if let Some(previous) = previous {
            previous.timer.abort();
            let _ = previous.sender.send(Err(McpError::Closed(format!(
                "request id {id} reused"
            ))));
        }

        PendingResponse { id, receiver }
    }

    /// Settles `id` with a result. Returns false when nothing was waiting.
    pub async fn resolve(&self, id: u64, value: Value) -> bool {
        self.settle(id, Ok(value)).await
    }

    pub async fn reject(&self, id: u64, error: McpError) -> bool {
        self.settle(id, Err(error)).await
    }

    /// Settles `id` as aborted by the caller.
    pub async fn cancel(&self, id: u64) -> bool {
        self.settle(id, Err(McpError::Aborted)).await
    }

    /// Fails every pending entry, used when the owning stream goes away.
    pub async fn reject_all(&self, error: McpError) -> usize {
        let drained: Vec<(u64, PendingRequest)> = self.pending.lock().await.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            entry.timer.abort();
            debug!(id, method = %entry.method, "Rejecting pending MCP request");
            let _ = entry.sender.send(Err(error.clone()));
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn settle(&self, id: u64, settlement: Settlement) -> bool {
        let entry = self.pending.lock().await.remove(&id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                let _ = entry.sender.send(settlement);
                true
            }
            None => {
                debug!(id, "Dropping response for unknown MCP request id");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_settles_exactly_once() {
        let correlator = RequestCorrelator::new();
        let pending = correlator
            .register(1, "tools/list", Duration::from_secs(5))
            .await;
        assert!(correlator.resolve(1, json!({"tools": []})).await);
        assert!(!correlator.resolve(1, json!({"tools": ["late"]})).await);
        assert!(!correlator.reject(1, McpError::Aborted).await);

        let value = pending.wait().await.expect("resolved value");
        assert_eq!(value, json!({"tools": []}));
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_dropped() {
        let correlator = RequestCorrelator::new();
        assert!(!correlator.resolve(42, json!(null)).await);
    }

    #[tokio::test]
    async fn deadline_wins_over_late_response() {
        let correlator = RequestCorrelator::new();
        let pending = correlator
            .register(7, "tools/call", Duration::from_millis(20))
            .await;
        let result = pending.wait().await;
        assert!(matches!(
            result,
            Err(McpError::Timeout { ref method, after_ms: 20 }) if method == "tools/call"
        ));
        assert!(!correlator.resolve(7, json!({})).await);
    }

    #[tokio::test]
    async fn response_before_deadline_disarms_timer() {
        let correlator = RequestCorrelator::new();
        let pending = correlator
            .register(3, "initialize", Duration::from_millis(30))
            .await;
        assert!(correlator.resolve(3, json!({"ok": true})).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pending.wait().await.expect("value"), json!({"ok": true}));
    }

    #[tokio::test]
    async fn reject_all_fails_every_entry() {
        let correlator = RequestCorrelator::new();
        let first = correlator.register(1, "a", Duration::from_secs(5)).await;
        let second = correlator.register(2, "b", Duration::from_secs(5)).await;

        let rejected = correlator
            .reject_all(McpError::Closed("stream ended".to_string()))
            .await;
        assert_eq!(rejected, 2);
        assert!(matches!(first.wait().await, Err(McpError::Closed(_))));
        assert!(matches!(second.wait().await, Err(McpError::Closed(_))));
    }

    #[tokio::test]
    async fn cancel_reports_abort() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.register(9, "x", Duration::from_secs(5)).await;
        assert_eq!(pending.id(), 9);
        assert!(correlator.cancel(9).await);
        assert!(matches!(pending.wait().await, Err(McpError::Aborted)));
    }
}
