// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("request {id} timed out after {timeout:?}")]
    Timeout { id: i64, timeout: Duration },
    #[error("transport closed while awaiting response to request {0}")]
    Closed(i64),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },
}

/// Common contract for MCP client transports (stdio child process, SSE).
///
/// Request/response correlation is by integer id: callers obtain ids from
/// [`next_request_id`](McpTransport::next_request_id), which is monotonic for
/// the lifetime of the transport and never reused.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Send a request and wait for the matching response (bounded by the
    /// transport's request timeout).
    async fn send_request(&self, request: JsonRpcRequest)
        -> Result<JsonRpcResponse, TransportError>;

    /// Fire-and-forget: returns as soon as the notification is written.
    async fn send_notification(
        &self,
        notification: JsonRpcNotification,
    ) -> Result<(), TransportError>;

    /// Take the stream of non-response frames (server notifications and
    /// requests), raw.  Single consumer: subsequent calls return `None`.
    fn take_messages(&self) -> Option<mpsc::Receiver<Vec<u8>>>;

    /// Take the stream of transport-level errors (stderr lines, parse
    /// failures).  Single consumer.
    fn take_errors(&self) -> Option<mpsc::Receiver<String>>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Next request id.  Monotonic; wrap/reuse is disallowed.
    fn next_request_id(&self) -> i64;
}

/// Shared id → waiter map used by both transports.
///
/// Senders are single-shot and buffered (capacity 1 by construction of
/// `oneshot`), so resolving a response never blocks the reader task.
#[derive(Default)]
pub(crate) struct Correlator {
    pending: Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `id` and return the waiter half.
    pub fn register(&self, id: i64) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        rx
    }

    /// Route a response to its waiter.  Returns `false` when nobody is
    /// waiting (late response after a timeout, or a server bug).
    pub fn resolve(&self, resp: JsonRpcResponse) -> bool {
        let Some(id) = resp.id_i64() else {
            warn!("response with non-integer id dropped");
            return false;
        };
        let sender = self.pending.lock().unwrap().remove(&id);
        match sender {
            Some(tx) => tx.send(resp).is_ok(),
            None => {
                warn!(id, "response with no matching waiter");
                false
            }
        }
    }

    /// Forget a waiter (after a timeout) so a late response is dropped
    /// instead of resolving a stale receiver.
    pub fn forget(&self, id: i64) {
        self.pending.lock().unwrap().remove(&id);
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn clear(&self) {
        self.pending.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn response(id: i64, payload: serde_json::Value) -> JsonRpcResponse {
        serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": payload,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn resolve_routes_to_registered_waiter() {
        let c = Correlator::new();
        let rx = c.register(1);
        assert!(c.resolve(response(1, json!({"v": 1}))));
        let got = rx.await.unwrap();
        assert_eq!(got.result.unwrap()["v"], 1);
    }

    #[tokio::test]
    async fn interleaved_responses_reach_their_own_waiters() {
        // K concurrent requests with distinct ids; responses arrive in an
        // arbitrary interleaving.  Every waiter must receive exactly the
        // payload matching its id.
        let c = std::sync::Arc::new(Correlator::new());
        let k = 16;
        let mut waiters = Vec::new();
        for id in 0..k {
            waiters.push((id, c.register(id)));
        }
        // Scrambled but deterministic arrival order.
        let mut order: Vec<i64> = (0..k).collect();
        order.reverse();
        order.swap(0, 7);
        order.swap(3, 11);
        for id in order {
            assert!(c.resolve(response(id, json!({ "id": id }))));
        }
        for (id, rx) in waiters {
            let got = rx.await.unwrap();
            assert_eq!(got.result.unwrap()["id"], id, "response misrouted");
        }
        assert_eq!(c.pending_count(), 0, "no request may be lost");
    }

    #[tokio::test]
    async fn unmatched_response_is_dropped() {
        let c = Correlator::new();
        assert!(!c.resolve(response(99, json!({}))));
    }

    #[tokio::test]
    async fn forget_prevents_late_delivery() {
        let c = Correlator::new();
        let rx = c.register(5);
        c.forget(5);
        assert!(!c.resolve(response(5, json!({}))));
        assert!(rx.await.is_err(), "forgotten waiter sees a closed channel");
    }

    #[tokio::test]
    async fn clear_closes_all_waiters() {
        let c = Correlator::new();
        let rx1 = c.register(1);
        let rx2 = c.register(2);
        c.clear();
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
    }

    #[tokio::test]
    async fn non_integer_id_is_rejected() {
        let c = Correlator::new();
        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":{"odd":true},"result":{}}"#).unwrap();
        assert!(!c.resolve(resp));
    }
}
