// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SSE MCP transport: a long-lived GET delivers server→client JSON-RPC
//! frames as `data:` events; a companion POST endpoint carries our
//! requests.  The server announces that endpoint (including any session id
//! parameter) in an `endpoint` event on first contact.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::jsonrpc::{classify_frame, Frame, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{Correlator, McpTransport, TransportError};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SseConfig {
    /// The SSE endpoint URL (the long-lived GET).
    pub url: String,
    /// Extra headers sent on every request (auth tokens etc.).
    pub headers: Vec<(String, String)>,
    pub request_timeout: Duration,
    /// How long to wait for the server's `endpoint` event on connect.
    pub connect_timeout: Duration,
}

impl SseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

pub struct SseTransport {
    config: SseConfig,
    connected: AtomicBool,
    next_id: AtomicI64,
    correlator: Arc<Correlator>,
    client: reqwest::Client,
    /// The POST endpoint announced by the server (absolute URL).
    endpoint: Arc<StdMutex<Option<String>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    msg_rx: StdMutex<Option<mpsc::Receiver<Vec<u8>>>>,
    err_rx: StdMutex<Option<mpsc::Receiver<String>>>,
}

impl SseTransport {
    pub fn new(config: SseConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(false),
            next_id: AtomicI64::new(1),
            correlator: Arc::new(Correlator::new()),
            client: reqwest::Client::new(),
            endpoint: Arc::new(StdMutex::new(None)),
            tasks: StdMutex::new(Vec::new()),
            msg_rx: StdMutex::new(None),
            err_rx: StdMutex::new(None),
        }
    }

    fn post_endpoint(&self) -> Result<String, TransportError> {
        self.endpoint
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| TransportError::Protocol("no messages endpoint negotiated".into()))
    }

    async fn post_json(&self, url: &str, payload: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        let mut req = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(payload.to_vec());
        for (k, v) in &self.config.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("POST {status}: {text}")));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if body.is_empty() {
            Ok(None)
        } else {
            Ok(Some(body.to_vec()))
        }
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        let (msg_tx, msg_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = watch::channel(false);

        let correlator = Arc::clone(&self.correlator);
        let endpoint = Arc::clone(&self.endpoint);
        let base_url = self.config.url.clone();
        let headers = self.config.headers.clone();
        let client = self.client.clone();

        let reader = tokio::spawn(async move {
            let mut req = client.get(&base_url).header("Accept", "text/event-stream");
            for (k, v) in &headers {
                req = req.header(k.as_str(), v.as_str());
            }
            let resp = match req.send().await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    let _ = err_tx.send(format!("sse connect failed: HTTP {}", r.status())).await;
                    return;
                }
                Err(e) => {
                    let _ = err_tx.send(format!("sse connect failed: {e}")).await;
                    return;
                }
            };

            let mut byte_stream = resp.bytes_stream();
            let mut buf = String::new();
            let mut event_name = String::new();
            let mut data = String::new();

            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = err_tx.send(format!("sse stream error: {e}")).await;
                        break;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(nl) = buf.find('\n') {
                    let line = buf[..nl].trim_end_matches('\r').to_string();
                    buf = buf[nl + 1..].to_string();

                    if line.is_empty() {
                        // Blank line terminates one SSE event.
                        if !data.is_empty() {
                            dispatch_event(
                                &event_name,
                                &data,
                                &base_url,
                                &correlator,
                                &endpoint,
                                &ready_tx,
                                &msg_tx,
                                &err_tx,
                            )
                            .await;
                        }
                        event_name.clear();
                        data.clear();
                    } else if let Some(rest) = line.strip_prefix("event:") {
                        event_name = rest.trim().to_string();
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        if !data.is_empty() {
                            data.push('\n');
                        }
                        data.push_str(rest.trim_start());
                    }
                    // Comment lines (":") and unknown fields are ignored.
                }
            }
            correlator.clear();
        });

        *self.msg_rx.lock().unwrap() = Some(msg_rx);
        *self.err_rx.lock().unwrap() = Some(err_rx);
        self.tasks.lock().unwrap().push(reader);

        // The server announces the POST endpoint in its first event; without
        // it there is nowhere to send requests.
        let mut ready = ready_rx;
        let announced = matches!(
            tokio::time::timeout(self.config.connect_timeout, ready.wait_for(|r| *r)).await,
            Ok(Ok(_))
        );
        if !announced {
            self.disconnect().await.ok();
            return Err(TransportError::Protocol(
                "server did not announce a messages endpoint".into(),
            ));
        }

        self.connected.store(true, Ordering::SeqCst);
        debug!(url = %self.config.url, "mcp sse transport connected");
        Ok(())
    }

    async fn send_request(
        &self,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let url = self.post_endpoint()?;
        let id = request.id;
        let rx = self.correlator.register(id);
        let payload =
            serde_json::to_vec(&request).map_err(|e| TransportError::Protocol(e.to_string()))?;

        match self.post_json(&url, &payload).await {
            Ok(Some(body)) => {
                // Some servers answer the POST directly instead of (or in
                // addition to) the SSE stream; route it the same way so the
                // waiter resolves exactly once.
                if let Ok(Frame::Response(resp)) = classify_frame(&body) {
                    self.correlator.resolve(resp);
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.correlator.forget(id);
                return Err(e);
            }
        }

        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(TransportError::Closed(id)),
            Err(_) => {
                self.correlator.forget(id);
                Err(TransportError::Timeout { id, timeout })
            }
        }
    }

    async fn send_notification(
        &self,
        notification: JsonRpcNotification,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let url = self.post_endpoint()?;
        let payload = serde_json::to_vec(&notification)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.post_json(&url, &payload).await.map(|_| ())
    }

    fn take_messages(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.msg_rx.lock().unwrap().take()
    }

    fn take_errors(&self) -> Option<mpsc::Receiver<String>> {
        self.err_rx.lock().unwrap().take()
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.correlator.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn next_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_event(
    event_name: &str,
    data: &str,
    base_url: &str,
    correlator: &Correlator,
    endpoint: &StdMutex<Option<String>>,
    ready_tx: &watch::Sender<bool>,
    msg_tx: &mpsc::Sender<Vec<u8>>,
    err_tx: &mpsc::Sender<String>,
) {
    if event_name == "endpoint" {
        let url = resolve_endpoint(base_url, data);
        debug!(endpoint = %url, "sse messages endpoint announced");
        *endpoint.lock().unwrap() = Some(url);
        let _ = ready_tx.send(true);
        return;
    }
    match classify_frame(data.as_bytes()) {
        Ok(Frame::Response(resp)) => {
            correlator.resolve(resp);
        }
        Ok(Frame::Other(bytes)) => {
            let _ = msg_tx.send(bytes).await;
        }
        Err(e) => {
            warn!(error = %e, "skipping unparseable sse frame");
            let _ = err_tx.send(format!("bad frame: {e}")).await;
        }
    }
}

/// Resolve the endpoint announced by the server against the SSE base URL.
///
/// Servers send either an absolute URL or an origin-relative path such as
/// `/messages?sessionId=abc123`.
fn resolve_endpoint(base_url: &str, data: &str) -> String {
    let data = data.trim();
    if data.starts_with("http://") || data.starts_with("https://") {
        return data.to_string();
    }
    let origin = match base_url.find("://") {
        Some(scheme_end) => match base_url[scheme_end + 3..].find('/') {
            Some(path_start) => &base_url[..scheme_end + 3 + path_start],
            None => base_url,
        },
        None => base_url,
    };
    if data.starts_with('/') {
        format!("{origin}{data}")
    } else {
        format!("{origin}/{data}")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn resolve_endpoint_absolute_passes_through() {
        assert_eq!(
            resolve_endpoint("https://a.example/sse", "https://b.example/messages"),
            "https://b.example/messages"
        );
    }

    #[test]
    fn resolve_endpoint_relative_path_uses_origin() {
        assert_eq!(
            resolve_endpoint(
                "https://tools.example.com:8443/v1/sse",
                "/messages?sessionId=abc123"
            ),
            "https://tools.example.com:8443/messages?sessionId=abc123"
        );
    }

    #[test]
    fn resolve_endpoint_bare_path_gets_slash() {
        assert_eq!(
            resolve_endpoint("http://localhost:3000/sse", "messages"),
            "http://localhost:3000/messages"
        );
    }

    #[test]
    fn request_ids_are_monotonic() {
        let t = SseTransport::new(SseConfig::new("http://localhost:1/sse"));
        assert!(t.next_request_id() < t.next_request_id());
    }

    #[tokio::test]
    async fn request_before_connect_fails_not_connected() {
        let t = SseTransport::new(SseConfig::new("http://localhost:1/sse"));
        let err = t
            .send_request(JsonRpcRequest::new(1, "tools/list", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn dispatch_routes_endpoint_event() {
        let correlator = Correlator::new();
        let endpoint = StdMutex::new(None);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (msg_tx, _msg_rx) = mpsc::channel(4);
        let (err_tx, _err_rx) = mpsc::channel(4);
        dispatch_event(
            "endpoint",
            "/messages?sessionId=s1",
            "https://h.example/sse",
            &correlator,
            &endpoint,
            &ready_tx,
            &msg_tx,
            &err_tx,
        )
        .await;
        assert_eq!(
            endpoint.lock().unwrap().as_deref(),
            Some("https://h.example/messages?sessionId=s1")
        );
        assert!(*ready_rx.borrow());
    }

    #[tokio::test]
    async fn dispatch_routes_response_to_correlator() {
        let correlator = Correlator::new();
        let rx = correlator.register(5);
        let endpoint = StdMutex::new(None);
        let (ready_tx, _ready_rx) = watch::channel(false);
        let (msg_tx, _msg_rx) = mpsc::channel(4);
        let (err_tx, _err_rx) = mpsc::channel(4);
        dispatch_event(
            "message",
            r#"{"jsonrpc":"2.0","id":5,"result":{"tools":[]}}"#,
            "https://h.example/sse",
            &correlator,
            &endpoint,
            &ready_tx,
            &msg_tx,
            &err_tx,
        )
        .await;
        let resp = rx.await.unwrap();
        assert_eq!(resp.id_i64(), Some(5));
    }

    #[tokio::test]
    async fn dispatch_forwards_notifications_and_reports_garbage() {
        let correlator = Correlator::new();
        let endpoint = StdMutex::new(None);
        let (ready_tx, _ready_rx) = watch::channel(false);
        let (msg_tx, mut msg_rx) = mpsc::channel(4);
        let (err_tx, mut err_rx) = mpsc::channel(4);

        dispatch_event(
            "message",
            r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#,
            "https://h.example/sse",
            &correlator,
            &endpoint,
            &ready_tx,
            &msg_tx,
            &err_tx,
        )
        .await;
        assert!(msg_rx.try_recv().is_ok(), "notification forwarded");

        dispatch_event(
            "message",
            "{broken",
            "https://h.example/sse",
            &correlator,
            &endpoint,
            &ready_tx,
            &msg_tx,
            &err_tx,
        )
        .await;
        assert!(err_rx.try_recv().is_ok(), "parse failure reported");
    }
}
