// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Stdio MCP transport: a spawned child process speaking newline-delimited
//! JSON-RPC on stdout/stdin, with stderr forwarded as error events.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::jsonrpc::{classify_frame, Frame, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{Correlator, McpTransport, TransportError};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Bounded so a chatty server cannot balloon memory when nobody consumes
/// the message stream.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub work_dir: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl StdioConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            work_dir: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// MCP transport over a spawned child process.
pub struct StdioTransport {
    config: StdioConfig,
    connected: AtomicBool,
    next_id: AtomicI64,
    correlator: Arc<Correlator>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    msg_rx: StdMutex<Option<mpsc::Receiver<Vec<u8>>>>,
    err_rx: StdMutex<Option<mpsc::Receiver<String>>>,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(false),
            next_id: AtomicI64::new(1),
            correlator: Arc::new(Correlator::new()),
            stdin: Mutex::new(None),
            child: Mutex::new(None),
            tasks: StdMutex::new(Vec::new()),
            msg_rx: StdMutex::new(None),
            err_rx: StdMutex::new(None),
        }
    }

    async fn write_line(&self, payload: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::NotConnected)?;
        stdin.write_all(payload).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &self.config.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &self.config.work_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("child has no stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Protocol("child has no stderr".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Protocol("child has no stdin".into()))?;

        let (msg_tx, msg_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

        // Reader task: one JSON-RPC frame per stdout line.  Responses are
        // routed by id; everything else goes to the message stream.  Parse
        // failures are reported and skipped — they must never disturb the
        // correlation map.
        let correlator = Arc::clone(&self.correlator);
        let parse_err_tx = err_tx.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match classify_frame(trimmed.as_bytes()) {
                            Ok(Frame::Response(resp)) => {
                                correlator.resolve(resp);
                            }
                            Ok(Frame::Other(bytes)) => {
                                let _ = msg_tx.send(bytes).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "skipping unparseable frame from server");
                                let _ = parse_err_tx.send(format!("bad frame: {e}")).await;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("mcp server stdout closed");
                        break;
                    }
                    Err(e) => {
                        let _ = parse_err_tx.send(format!("stdout read error: {e}")).await;
                        break;
                    }
                }
            }
            // Child is gone: waiters would otherwise hang until timeout.
            correlator.clear();
        });

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = err_tx.send(line).await;
            }
        });

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        *self.msg_rx.lock().unwrap() = Some(msg_rx);
        *self.err_rx.lock().unwrap() = Some(err_rx);
        self.tasks.lock().unwrap().extend([reader, stderr_task]);
        self.connected.store(true, Ordering::SeqCst);
        debug!(command = %self.config.command, "mcp stdio transport connected");
        Ok(())
    }

    async fn send_request(
        &self,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let id = request.id;
        let rx = self.correlator.register(id);
        let payload =
            serde_json::to_vec(&request).map_err(|e| TransportError::Protocol(e.to_string()))?;
        if let Err(e) = self.write_line(&payload).await {
            self.correlator.forget(id);
            return Err(e);
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
        let payload = serde_json::to_vec(&notification)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.write_line(&payload).await
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
        *self.stdin.lock().await = None;
        if let Some(mut child) = self.child.lock().await.take() {
            // Kill and reap — the child is owned by this transport.
            let _ = child.kill().await;
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

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        // kill_on_drop on the Command reaps the child if still running.
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
