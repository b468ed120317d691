// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP server lifecycle: spawn configured servers, run the initialize
//! handshake, surface their tools in the shared registry, refresh tool
//! lists periodically, and restart crashed servers within bounds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use alex_config::{McpServerConfig, McpSpawnKind};
use alex_tools::SharedToolRegistry;

use crate::adapter::{qualified_name, McpToolAdapter};
use crate::jsonrpc::{JsonRpcNotification, JsonRpcRequest, MCP_PROTOCOL_VERSION};
use crate::sse::{SseConfig, SseTransport};
use crate::stdio::{StdioConfig, StdioTransport};
use crate::transport::McpTransport;

const MAX_RESTART_ATTEMPTS: u32 = 5;
const RESTART_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A tool as reported by `tools/list`.
#[derive(Debug, Clone)]
pub struct RemoteTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Owns the configured MCP servers and their registry entries.
pub struct McpManager {
    configs: Vec<McpServerConfig>,
    registry: SharedToolRegistry,
    live: Arc<tokio::sync::Mutex<HashMap<String, Arc<dyn McpTransport>>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl McpManager {
    pub fn new(configs: Vec<McpServerConfig>, registry: SharedToolRegistry) -> Self {
        Self {
            configs,
            registry,
            live: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Start every enabled autostart server and expose its tools.
    ///
    /// A server that fails to start is logged and skipped — one broken
    /// provider must not take the agent down.
    pub async fn start(&self) {
        for cfg in self.configs.clone() {
            if !cfg.enabled || !cfg.autostart {
                continue;
            }
            match start_server(&cfg, &self.registry).await {
                Ok(transport) => {
                    info!(server = %cfg.id, "mcp server started");
                    self.live.lock().await.insert(cfg.id.clone(), Arc::clone(&transport));
                    self.spawn_refresh_task(cfg.clone(), Arc::clone(&transport));
                    if cfg.autorestart {
                        self.spawn_restart_monitor(cfg.clone());
                    }
                }
                Err(e) => {
                    warn!(server = %cfg.id, error = %e, "mcp server failed to start");
                }
            }
        }
    }

    /// Disconnect every live server and drop their registry entries.
    pub async fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let mut live = self.live.lock().await;
        for (id, transport) in live.drain() {
            let _ = transport.disconnect().await;
            remove_server_tools(&self.registry, &id).await;
            debug!(server = %id, "mcp server stopped");
        }
    }

    /// Ids of servers currently connected.
    pub async fn live_servers(&self) -> Vec<String> {
        let live = self.live.lock().await;
        let mut ids: Vec<String> = live
            .iter()
            .filter(|(_, t)| t.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn spawn_refresh_task(&self, cfg: McpServerConfig, transport: Arc<dyn McpTransport>) {
        let registry = Arc::clone(&self.registry);
        let interval = Duration::from_secs(cfg.refresh_interval_secs.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if !transport.is_connected() {
                    continue;
                }
                match list_tools(transport.as_ref()).await {
                    Ok(tools) => {
                        register_tools(&registry, &cfg.id, &tools, Arc::clone(&transport)).await;
                        debug!(server = %cfg.id, count = tools.len(), "mcp tool list refreshed");
                    }
                    Err(e) => {
                        warn!(server = %cfg.id, error = %e, "mcp tool refresh failed");
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    fn spawn_restart_monitor(&self, cfg: McpServerConfig) {
        let registry = Arc::clone(&self.registry);
        let live = Arc::clone(&self.live);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(MONITOR_POLL_INTERVAL).await;
                let connected = {
                    let map = live.lock().await;
                    map.get(&cfg.id).map(|t| t.is_connected()).unwrap_or(false)
                };
                if connected {
                    continue;
                }

                warn!(server = %cfg.id, "mcp server down; attempting restart");
                let mut backoff = RESTART_INITIAL_BACKOFF;
                let mut restarted = false;
                for attempt in 1..=MAX_RESTART_ATTEMPTS {
                    match start_server(&cfg, &registry).await {
                        Ok(transport) => {
                            live.lock().await.insert(cfg.id.clone(), transport);
                            info!(server = %cfg.id, attempt, "mcp server restarted");
                            restarted = true;
                            break;
                        }
                        Err(e) => {
                            warn!(server = %cfg.id, attempt, error = %e, "restart failed");
                            tokio::time::sleep(backoff).await;
                            backoff = backoff.saturating_mul(2);
                        }
                    }
                }
                if !restarted {
                    warn!(server = %cfg.id, "giving up on restarts; removing tools");
                    live.lock().await.remove(&cfg.id);
                    remove_server_tools(&registry, &cfg.id).await;
                    return;
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }
}

/// Build the transport for a descriptor.  Spawn kinds reduce to argv
/// prefixes over the stdio transport; `sse` connects out instead.
pub fn build_transport(cfg: &McpServerConfig) -> anyhow::Result<Arc<dyn McpTransport>> {
    let timeout = Duration::from_secs(cfg.timeout_secs.max(1));
    match cfg.kind {
        McpSpawnKind::Sse => {
            let url = cfg
                .url
                .clone()
                .with_context(|| format!("mcp server {} has kind=sse but no url", cfg.id))?;
            let mut sse = SseConfig::new(url);
            sse.request_timeout = timeout;
            Ok(Arc::new(SseTransport::new(sse)))
        }
        kind => {
            let (command, args) = match kind {
                McpSpawnKind::Npx => {
                    let mut args = vec!["-y".to_string(), cfg.command.clone()];
                    args.extend(cfg.args.clone());
                    ("npx".to_string(), args)
                }
                McpSpawnKind::Docker => {
                    let mut args =
                        vec!["run".to_string(), "-i".to_string(), "--rm".to_string(), cfg.command.clone()];
                    args.extend(cfg.args.clone());
                    ("docker".to_string(), args)
                }
                _ => (cfg.command.clone(), cfg.args.clone()),
            };
            let mut stdio = StdioConfig::new(command, args);
            stdio.env = cfg.env.clone();
            stdio.work_dir = cfg.work_dir.clone().map(Into::into);
            stdio.request_timeout = timeout;
            Ok(Arc::new(StdioTransport::new(stdio)))
        }
    }
}

/// Connect, handshake, list tools, and register them.  Returns the live
/// transport on success.
async fn start_server(
    cfg: &McpServerConfig,
    registry: &SharedToolRegistry,
) -> anyhow::Result<Arc<dyn McpTransport>> {
    let transport = build_transport(cfg)?;
    transport
        .connect()
        .await
        .with_context(|| format!("connecting mcp server {}", cfg.id))?;
    initialize(transport.as_ref())
        .await
        .with_context(|| format!("initializing mcp server {}", cfg.id))?;
    let tools = list_tools(transport.as_ref())
        .await
        .with_context(|| format!("listing tools of mcp server {}", cfg.id))?;
    register_tools(registry, &cfg.id, &tools, Arc::clone(&transport)).await;
    Ok(transport)
}

/// MCP handshake: `initialize` request then `notifications/initialized`.
async fn initialize(transport: &dyn McpTransport) -> anyhow::Result<()> {
    let request = JsonRpcRequest::new(
        transport.next_request_id(),
        "initialize",
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": "alex",
                "version": env!("CARGO_PKG_VERSION"),
            }
        }),
    );
    let response = transport.send_request(request).await?;
    response.into_result()?;
    transport
        .send_notification(JsonRpcNotification::new("notifications/initialized", json!({})))
        .await?;
    Ok(())
}

async fn list_tools(transport: &dyn McpTransport) -> anyhow::Result<Vec<RemoteTool>> {
    let request = JsonRpcRequest::new(transport.next_request_id(), "tools/list", json!({}));
    let response = transport.send_request(request).await?;
    let result = response.into_result()?;
    Ok(parse_tools_list(&result))
}

/// Parse a `tools/list` result.  Entries without a name are skipped.
fn parse_tools_list(result: &Value) -> Vec<RemoteTool> {
    let Some(items) = result["tools"].as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = item["name"].as_str()?.to_string();
            Some(RemoteTool {
                name,
                description: item["description"].as_str().unwrap_or("").to_string(),
                input_schema: item
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({ "type": "object" })),
            })
        })
        .collect()
}

/// Replace this server's registry entries with the given tool set.
async fn register_tools(
    registry: &SharedToolRegistry,
    server_id: &str,
    tools: &[RemoteTool],
    transport: Arc<dyn McpTransport>,
) {
    let mut reg = registry.write().await;
    let prefix = qualified_name(server_id, "");
    let stale: Vec<String> = reg
        .names()
        .into_iter()
        .filter(|n| n.starts_with(&prefix))
        .collect();
    for name in stale {
        reg.remove(&name);
    }
    for def in tools {
        reg.register_arc(Arc::new(McpToolAdapter::new(
            server_id,
            def,
            Arc::clone(&transport),
        )));
    }
}

async fn remove_server_tools(registry: &SharedToolRegistry, server_id: &str) {
    let mut reg = registry.write().await;
    let prefix = qualified_name(server_id, "");
    let stale: Vec<String> = reg
        .names()
        .into_iter()
        .filter(|n| n.starts_with(&prefix))
        .collect();
    for name in stale {
        reg.remove(&name);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
