// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Integration tests against a real child process: a minimal MCP server
//! written in shell that answers initialize / tools/list / tools/call by
//! echoing the request id back.  Exercises spawning, newline framing, and
//! request/response correlation end to end.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use alex_config::{McpServerConfig, McpSpawnKind};
use alex_mcp::{JsonRpcNotification, JsonRpcRequest, McpManager, McpTransport, StdioConfig, StdioTransport};
use alex_tools::{shared_registry, ExecutionContext, Tool, ToolCall, ToolRegistry};

/// Line-oriented JSON-RPC responder.  Replies carry the caller's id, and
/// tools/call answers embed it in the text so misrouting is detectable.
const SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}}}}\n' "$id";;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echoes input","inputSchema":{"type":"object"}}]}}\n' "$id";;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong-%s"}]}}\n' "$id" "$id";;
  esac
done
"#;

fn server_transport() -> StdioTransport {
    let mut cfg = StdioConfig::new("sh", vec!["-c".to_string(), SERVER_SCRIPT.to_string()]);
    cfg.request_timeout = Duration::from_secs(5);
    StdioTransport::new(cfg)
}

#[tokio::test]
async fn initialize_handshake_round_trips() {
    let t = server_transport();
    t.connect().await.unwrap();

    let id = t.next_request_id();
    let resp = t
        .send_request(JsonRpcRequest::new(
            id,
            "initialize",
            json!({ "protocolVersion": "2024-11-05", "capabilities": {} }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.id_i64(), Some(id));
    let result = resp.into_result().unwrap();
    assert_eq!(result["protocolVersion"], "2024-11-05");

    t.send_notification(JsonRpcNotification::new(
        "notifications/initialized",
        json!({}),
    ))
    .await
    .unwrap();

    t.disconnect().await.unwrap();
}

#[tokio::test]
async fn tools_list_parses_remote_tools() {
    let t = server_transport();
    t.connect().await.unwrap();

    let id = t.next_request_id();
    let resp = t
        .send_request(JsonRpcRequest::new(id, "tools/list", json!({})))
        .await
        .unwrap();
    let result = resp.into_result().unwrap();
    let tools = result["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "echo");

    t.disconnect().await.unwrap();
}

#[tokio::test]
async fn concurrent_requests_are_correlated_exactly() {
    let t = Arc::new(server_transport());
    t.connect().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let t = Arc::clone(&t);
        let id = t.next_request_id();
        handles.push(tokio::spawn(async move {
            let resp = t
                .send_request(JsonRpcRequest::new(
                    id,
                    "tools/call",
                    json!({ "name": "echo", "arguments": {} }),
                ))
                .await
                .unwrap();
            (id, resp)
        }));
    }

    for handle in handles {
        let (id, resp) = handle.await.unwrap();
        assert_eq!(resp.id_i64(), Some(id), "response routed to wrong waiter");
        let result = resp.into_result().unwrap();
        assert_eq!(
            result["content"][0]["text"],
            format!("pong-{id}"),
            "payload must match the request that asked for it"
        );
    }

    t.disconnect().await.unwrap();
}

#[tokio::test]
async fn manager_exposes_remote_tools_in_registry() {
    let registry = shared_registry(ToolRegistry::new());
    let server = McpServerConfig {
        id: "test".into(),
        name: "shell test server".into(),
        kind: McpSpawnKind::Executable,
        command: "sh".into(),
        args: vec!["-c".into(), SERVER_SCRIPT.into()],
        env: HashMap::new(),
        work_dir: None,
        url: None,
        autostart: true,
        autorestart: false,
        timeout_secs: 5,
        refresh_interval_secs: 300,
        enabled: true,
    };

    let manager = McpManager::new(vec![server], Arc::clone(&registry));
    manager.start().await;

    assert_eq!(manager.live_servers().await, vec!["test"]);
    assert_eq!(registry.read().await.names(), vec!["mcp_test_echo"]);

    // Call the remote tool through the normal registry path.
    let tool = registry.read().await.get("mcp_test_echo").unwrap();
    let ctx = ExecutionContext::new("/tmp", "s1");
    let out = tool
        .execute(&ctx, &ToolCall::new("c1", "mcp_test_echo", json!({"text": "hi"})))
        .await
        .unwrap();
    assert!(out.content.starts_with("pong-"), "got: {}", out.content);

    manager.stop().await;
    assert!(registry.read().await.is_empty(), "stop removes remote tools");
}

#[tokio::test]
async fn disabled_server_is_not_started() {
    let registry = shared_registry(ToolRegistry::new());
    let server = McpServerConfig {
        id: "off".into(),
        name: String::new(),
        kind: McpSpawnKind::Executable,
        command: "sh".into(),
        args: vec!["-c".into(), SERVER_SCRIPT.into()],
        env: HashMap::new(),
        work_dir: None,
        url: None,
        autostart: true,
        autorestart: false,
        timeout_secs: 5,
        refresh_interval_secs: 300,
        enabled: false,
    };
    let manager = McpManager::new(vec![server], Arc::clone(&registry));
    manager.start().await;
    assert!(manager.live_servers().await.is_empty());
    assert!(registry.read().await.is_empty());
}
