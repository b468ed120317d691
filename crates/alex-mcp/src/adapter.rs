// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bridges remote MCP tools into the normal [`Tool`] registry so the agent
//! loop never distinguishes builtin from remote tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use alex_tools::{ExecutionContext, Tool, ToolCall, ToolOutput};

use crate::jsonrpc::JsonRpcRequest;
use crate::manager::RemoteTool;
use crate::transport::McpTransport;

/// Prefix a remote tool name with its server id to avoid collisions with
/// builtin tools and with other servers.
pub fn qualified_name(server_id: &str, tool_name: &str) -> String {
    format!("mcp_{server_id}_{tool_name}")
}

pub struct McpToolAdapter {
    qualified: String,
    remote_name: String,
    description: String,
    schema: Value,
    transport: Arc<dyn McpTransport>,
}

impl McpToolAdapter {
    pub fn new(server_id: &str, def: &RemoteTool, transport: Arc<dyn McpTransport>) -> Self {
        Self {
            qualified: qualified_name(server_id, &def.name),
            remote_name: def.name.clone(),
            description: def.description.clone(),
            schema: def.input_schema.clone(),
            transport,
        }
    }
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.qualified
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, _ctx: &ExecutionContext, call: &ToolCall) -> anyhow::Result<ToolOutput> {
        let request = JsonRpcRequest::new(
            self.transport.next_request_id(),
            "tools/call",
            json!({
                "name": self.remote_name,
                "arguments": call.args,
            }),
        );
        let response = self.transport.send_request(request).await?;
        let result = response.into_result()?;

        let text = render_call_content(&result);
        if result["isError"].as_bool().unwrap_or(false) {
            anyhow::bail!("{}", if text.is_empty() { "remote tool failed".to_string() } else { text });
        }
        Ok(ToolOutput::with_data(text, result))
    }
}

/// Flatten a `tools/call` result's content array into display text.
fn render_call_content(result: &Value) -> String {
    let Some(items) = result["content"].as_array() else {
        return String::new();
    };
    items
        .iter()
        .map(|item| match item["type"].as_str() {
            Some("text") => item["text"].as_str().unwrap_or("").to_string(),
            Some(other) => format!("[{other} content]"),
            None => String::new(),
        })
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_is_prefixed() {
        assert_eq!(qualified_name("fetch", "get_url"), "mcp_fetch_get_url");
    }

    #[test]
    fn render_joins_text_items() {
        let result = json!({
            "content": [
                { "type": "text", "text": "line one" },
                { "type": "text", "text": "line two" },
            ]
        });
        assert_eq!(render_call_content(&result), "line one\nline two");
    }

    #[test]
    fn render_marks_non_text_items() {
        let result = json!({
            "content": [
                { "type": "image", "data": "...", "mimeType": "image/png" },
            ]
        });
        assert_eq!(render_call_content(&result), "[image content]");
    }

    #[test]
    fn render_empty_for_missing_content() {
        assert_eq!(render_call_content(&json!({})), "");
    }
}
