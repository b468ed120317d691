// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Stable identifier; synthesized by the parser when the model omits it.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments (always an object, possibly empty).
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self { id: id.into(), name: name.into(), args }
    }
}

/// What a tool produced on success.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Plain-text content fed back to the model.
    pub content: String,
    /// Optional structured payload for programmatic consumers.
    pub data: Option<Value>,
    /// Files this invocation touched (read or wrote).
    pub files: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), ..Default::default() }
    }

    pub fn with_data(content: impl Into<String>, data: Value) -> Self {
        Self { content: content.into(), data: Some(data), ..Default::default() }
    }
}

/// The executor's record of one tool invocation.
///
/// `call_id` and `tool_name` are always populated — including error paths —
/// so the conversation history can pair every result with its call.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub args: Value,
    pub success: bool,
    pub content: String,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, output: ToolOutput, duration: Duration) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.args.clone(),
            success: true,
            content: output.content,
            data: output.data,
            error: None,
            duration,
        }
    }

    pub fn err(call: &ToolCall, message: impl Into<String>, duration: Duration) -> Self {
        let message = message.into();
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.args.clone(),
            success: false,
            content: message.clone(),
            data: None,
            error: Some(message),
            duration,
        }
    }
}

/// Trait every tool — builtin or MCP-provided — implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;
    /// Cheap argument validation before execution.  Default: accept.
    fn validate(&self, _args: &Value) -> anyhow::Result<()> {
        Ok(())
    }
    /// Execute the call.  The context carries the working directory the tool
    /// should treat as "here", the session id, and the cancel flag.
    async fn execute(&self, ctx: &ExecutionContext, call: &ToolCall) -> anyhow::Result<ToolOutput>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
