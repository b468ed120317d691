// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Serial tool execution.
//!
//! Tool calls from one model turn run strictly one after another, in the
//! order the parser produced them: tools touch the filesystem and may
//! depend on each other's effects within a turn, so determinism beats the
//! modest latency win of running them concurrently.
//!
//! The executor guarantees exactly one [`ToolResult`] per submitted call,
//! in input order, with `call_id` and `tool_name` populated even when the
//! tool is unknown, fails validation, errors, or the run is cancelled.

use std::time::Instant;

use tracing::{debug, warn};

use crate::{
    display::{format_tool_call, truncate_chars},
    ExecutionContext, ToolCall, ToolRegistry, ToolResult,
};

/// Characters of an argument value shown in a `tool_start` rendering.
const ARG_PREVIEW_CHARS: usize = 80;
/// Characters of a result shown in a `tool_result` preview.
const RESULT_PREVIEW_CHARS: usize = 200;

/// Progress events surfaced while the executor works through a batch.
#[derive(Debug, Clone)]
pub enum ExecEvent {
    Started {
        call_id: String,
        tool_name: String,
        /// Human-formatted rendering, e.g. `file_read(path=/tmp/x)`.
        rendered: String,
    },
    Finished {
        call_id: String,
        tool_name: String,
        /// Result content truncated for display (character-safe).
        preview: String,
        success: bool,
        duration_ms: u128,
    },
}

/// Execute `calls` one by one against `registry`.
///
/// Returns exactly `calls.len()` results in input order.  The event
/// callback runs inline between steps; callers must not block in it.
pub async fn execute_serial(
    registry: &ToolRegistry,
    ctx: &ExecutionContext,
    calls: &[ToolCall],
    mut on_event: Option<&mut (dyn FnMut(ExecEvent) + Send)>,
) -> Vec<ToolResult> {
    let mut results = Vec::with_capacity(calls.len());

    for call in calls {
        if let Some(cb) = on_event.as_mut() {
            cb(ExecEvent::Started {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                rendered: format_tool_call(&call.name, &call.args, ARG_PREVIEW_CHARS),
            });
        }

        let started = Instant::now();
        let result = execute_one(registry, ctx, call, started).await;

        debug!(
            tool_name = %result.tool_name,
            call_id = %result.call_id,
            success = result.success,
            duration_ms = result.duration.as_millis() as u64,
            "tool call finished"
        );
        if let Some(cb) = on_event.as_mut() {
            cb(ExecEvent::Finished {
                call_id: result.call_id.clone(),
                tool_name: result.tool_name.clone(),
                preview: truncate_chars(&result.content, RESULT_PREVIEW_CHARS),
                success: result.success,
                duration_ms: result.duration.as_millis(),
            });
        }
        results.push(result);
    }

    results
}

async fn execute_one(
    registry: &ToolRegistry,
    ctx: &ExecutionContext,
    call: &ToolCall,
    started: Instant,
) -> ToolResult {
    if ctx.cancel.is_cancelled() {
        return ToolResult::err(call, "tool execution cancelled", started.elapsed());
    }

    let Some(tool) = registry.get(&call.name) else {
        warn!(tool_name = %call.name, call_id = %call.id, "tool not found");
        return ToolResult::err(call, format!("tool not found: {}", call.name), started.elapsed());
    };

    if let Err(e) = tool.validate(&call.args) {
        return ToolResult::err(call, format!("invalid arguments: {e}"), started.elapsed());
    }

    match tool.execute(ctx, call).await {
        Ok(output) => {
            // A tool that produced neither text nor data yielded nothing the
            // model can observe; surface that instead of an empty message.
            if output.content.is_empty() && output.data.is_none() {
                return ToolResult::err(
                    call,
                    format!("tool {} returned no result", call.name),
                    started.elapsed(),
                );
            }
            ToolResult::ok(call, output, started.elapsed())
        }
        Err(e) => ToolResult::err(call, e.to_string(), started.elapsed()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
