// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-call extraction from an assistant wire message.
//!
//! Two shapes, tried in order: the structured `tool_calls` array, then a
//! text-embedded fallback for models that write their calls into the
//! content stream using DeepSeek-style markers.  Id synthesis happens here
//! and nowhere else — every call leaving the parser has a non-empty,
//! stable id, a non-empty name, and an argument object.

use serde_json::Value;
use tracing::warn;

use alex_model::ChatMessage;
use alex_tools::ToolCall;

pub const TOOL_CALLS_BEGIN: &str = "<｜tool▁calls▁begin｜>";
pub const TOOL_CALLS_END: &str = "<｜tool▁calls▁end｜>";
pub const TOOL_CALL_BEGIN: &str = "<｜tool▁call▁begin｜>";
pub const TOOL_CALL_END: &str = "<｜tool▁call▁end｜>";
pub const TOOL_SEP: &str = "<｜tool▁sep｜>";

/// Extract the ordered tool calls from an assistant message.
pub fn parse_tool_calls(message: &ChatMessage) -> Vec<ToolCall> {
    let structured = parse_structured(message);
    if !structured.is_empty() {
        return structured;
    }
    parse_text_embedded(&message.content)
}

fn parse_structured(message: &ChatMessage) -> Vec<ToolCall> {
    let mut calls = Vec::with_capacity(message.tool_calls.len());
    for (index, tc) in message.tool_calls.iter().enumerate() {
        if tc.function.name.is_empty() {
            warn!(index, "skipping tool call with empty name");
            continue;
        }
        let args = match decode_arguments(&tc.function.arguments) {
            Some(args) => args,
            None => {
                warn!(
                    index,
                    tool_name = %tc.function.name,
                    "skipping tool call with unparseable JSON arguments"
                );
                continue;
            }
        };
        let id = if tc.id.is_empty() {
            format!("tool_call_{index}")
        } else {
            tc.id.clone()
        };
        calls.push(ToolCall::new(id, tc.function.name.clone(), args));
    }
    calls
}

/// Decode a wire argument string into an object.  Empty input is an empty
/// object; anything that is valid JSON but not an object, or not JSON at
/// all, is a parse failure.
fn decode_arguments(raw: &str) -> Option<Value> {
    if raw.trim().is_empty() {
        return Some(Value::Object(Default::default()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

/// Fallback: scan content for a marker-delimited call block.
///
/// Expected fragment shape, one per call:
/// `function<｜tool▁sep｜>NAME\n```json\n{args}\n````
/// Missing or malformed JSON is tolerated as empty args.
fn parse_text_embedded(content: &str) -> Vec<ToolCall> {
    let Some(block_start) = content.find(TOOL_CALLS_BEGIN) else {
        return Vec::new();
    };
    let after = &content[block_start + TOOL_CALLS_BEGIN.len()..];
    let block = match after.find(TOOL_CALLS_END) {
        Some(end) => &after[..end],
        // Unterminated block (the model was cut off): parse what is there.
        None => after,
    };

    let base_nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();

    let mut calls = Vec::new();
    for fragment in block.split(TOOL_CALL_BEGIN).skip(1) {
        let fragment = fragment.split(TOOL_CALL_END).next().unwrap_or(fragment);
        let Some(call) = parse_fragment(fragment, base_nanos + calls.len() as i64) else {
            warn!("skipping malformed text-embedded tool call fragment");
            continue;
        };
        calls.push(call);
    }
    calls
}

fn parse_fragment(fragment: &str, nanos: i64) -> Option<ToolCall> {
    let rest = fragment.trim_start().strip_prefix("function")?;
    let rest = rest.strip_prefix(TOOL_SEP)?;
    let name = rest.lines().next()?.trim();
    if name.is_empty() {
        return None;
    }

    let args = fragment
        .find("```json")
        .and_then(|start| {
            let body = &fragment[start + "```json".len()..];
            let end = body.find("```")?;
            decode_arguments(body[..end].trim())
        })
        .unwrap_or_else(|| Value::Object(Default::default()));

    Some(ToolCall::new(format!("text_{nanos}"), name.to_string(), args))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
