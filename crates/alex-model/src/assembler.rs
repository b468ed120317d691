// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming response assembly: collect a finite stream of [`StreamDelta`]s
//! into one response equivalent to what a non-streaming call would have
//! returned.  Every delta is forwarded to the caller's callback *before*
//! being folded into the accumulated state, so UI streaming and assembly
//! happen in lockstep on the caller's task.

use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::warn;

use crate::{ChatMessage, CompletionResponse, DeltaStream, StreamDelta, ToolCallData, Usage};

/// Error returned when the caller's cancel signal fires mid-stream.
///
/// Surfaced unchanged by the retry layer — cancellation is never retried.
#[derive(Debug, thiserror::Error)]
#[error("llm call cancelled")]
pub struct Cancelled;

/// A tool call under construction.  Fragments append to the arguments
/// buffer until the next fragment opens a new call.
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Seal the call, synthesizing an id when the provider never sent one.
    /// Returns `None` when the name is empty: a call that cannot be
    /// dispatched must not enter the conversation history.
    fn finish(self, index: usize) -> Option<ToolCallData> {
        if self.name.is_empty() {
            warn!(
                tool_call_id = %self.id,
                "dropping tool call with empty name from model; cannot dispatch"
            );
            return None;
        }
        let id = if self.id.is_empty() {
            format!("tool_call_{index}")
        } else {
            self.id
        };
        Some(ToolCallData::function(id, self.name, self.args_buf))
    }
}

/// Collect `stream` into a single [`CompletionResponse`].
///
/// `on_delta` is invoked inline for every observed delta; callers must not
/// block in it.  When `cancel` is supplied and resolves (or its sender is
/// dropped), assembly aborts promptly with [`Cancelled`] and any open
/// tool-call fragment is discarded.
pub async fn assemble_stream(
    mut stream: DeltaStream,
    mut on_delta: Option<&mut (dyn FnMut(&StreamDelta) + Send)>,
    mut cancel: Option<&mut oneshot::Receiver<()>>,
) -> anyhow::Result<CompletionResponse> {
    let mut content = String::new();
    let mut pending: Vec<PendingToolCall> = Vec::new();
    let mut finish_reason: Option<String> = None;
    let mut usage: Option<Usage> = None;

    loop {
        let event = match cancel.as_mut() {
            Some(c) => tokio::select! {
                biased;
                _ = &mut **c => return Err(Cancelled.into()),
                ev = stream.next() => ev,
            },
            None => stream.next().await,
        };
        let Some(event) = event else { break };
        let delta = event?;

        if let Some(cb) = on_delta.as_mut() {
            cb(&delta);
        }

        match delta {
            StreamDelta::Text(t) => content.push_str(&t),
            StreamDelta::ToolCall { id, name, arguments } => {
                // A fragment carrying an id or a name opens a new call;
                // otherwise it extends the arguments of the call in progress.
                let starts_new = !id.is_empty() || !name.is_empty() || pending.is_empty();
                if starts_new {
                    pending.push(PendingToolCall {
                        id,
                        name,
                        args_buf: arguments,
                    });
                } else if let Some(current) = pending.last_mut() {
                    current.args_buf.push_str(&arguments);
                }
            }
            StreamDelta::FinishReason(r) => finish_reason = Some(r),
            StreamDelta::Usage(u) => usage = Some(u),
            StreamDelta::Done => break,
            // Reasoning channels are forwarded (above) but not part of the
            // assembled message.
            StreamDelta::Reasoning(_)
            | StreamDelta::ReasoningSummary(_)
            | StreamDelta::Think(_) => {}
        }
    }

    let tool_calls: Vec<ToolCallData> = pending
        .into_iter()
        .enumerate()
        .filter_map(|(i, p)| p.finish(i))
        .collect();

    let finish_reason = finish_reason.or_else(|| {
        Some(if tool_calls.is_empty() { "stop" } else { "tool_calls" }.to_string())
    });

    Ok(CompletionResponse {
        message: ChatMessage::assistant_with_tool_calls(content, tool_calls),
        finish_reason,
        usage,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
