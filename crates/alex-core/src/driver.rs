// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The bounded Think–Act–Observe loop.
//!
//! Each iteration sends the optimized history plus the tool catalog to the
//! model, parses the reply into tool calls, executes them serially, feeds
//! the results back, and repeats — until the model answers without tools,
//! a guard trips (iterations, timeout, token budget), or the caller
//! cancels.  The session log is append-only: compression only ever shapes
//! the working copy sent to the model.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use alex_config::{AgentConfig, ModelConfig};
use alex_model::{
    chat_stream_with_retry, default_sleep, is_gemini_family, Cancelled, CompletionRequest,
    LlmClient, RetryPolicy, SleepFn, StreamDelta, ToolChoice, ToolSchema,
};
use alex_tools::{
    display::format_tool_call, execute_serial, CancelFlag, ExecEvent, ExecutionContext,
    SharedToolRegistry, ToolCall, ToolResult,
};

use crate::context::ContextManager;
use crate::convert;
use crate::estimate::{estimate_text, estimate_wire_messages};
use crate::events::{ChunkCallback, ChunkType, StreamChunk, TokenTotals};
use crate::message::{Message, META_TOOL_SUCCESS};
use crate::parser::parse_tool_calls;
use crate::prompts;
use crate::session::Session;
use crate::store::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    ToolExecution,
    DirectAnswer,
}

/// Outcome of one tool call, as recorded on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    pub preview: String,
}

/// One iteration's record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub number: u32,
    pub timestamp: DateTime<Utc>,
    /// The assistant text that accompanied this step.
    pub thought: String,
    pub action: StepAction,
    /// Human renderings of the calls made, e.g. `file_read(path=/tmp/x)`.
    pub tool_calls: Vec<String>,
    pub tool_results: Vec<StepToolResult>,
    pub observation: String,
    pub duration_ms: u64,
    pub tokens_used: u64,
}

/// What a completed (or abandoned) task returns.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub success: bool,
    pub final_answer: String,
    pub confidence: f32,
    pub steps: Vec<ExecutionStep>,
    pub duration: Duration,
    pub tokens: TokenTotals,
}

/// Drives the loop for one task at a time.  Single-threaded per task: no
/// two iterations of the same task ever run concurrently.
pub struct IterationDriver {
    client: Arc<dyn LlmClient>,
    registry: SharedToolRegistry,
    context: Arc<ContextManager>,
    store: Option<Arc<dyn SessionStore>>,
    agent_cfg: AgentConfig,
    model_cfg: ModelConfig,
    sleep: SleepFn,
}

impl IterationDriver {
    pub fn new(
        client: Arc<dyn LlmClient>,
        registry: SharedToolRegistry,
        context: Arc<ContextManager>,
        store: Option<Arc<dyn SessionStore>>,
        agent_cfg: AgentConfig,
        model_cfg: ModelConfig,
    ) -> Self {
        Self {
            client,
            registry,
            context,
            store,
            agent_cfg,
            model_cfg,
            sleep: default_sleep(),
        }
    }

    /// Replace the backoff sleep (tests inject a no-op).
    pub fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.sleep = sleep;
        self
    }

    /// Run the loop over `session` for `goal`.
    ///
    /// The caller has already appended the user message to the session.
    /// Chunks stream through `on_chunk` inline; `cancel` aborts at the next
    /// suspension point.
    pub async fn solve_task(
        &self,
        session: &mut Session,
        goal: &str,
        on_chunk: Option<ChunkCallback<'_>>,
        mut cancel: Option<oneshot::Receiver<()>>,
    ) -> anyhow::Result<TaskResult> {
        let start = Instant::now();
        let task_id = Uuid::new_v4().to_string();
        let deadline = self
            .agent_cfg
            .timeout_secs
            .map(|s| start + Duration::from_secs(s));
        let cancel_flag = CancelFlag::new();
        let mut totals = TokenTotals::default();
        let mut steps: Vec<ExecutionStep> = Vec::new();
        let mut last_answer = String::new();

        emit(
            on_chunk,
            StreamChunk::new(ChunkType::Status, "Starting task")
                .with_meta("task_id", &task_id)
                .with_meta("session_id", &session.id),
        );

        let system = Message::system(prompts::system_prompt(goal, &session.working_dir));
        let gemini = is_gemini_family(self.client.base_url());
        let policy = RetryPolicy {
            max_attempts: self.agent_cfg.max_retries.max(1),
            ..Default::default()
        };

        // Working copy: optimized view of the session, with stale stored
        // system prompts dropped (ours is injected fresh) but compression
        // summaries kept.
        let (optimized, compressed) = self.context.optimize(&session.id, &session.messages).await;
        if compressed {
            emit_context_management(on_chunk, session.messages.len(), optimized.len());
        }
        let mut working: Vec<Message> = optimized
            .into_iter()
            .filter(|m| m.role != alex_model::Role::System || m.is_summary())
            .collect();

        let max_iterations = self.agent_cfg.max_iterations.max(1);
        for iteration in 1..=max_iterations {
            if is_cancelled(cancel.as_mut()) {
                cancel_flag.cancel();
                return cancelled_outcome(steps, last_answer, totals, start);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    emit(
                        on_chunk,
                        StreamChunk::new(ChunkType::Error, "task timeout exceeded")
                            .with_tokens(totals),
                    );
                    return Ok(partial_result(false, last_answer, steps, totals, start));
                }
            }
            if let Some(limit) = self.agent_cfg.cost_limit_tokens {
                if totals.total() >= limit {
                    emit(
                        on_chunk,
                        StreamChunk::new(ChunkType::Error, "token cost limit exceeded")
                            .with_tokens(totals),
                    );
                    return Ok(partial_result(false, last_answer, steps, totals, start));
                }
            }

            let iter_start = Instant::now();
            emit(
                on_chunk,
                StreamChunk::new(
                    ChunkType::Iteration,
                    format!("Iteration {iteration}/{max_iterations}"),
                )
                .with_meta("iteration", iteration.to_string()),
            );

            // Bounded every turn: compress the working copy once it outgrows
            // the budget.  The session log itself is never rewritten.
            if iteration > 1 && self.context.needs_compression(&working) {
                let before = working.len();
                let (opt, did) = self.context.optimize(&session.id, &working).await;
                if did {
                    working = opt;
                    emit_context_management(on_chunk, before, working.len());
                }
            }

            let mut wire = vec![convert::message_to_wire(0, &system)?];
            wire.extend(convert::to_wire(&working)?);
            let tools = self.tool_catalog().await;
            let request = CompletionRequest {
                model: self.model_cfg.name.clone(),
                messages: wire,
                tools,
                tool_choice: ToolChoice::Auto,
                temperature: self.model_cfg.temperature,
                max_tokens: self.model_cfg.max_tokens,
                stream: true,
            };
            let request_estimate = estimate_wire_messages(&request.messages);

            let mut delta_cb = |delta: &StreamDelta| forward_delta(on_chunk, delta);
            let response = chat_stream_with_retry(
                self.client.as_ref(),
                &request,
                &policy,
                &self.sleep,
                Some(&mut delta_cb),
                cancel.as_mut(),
            )
            .await;

            let response = match response {
                Ok(r) => r,
                Err(e) if e.downcast_ref::<Cancelled>().is_some() => {
                    cancel_flag.cancel();
                    return cancelled_outcome(steps, last_answer, totals, start);
                }
                Err(e) => {
                    emit(
                        on_chunk,
                        StreamChunk::new(ChunkType::Error, e.to_string()).with_tokens(totals),
                    );
                    return Err(e);
                }
            };

            let (prompt_tokens, completion_tokens) = match response.usage {
                Some(u) if !u.is_empty() => {
                    (u64::from(u.prompt_tokens), u64::from(u.completion_tokens))
                }
                _ => (
                    request_estimate as u64,
                    estimate_text(&response.message.content) as u64,
                ),
            };
            totals.add(prompt_tokens, completion_tokens);
            let iter_tokens = prompt_tokens + completion_tokens;
            emit(
                on_chunk,
                StreamChunk::new(ChunkType::TokenUsage, format!("{} tokens", totals.total()))
                    .with_tokens(totals),
            );

            if !response.message.content.is_empty() && response.message.has_tool_calls() {
                emit(
                    on_chunk,
                    StreamChunk::new(ChunkType::ThinkingResult, response.message.content.clone()),
                );
            }

            let assistant = convert::from_wire(&response.message);
            self.push_message(session, &mut working, assistant);

            let tool_calls = parse_tool_calls(&response.message);
            if tool_calls.is_empty() {
                last_answer = response.message.content.clone();
                emit(
                    on_chunk,
                    StreamChunk::new(ChunkType::FinalAnswer, last_answer.clone())
                        .with_tokens(totals),
                );
                steps.push(ExecutionStep {
                    number: iteration,
                    timestamp: Utc::now(),
                    thought: last_answer.clone(),
                    action: StepAction::DirectAnswer,
                    tool_calls: Vec::new(),
                    tool_results: Vec::new(),
                    observation: String::new(),
                    duration_ms: iter_start.elapsed().as_millis() as u64,
                    tokens_used: iter_tokens,
                });
                let confidence = confidence_for(iteration, true);
                debug!(task_id = %task_id, iteration, "task completed with direct answer");
                return Ok(TaskResult {
                    success: true,
                    final_answer: last_answer,
                    confidence,
                    steps,
                    duration: start.elapsed(),
                    tokens: totals,
                });
            }

            let exec_ctx =
                ExecutionContext::for_session(Some(session.working_dir.clone()), &session.id)
                    .with_cancel(cancel_flag.clone());
            let results = {
                let registry = self.registry.read().await;
                let mut exec_cb = |event: ExecEvent| forward_exec_event(on_chunk, event);
                execute_serial(&registry, &exec_ctx, &tool_calls, Some(&mut exec_cb)).await
            };

            let (tool_messages, missing) = build_tool_messages(&tool_calls, &results, gemini);
            for name in &missing {
                warn!(tool_name = %name, "no tool response generated; inserting fallback");
                emit(
                    on_chunk,
                    StreamChunk::new(
                        ChunkType::ToolError,
                        format!("Tool execution failed: no response generated for {name}"),
                    )
                    .with_meta("tool_name", name),
                );
            }
            for msg in tool_messages {
                self.push_message(session, &mut working, msg);
            }

            steps.push(ExecutionStep {
                number: iteration,
                timestamp: Utc::now(),
                thought: response.message.content.clone(),
                action: StepAction::ToolExecution,
                tool_calls: tool_calls
                    .iter()
                    .map(|c| format_tool_call(&c.name, &c.args, 60))
                    .collect(),
                tool_results: results
                    .iter()
                    .map(|r| StepToolResult {
                        call_id: r.call_id.clone(),
                        tool_name: r.tool_name.clone(),
                        success: r.success,
                        preview: alex_tools::display::truncate_chars(&r.content, 120),
                    })
                    .collect(),
                observation: summarize_results(&results),
                duration_ms: iter_start.elapsed().as_millis() as u64,
                tokens_used: iter_tokens,
            });
        }

        emit(
            on_chunk,
            StreamChunk::new(
                ChunkType::MaxIterations,
                format!("stopped after {max_iterations} iterations"),
            )
            .with_tokens(totals),
        );
        Ok(partial_result(false, last_answer, steps, totals, start))
    }

    async fn tool_catalog(&self) -> Vec<ToolSchema> {
        self.registry
            .read()
            .await
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect()
    }

    /// Append to the working copy, the session log, and the store.  Store
    /// failures are logged, not fatal: the in-memory conversation stays
    /// authoritative for the rest of the turn.
    fn push_message(&self, session: &mut Session, working: &mut Vec<Message>, message: Message) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append(session, &message) {
                warn!(session_id = %session.id, error = %e, "failed to persist message");
            }
        }
        working.push(message.clone());
        session.add_message(message);
    }
}

fn emit(on_chunk: Option<ChunkCallback<'_>>, chunk: StreamChunk) {
    if let Some(cb) = on_chunk {
        cb(chunk);
    }
}

fn emit_context_management(on_chunk: Option<ChunkCallback<'_>>, before: usize, after: usize) {
    emit(
        on_chunk,
        StreamChunk::new(
            ChunkType::ContextManagement,
            format!("compressed history: {before} → {after} messages"),
        )
        .with_meta("before", before.to_string())
        .with_meta("after", after.to_string()),
    );
}

fn forward_delta(on_chunk: Option<ChunkCallback<'_>>, delta: &StreamDelta) {
    let chunk = match delta {
        StreamDelta::Text(t) if !t.is_empty() => StreamChunk::new(ChunkType::LlmContent, t.clone()),
        StreamDelta::Reasoning(t) => StreamChunk::new(ChunkType::Reasoning, t.clone()),
        StreamDelta::ReasoningSummary(t) => {
            StreamChunk::new(ChunkType::ReasoningSummary, t.clone())
        }
        StreamDelta::Think(t) => StreamChunk::new(ChunkType::Think, t.clone()),
        _ => return,
    };
    emit(on_chunk, chunk);
}

fn forward_exec_event(on_chunk: Option<ChunkCallback<'_>>, event: ExecEvent) {
    match event {
        ExecEvent::Started { call_id, tool_name, rendered } => emit(
            on_chunk,
            StreamChunk::new(ChunkType::ToolStart, rendered)
                .with_meta("call_id", call_id)
                .with_meta("tool_name", tool_name),
        ),
        ExecEvent::Finished { call_id, tool_name, preview, success, duration_ms } => {
            let chunk_type = if success { ChunkType::ToolResult } else { ChunkType::ToolError };
            emit(
                on_chunk,
                StreamChunk::new(chunk_type, preview)
                    .with_meta("call_id", call_id)
                    .with_meta("tool_name", tool_name)
                    .with_meta("duration_ms", duration_ms.to_string()),
            )
        }
    }
}

fn is_cancelled(cancel: Option<&mut oneshot::Receiver<()>>) -> bool {
    match cancel {
        // Both an explicit send and a dropped sender count as cancellation.
        Some(c) => !matches!(c.try_recv(), Err(oneshot::error::TryRecvError::Empty)),
        None => false,
    }
}

fn cancelled_outcome(
    steps: Vec<ExecutionStep>,
    last_answer: String,
    totals: TokenTotals,
    start: Instant,
) -> anyhow::Result<TaskResult> {
    if steps.is_empty() {
        return Err(Cancelled.into());
    }
    Ok(partial_result(false, last_answer, steps, totals, start))
}

fn partial_result(
    success: bool,
    final_answer: String,
    steps: Vec<ExecutionStep>,
    totals: TokenTotals,
    start: Instant,
) -> TaskResult {
    TaskResult {
        success,
        final_answer,
        confidence: if success { 0.5 } else { 0.1 },
        steps,
        duration: start.elapsed(),
        tokens: totals,
    }
}

fn confidence_for(iterations: u32, completed: bool) -> f32 {
    if !completed {
        return 0.1;
    }
    (0.95 - 0.05 * iterations.saturating_sub(1) as f32).clamp(0.3, 0.95)
}

/// Build the conversation messages for a batch of tool results, pairing
/// each expected call with its result.  Calls with no result get a
/// fallback message so the tool-call/response pairing holds; their names
/// are returned for error reporting.
///
/// Providers in the Gemini family reject role=tool messages, so for them
/// results are shaped as user messages prefixed with
/// "`<toolName> executed result: `".
fn build_tool_messages(
    calls: &[ToolCall],
    results: &[ToolResult],
    gemini: bool,
) -> (Vec<Message>, Vec<String>) {
    let by_id: HashMap<&str, &ToolResult> =
        results.iter().map(|r| (r.call_id.as_str(), r)).collect();

    let mut messages = Vec::with_capacity(calls.len());
    let mut missing = Vec::new();

    for call in calls {
        let (tool_name, content, success) = match by_id.get(call.id.as_str()) {
            Some(r) => (r.tool_name.clone(), r.content.clone(), r.success),
            None => {
                missing.push(call.name.clone());
                (
                    call.name.clone(),
                    format!(
                        "Tool execution failed: no response generated for {}",
                        call.name
                    ),
                    false,
                )
            }
        };

        let msg = if gemini {
            Message::user(format!("{tool_name} executed result: {content}"))
                .with_meta(crate::message::META_TOOL_CALL_ID, &call.id)
                .with_meta(crate::message::META_TOOL_NAME, &tool_name)
                .with_meta(META_TOOL_SUCCESS, success.to_string())
        } else {
            Message::tool_response(&call.id, &tool_name, content)
                .with_meta(META_TOOL_SUCCESS, success.to_string())
        };
        messages.push(msg);
    }

    (messages, missing)
}

fn summarize_results(results: &[ToolResult]) -> String {
    let ok = results.iter().filter(|r| r.success).count();
    let failed = results.len() - ok;
    if failed == 0 {
        format!("{ok} tool call(s) succeeded")
    } else {
        format!("{ok} tool call(s) succeeded, {failed} failed")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use alex_model::Role;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall::new(id, name, json!({}))
    }

    fn result(id: &str, name: &str, success: bool) -> ToolResult {
        let c = call(id, name);
        if success {
            ToolResult::ok(&c, alex_tools::ToolOutput::text("out"), Duration::ZERO)
        } else {
            ToolResult::err(&c, "bad", Duration::ZERO)
        }
    }

    #[test]
    fn tool_messages_pair_one_to_one() {
        let calls = vec![call("c1", "a"), call("c2", "b")];
        let results = vec![result("c1", "a", true), result("c2", "b", false)];
        let (messages, missing) = build_tool_messages(&calls, &results, false);
        assert!(missing.is_empty());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].tool_call_id(), Some("c1"));
        assert_eq!(messages[1].tool_call_id(), Some("c2"));
        assert_eq!(
            messages[1].metadata.get(META_TOOL_SUCCESS).map(String::as_str),
            Some("false")
        );
    }

    #[test]
    fn missing_result_gets_fallback_message() {
        let calls = vec![call("c1", "file_read"), call("c2", "shell")];
        let results = vec![result("c1", "file_read", true)];
        let (messages, missing) = build_tool_messages(&calls, &results, false);
        assert_eq!(messages.len(), 2, "one message per expected call");
        assert_eq!(missing, vec!["shell"]);
        assert_eq!(messages[1].tool_call_id(), Some("c2"));
        assert!(
            messages[1]
                .content
                .contains("no response generated for shell"),
            "got: {}",
            messages[1].content
        );
    }

    #[test]
    fn gemini_shape_uses_user_role_with_prefix() {
        let calls = vec![call("c1", "file_read")];
        let results = vec![result("c1", "file_read", true)];
        let (messages, _) = build_tool_messages(&calls, &results, true);
        assert_eq!(messages[0].role, Role::User);
        assert!(
            messages[0].content.starts_with("file_read executed result: "),
            "got: {}",
            messages[0].content
        );
    }

    #[test]
    fn standard_shape_uses_tool_role() {
        let calls = vec![call("c1", "file_read")];
        let results = vec![result("c1", "file_read", true)];
        let (messages, _) = build_tool_messages(&calls, &results, false);
        assert_eq!(messages[0].role, Role::Tool);
    }

    #[test]
    fn confidence_decays_with_iterations() {
        assert_eq!(confidence_for(1, true), 0.95);
        assert!(confidence_for(5, true) < confidence_for(2, true));
        assert!(confidence_for(30, true) >= 0.3);
        assert_eq!(confidence_for(3, false), 0.1);
    }

    #[test]
    fn summarize_counts_successes_and_failures() {
        let results = vec![
            result("c1", "a", true),
            result("c2", "b", true),
            result("c3", "c", false),
        ];
        assert_eq!(summarize_results(&results), "2 tool call(s) succeeded, 1 failed");
    }

    #[test]
    fn cancel_detection_covers_send_and_drop() {
        let (tx, mut rx) = oneshot::channel::<()>();
        assert!(!is_cancelled(Some(&mut rx)));
        tx.send(()).unwrap();
        assert!(is_cancelled(Some(&mut rx)));

        let (tx2, mut rx2) = oneshot::channel::<()>();
        drop(tx2);
        assert!(is_cancelled(Some(&mut rx2)));

        assert!(!is_cancelled(None));
    }
}
