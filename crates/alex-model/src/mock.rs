// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    assembler::assemble_stream, CompletionRequest, CompletionResponse, DeltaStream, LlmClient,
    StreamDelta, Usage,
};

/// One scripted model turn: either a delta sequence or a hard error from
/// `chat_stream` itself.
pub enum ScriptTurn {
    Stream(Vec<StreamDelta>),
    Error(String),
}

/// A pre-scripted model client.  Each call pops the next [`ScriptTurn`] from
/// the front of the queue, so tests specify exact event sequences —
/// including tool calls and failures — without network access.
pub struct ScriptedClient {
    turns: Arc<Mutex<Vec<ScriptTurn>>>,
    base_url: String,
    calls: AtomicU32,
    /// The last request seen by this client, for request-shape assertions.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedClient {
    pub fn new(turns: Vec<ScriptTurn>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(turns)),
            base_url: String::new(),
            calls: AtomicU32::new(0),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Override the reported base URL (e.g. a `googleapis` URL to exercise
    /// the Gemini tool-result shape).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Convenience: client that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![ScriptTurn::Stream(vec![
            StreamDelta::Text(r),
            StreamDelta::Usage(Usage {
                prompt_tokens: 5,
                completion_tokens: 5,
                total_tokens: 10,
            }),
            StreamDelta::Done,
        ])])
    }

    /// Convenience: one tool call on the first turn, then a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            ScriptTurn::Stream(vec![
                StreamDelta::ToolCall {
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                StreamDelta::Done,
            ]),
            ScriptTurn::Stream(vec![
                StreamDelta::Text(final_text.into()),
                StreamDelta::Done,
            ]),
        ])
    }

    /// Convenience: fail `n` times with `error`, then serve `deltas`.
    pub fn fail_times_then(n: usize, error: impl Into<String>, deltas: Vec<StreamDelta>) -> Self {
        let msg = error.into();
        let mut turns: Vec<ScriptTurn> =
            (0..n).map(|_| ScriptTurn::Error(msg.clone())).collect();
        turns.push(ScriptTurn::Stream(deltas));
        Self::new(turns)
    }

    /// Number of `chat`/`chat_stream` calls made so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_turn(&self) -> ScriptTurn {
        let mut turns = self.turns.lock().unwrap();
        if turns.is_empty() {
            ScriptTurn::Stream(vec![
                StreamDelta::Text("[no more scripts]".into()),
                StreamDelta::Done,
            ])
        } else {
            turns.remove(0)
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn chat(&self, req: CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let stream = self.chat_stream(req).await?;
        assemble_stream(stream, None, None).await
    }

    async fn chat_stream(&self, req: CompletionRequest) -> anyhow::Result<DeltaStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req);
        match self.next_turn() {
            ScriptTurn::Error(msg) => Err(anyhow::anyhow!(msg)),
            ScriptTurn::Stream(deltas) => {
                let wrapped: Vec<anyhow::Result<StreamDelta>> =
                    deltas.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::ChatMessage;

    fn req() -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            stream: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn always_text_yields_text_then_done() {
        let c = ScriptedClient::always_text("hello");
        let mut s = c.chat_stream(req()).await.unwrap();
        let first = s.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamDelta::Text(t) if t == "hello"));
    }

    #[tokio::test]
    async fn chat_assembles_full_response() {
        let c = ScriptedClient::always_text("4");
        let resp = c.chat(req()).await.unwrap();
        assert_eq!(resp.message.content, "4");
        assert_eq!(resp.usage.unwrap().total_tokens, 10);
    }

    #[tokio::test]
    async fn tool_then_text_pops_in_order() {
        let c = ScriptedClient::tool_then_text("c1", "shell", "{}", "done");
        let first = c.chat(req()).await.unwrap();
        assert_eq!(first.message.tool_calls.len(), 1);
        let second = c.chat(req()).await.unwrap();
        assert_eq!(second.message.content, "done");
    }

    #[tokio::test]
    async fn error_turn_fails_chat_stream() {
        let c = ScriptedClient::new(vec![ScriptTurn::Error("HTTP 502".into())]);
        let err = match c.chat_stream(req()).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("502"));
    }

    #[tokio::test]
    async fn exhausted_scripts_fall_back() {
        let c = ScriptedClient::new(vec![]);
        let resp = c.chat(req()).await.unwrap();
        assert!(resp.message.content.contains("no more scripts"));
    }

    #[tokio::test]
    async fn call_count_and_last_request_are_tracked() {
        let c = ScriptedClient::always_text("x");
        let _ = c.chat(req()).await.unwrap();
        assert_eq!(c.call_count(), 1);
        let seen = c.last_request.lock().unwrap();
        assert_eq!(seen.as_ref().unwrap().model, "m");
    }
}
