// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completions client.
//!
//! Most hosted and local providers speak the same `/chat/completions` wire
//! format over SSE.  This single client covers them all; provider-specific
//! behaviour is limited to the base URL and auth header.

use anyhow::{bail, Context};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    ChatMessage, CompletionRequest, CompletionResponse, DeltaStream, LlmClient, StreamDelta,
    ToolCallData, ToolChoice, Usage,
};

pub struct OpenAiCompatClient {
    /// Client id returned by `LlmClient::name()`.
    driver_name: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    chat_url: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    client: reqwest::Client,
    /// Additional HTTP headers sent on every request.
    extra_headers: Vec<(String, String)>,
}

impl OpenAiCompatClient {
    /// `base_url` is the API base ending **before** `/chat/completions`,
    /// e.g. `https://api.openai.com/v1`.
    pub fn new(
        driver_name: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        base_url: impl Into<String>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Self {
        let base_url = base_url.into();
        let base = base_url.trim_end_matches('/').to_string();
        Self {
            driver_name: driver_name.into(),
            model: model.into(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            base_url: base,
            temperature,
            max_tokens,
            client: reqwest::Client::new(),
            extra_headers: Vec::new(),
        }
    }

    /// Build a client from the model section of the config.
    pub fn from_config(model: &alex_config::ModelConfig) -> Self {
        let base = model
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Self::new(
            model.provider.clone(),
            model.name.clone(),
            alex_config::resolve_api_key(model),
            base,
            model.temperature,
            model.max_tokens,
        )
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    fn build_body(&self, req: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": req.messages,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(t) = req.temperature.or(self.temperature) {
            body["temperature"] = json!(t);
        }
        if let Some(mt) = req.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = json!(mt);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            if req.tool_choice != ToolChoice::Auto {
                body["tool_choice"] = req.tool_choice.to_wire();
            }
        }
        body
    }

    async fn post(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        debug!(
            driver = %self.driver_name,
            model = %self.model,
            "sending completion request"
        );
        let mut http_req = self.client.post(&self.chat_url).json(body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }
        for (name, val) in &self.extra_headers {
            http_req = http_req.header(name.as_str(), val.as_str());
        }
        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} http error {status}: {text}", self.driver_name);
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn chat(&self, req: CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let body = self.build_body(&req, false);
        let resp = self.post(&body).await?;
        let v: Value = resp
            .json()
            .await
            .with_context(|| format!("{} response was not JSON", self.driver_name))?;
        parse_blocking_response(&v)
    }

    async fn chat_stream(&self, req: CompletionRequest) -> anyhow::Result<DeltaStream> {
        let body = self.build_body(&req, true);
        let resp = self.post(&body).await?;

        // SSE events can be split across TCP packets.  Keep a line buffer
        // across chunks; emit deltas only for complete lines.
        let byte_stream = resp.bytes_stream();
        let delta_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let deltas: Vec<anyhow::Result<StreamDelta>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(deltas))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(delta_stream))
    }
}

/// Parse a non-streaming `/chat/completions` response body.
fn parse_blocking_response(v: &Value) -> anyhow::Result<CompletionResponse> {
    let choice = v
        .get("choices")
        .and_then(|c| c.get(0))
        .context("response has no choices")?;
    let msg = &choice["message"];
    let content = msg["content"].as_str().unwrap_or("").to_string();
    let mut tool_calls = Vec::new();
    if let Some(calls) = msg["tool_calls"].as_array() {
        for tc in calls {
            let id = tc["id"].as_str().unwrap_or("").to_string();
            let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
            let args = tc["function"]["arguments"].as_str().unwrap_or("").to_string();
            if name.is_empty() {
                continue;
            }
            tool_calls.push(ToolCallData::function(id, name, args));
        }
    }
    Ok(CompletionResponse {
        message: ChatMessage::assistant_with_tool_calls(content, tool_calls),
        finish_reason: choice["finish_reason"].as_str().map(str::to_string),
        usage: parse_usage(v.get("usage")),
    })
}

fn parse_usage(u: Option<&Value>) -> Option<Usage> {
    let u = u.filter(|u| !u.is_null())?;
    Some(Usage {
        prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
        total_tokens: u["total_tokens"].as_u64().unwrap_or(0) as u32,
    })
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so the next TCP chunk can
/// extend it — a single SSE event may be split across multiple packets.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<StreamDelta>> {
    let mut deltas = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(d) = parse_sse_data_line(&line) {
            deltas.push(d);
        }
    }
    deltas
}

/// Parse a single complete SSE `data:` line.  Returns `None` for empty
/// lines, comments, and unparseable payloads (logged and skipped).
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<StreamDelta>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(StreamDelta::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(Ok(parse_sse_chunk(&v)))
}

fn parse_sse_chunk(v: &Value) -> StreamDelta {
    // Usage-only chunk (emitted when stream_options.include_usage = true).
    if let Some(usage) = parse_usage(v.get("usage")) {
        return StreamDelta::Usage(usage);
    }

    let choice = &v["choices"][0];

    if let Some(reason) = choice["finish_reason"].as_str() {
        return StreamDelta::FinishReason(reason.to_string());
    }

    let delta = &choice["delta"];

    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return StreamDelta::ToolCall {
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
        };
    }

    // Chain-of-thought: `reasoning_content` (llama.cpp, DeepSeek) or
    // `reasoning` (OpenRouter).  Prefer the former.
    let reasoning = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(r) = reasoning {
        if !r.is_empty() {
            return StreamDelta::Reasoning(r.to_string());
        }
    }

    StreamDelta::Text(
        delta
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string(),
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_client() -> OpenAiCompatClient {
        OpenAiCompatClient::new(
            "test-compat",
            "test-model",
            None,
            "http://localhost:9999/v1",
            Some(0.0),
            Some(1024),
        )
    }

    #[test]
    fn chat_url_appends_path() {
        let c = make_client();
        assert_eq!(c.chat_url, "http://localhost:9999/v1/chat/completions");
    }

    #[test]
    fn base_url_trailing_slash_stripped() {
        let c = OpenAiCompatClient::new("x", "m", None, "http://localhost:1234/v1/", None, None);
        assert_eq!(c.base_url(), "http://localhost:1234/v1");
        assert_eq!(c.chat_url, "http://localhost:1234/v1/chat/completions");
    }

    #[test]
    fn body_includes_tools_and_stream_options() {
        let c = make_client();
        let req = CompletionRequest {
            model: "test-model".into(),
            messages: vec![ChatMessage::user("hi")],
            tools: vec![crate::ToolSchema {
                name: "shell".into(),
                description: "run a command".into(),
                parameters: json!({ "type": "object" }),
            }],
            ..Default::default()
        };
        let body = c.build_body(&req, true);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["stream_options"]["include_usage"], json!(true));
        assert_eq!(body["tools"][0]["function"]["name"], "shell");
        assert!(body.get("tool_choice").is_none(), "auto stays implicit");
    }

    #[test]
    fn body_carries_explicit_tool_choice() {
        let c = make_client();
        let req = CompletionRequest {
            model: "test-model".into(),
            messages: vec![ChatMessage::user("hi")],
            tools: vec![crate::ToolSchema {
                name: "shell".into(),
                description: String::new(),
                parameters: json!({}),
            }],
            tool_choice: ToolChoice::Named("shell".into()),
            ..Default::default()
        };
        let body = c.build_body(&req, false);
        assert_eq!(body["tool_choice"]["function"]["name"], "shell");
    }

    // ── parse_sse_chunk ───────────────────────────────────────────────────────

    #[test]
    fn parse_sse_text_delta() {
        let v = json!({ "choices": [{ "delta": { "content": "hello" } }] });
        assert!(matches!(parse_sse_chunk(&v), StreamDelta::Text(t) if t == "hello"));
    }

    #[test]
    fn parse_sse_tool_call_start() {
        let v = json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "id": "call_abc",
                        "function": { "name": "shell", "arguments": "" }
                    }]
                }
            }]
        });
        let d = parse_sse_chunk(&v);
        assert!(
            matches!(&d, StreamDelta::ToolCall { id, name, arguments }
                if id == "call_abc" && name == "shell" && arguments.is_empty()),
            "unexpected delta: {d:?}"
        );
    }

    #[test]
    fn parse_sse_tool_call_args_fragment() {
        let v = json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "function": { "arguments": "{\"cmd\": " }
                    }]
                }
            }]
        });
        let d = parse_sse_chunk(&v);
        assert!(
            matches!(&d, StreamDelta::ToolCall { id, name, arguments }
                if id.is_empty() && name.is_empty() && arguments == "{\"cmd\": "),
            "unexpected delta: {d:?}"
        );
    }

    #[test]
    fn parse_sse_usage_event() {
        let v = json!({ "usage": { "prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150 } });
        assert!(matches!(
            parse_sse_chunk(&v),
            StreamDelta::Usage(Usage { prompt_tokens: 100, completion_tokens: 50, total_tokens: 150 })
        ));
    }

    #[test]
    fn parse_sse_null_usage_falls_through_to_delta() {
        let v = json!({ "usage": null, "choices": [{ "delta": { "content": "hi" } }] });
        assert!(matches!(parse_sse_chunk(&v), StreamDelta::Text(t) if t == "hi"));
    }

    #[test]
    fn parse_sse_finish_reason() {
        let v = json!({ "choices": [{ "finish_reason": "length", "delta": {} }] });
        assert!(matches!(parse_sse_chunk(&v), StreamDelta::FinishReason(r) if r == "length"));
    }

    #[test]
    fn parse_sse_reasoning_content() {
        let v = json!({ "choices": [{ "delta": { "reasoning_content": "thinking..." } }] });
        assert!(matches!(parse_sse_chunk(&v), StreamDelta::Reasoning(r) if r == "thinking..."));
    }

    #[test]
    fn parse_sse_openrouter_reasoning_field() {
        let v = json!({ "choices": [{ "delta": { "reasoning": "hmm" } }] });
        assert!(matches!(parse_sse_chunk(&v), StreamDelta::Reasoning(r) if r == "hmm"));
    }

    #[test]
    fn parse_sse_empty_reasoning_falls_through_to_text() {
        let v = json!({ "choices": [{ "delta": { "content": "42", "reasoning_content": "" } }] });
        assert!(matches!(parse_sse_chunk(&v), StreamDelta::Text(t) if t == "42"));
    }

    // ── SSE line buffer ──────────────────────────────────────────────────────

    #[test]
    fn drain_complete_lines_handles_single_complete_line() {
        let line = r#"{"choices":[{"delta":{"content":"hi"}}]}"#;
        let mut buf = format!("data: {line}\n");
        let deltas = drain_complete_sse_lines(&mut buf);
        assert_eq!(deltas.len(), 1);
        assert!(matches!(&deltas[0], Ok(StreamDelta::Text(t)) if t == "hi"));
        assert!(buf.is_empty(), "buffer should be drained");
    }

    #[test]
    fn drain_complete_lines_retains_incomplete_last_line() {
        let partial = "data: {\"choices\":[{\"delta\":{\"content\":\"hel";
        let mut buf = partial.to_string();
        let deltas = drain_complete_sse_lines(&mut buf);
        assert!(deltas.is_empty(), "no complete line yet");
        assert_eq!(buf, partial, "partial line must stay in buffer");
    }

    #[test]
    fn sse_event_split_across_two_chunks_is_parsed_correctly() {
        let full_line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"shell","arguments":""}}]}}]}"#;
        let split = full_line.len() / 2;

        let mut buf = String::new();
        buf.push_str(&full_line[..split]);
        assert!(drain_complete_sse_lines(&mut buf).is_empty());
        assert!(!buf.is_empty(), "buffer must hold partial line");

        buf.push_str(&full_line[split..]);
        buf.push('\n');
        let deltas = drain_complete_sse_lines(&mut buf);
        assert_eq!(deltas.len(), 1);
        match &deltas[0] {
            Ok(StreamDelta::ToolCall { id, name, .. }) => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "shell");
            }
            other => panic!("unexpected delta: {other:?}"),
        }
    }

    #[test]
    fn multiple_sse_events_in_one_chunk_all_parsed() {
        let chunk = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
            "data: [DONE]\n",
        );
        let mut buf = chunk.to_string();
        let deltas = drain_complete_sse_lines(&mut buf);
        assert_eq!(deltas.len(), 3);
        assert!(matches!(&deltas[2], Ok(StreamDelta::Done)));
    }

    #[test]
    fn windows_crlf_line_endings_are_handled() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\r\n".to_string();
        let deltas = drain_complete_sse_lines(&mut buf);
        assert_eq!(deltas.len(), 1);
        assert!(matches!(&deltas[0], Ok(StreamDelta::Text(t)) if t == "hi"));
    }

    #[test]
    fn garbage_data_line_is_skipped() {
        let mut buf = "data: {not json}\ndata: [DONE]\n".to_string();
        let deltas = drain_complete_sse_lines(&mut buf);
        assert_eq!(deltas.len(), 1, "bad frame skipped, [DONE] kept");
    }

    // ── blocking response ────────────────────────────────────────────────────

    #[test]
    fn parse_blocking_text_response() {
        let v = json!({
            "choices": [{
                "message": { "role": "assistant", "content": "4" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 1, "total_tokens": 13 }
        });
        let resp = parse_blocking_response(&v).unwrap();
        assert_eq!(resp.message.content, "4");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.unwrap().prompt_tokens, 12);
    }

    #[test]
    fn parse_blocking_tool_call_response() {
        let v = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "c1",
                        "type": "function",
                        "function": { "name": "file_read", "arguments": "{\"path\":\"/tmp/x\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let resp = parse_blocking_response(&v).unwrap();
        assert_eq!(resp.message.tool_calls.len(), 1);
        assert_eq!(resp.message.tool_calls[0].function.name, "file_read");
        assert!(resp.usage.is_none());
    }

    #[test]
    fn parse_blocking_no_choices_is_error() {
        let v = json!({ "choices": [] });
        assert!(parse_blocking_response(&v).is_err());
    }
}
