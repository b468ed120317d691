// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use alex_model::Usage;

/// Every event type a caller may receive while a task streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Status,
    Iteration,
    LlmContent,
    Reasoning,
    ReasoningSummary,
    Think,
    ThinkingResult,
    ToolStart,
    ToolResult,
    ToolError,
    FinalAnswer,
    MaxIterations,
    TokenUsage,
    ContextManagement,
    Complete,
    Error,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Iteration => "iteration",
            Self::LlmContent => "llm_content",
            Self::Reasoning => "reasoning",
            Self::ReasoningSummary => "reasoning_summary",
            Self::Think => "think",
            Self::ThinkingResult => "thinking_result",
            Self::ToolStart => "tool_start",
            Self::ToolResult => "tool_result",
            Self::ToolError => "tool_error",
            Self::FinalAnswer => "final_answer",
            Self::MaxIterations => "max_iterations",
            Self::TokenUsage => "token_usage",
            Self::ContextManagement => "context_management",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// Cumulative token accounting across a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub prompt: u64,
    pub completion: u64,
}

impl TokenTotals {
    pub fn total(&self) -> u64 {
        self.prompt + self.completion
    }

    pub fn add_usage(&mut self, usage: &Usage) {
        self.prompt += u64::from(usage.prompt_tokens);
        self.completion += u64::from(usage.completion_tokens);
    }

    pub fn add(&mut self, prompt: u64, completion: u64) {
        self.prompt += prompt;
        self.completion += completion;
    }
}

/// One incremental event delivered to the caller's stream callback.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub chunk_type: ChunkType,
    /// Human-readable payload.
    pub content: String,
    pub metadata: HashMap<String, String>,
    /// Cumulative totals; set on `token_usage` and terminal chunks.
    pub tokens: Option<TokenTotals>,
}

impl StreamChunk {
    pub fn new(chunk_type: ChunkType, content: impl Into<String>) -> Self {
        Self {
            chunk_type,
            content: content.into(),
            metadata: HashMap::new(),
            tokens: None,
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_tokens(mut self, tokens: TokenTotals) -> Self {
        self.tokens = Some(tokens);
        self
    }
}

/// Inline chunk callback.  Runs on the driver's task — callers must not
/// block in it.
pub type ChunkCallback<'a> = &'a (dyn Fn(StreamChunk) + Send + Sync);

// ─── Unit tests ──────────────────────────────────────────────────────────────
