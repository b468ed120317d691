// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model layer: wire types, the [`LlmClient`] trait, streaming response
//! assembly with retry, and a concrete OpenAI-compatible client.

pub mod assembler;
mod client;
pub mod mock;
mod openai_compat;
pub mod retry;
mod types;

pub use assembler::{assemble_stream, Cancelled};
pub use client::{is_gemini_family, DeltaStream, LlmClient};
pub use openai_compat::OpenAiCompatClient;
pub use retry::{
    chat_stream_with_retry, default_sleep, is_permanent_network_error, RetryPolicy, SleepFn,
};
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, FunctionCall, Role, StreamDelta,
    ToolCallData, ToolChoice, ToolSchema, Usage,
};
