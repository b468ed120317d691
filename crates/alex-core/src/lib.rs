// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! alex-core — the agent core: a bounded model ↔ tool loop with streaming
//! output, token-budget context compression, and append-only sessions.
//!
//! ```text
//! Agent (facade, one active session)
//!   └─ IterationDriver (Think–Act–Observe loop)
//!        ├─ ContextManager → compress (pair-preserving)
//!        ├─ convert (session ↔ wire messages)
//!        ├─ parser (structured + text-embedded tool calls)
//!        └─ alex_tools::execute_serial (1:1 call/result)
//! ```

mod agent;
mod compress;
mod context;
mod convert;
mod driver;
mod estimate;
mod events;
mod message;
mod parser;
mod prompts;
mod session;
mod store;

pub use agent::Agent;
pub use compress::{
    compress, needs_compression, CompressionConfig, CompressionResult, SummaryKind, Summarizer,
    META_ORIGINAL_COUNT, SUMMARY_TYPE_LLM, SUMMARY_TYPE_STATISTICAL,
};
pub use context::{ContextManager, ContextStats, LlmSummarizer};
pub use convert::{
    from_wire, message_to_wire, to_wire, to_wire_without_system, ConversionError,
};
pub use driver::{
    ExecutionStep, IterationDriver, StepAction, StepToolResult, TaskResult,
};
pub use estimate::{
    estimate_message, estimate_messages, estimate_text, estimate_wire_messages, CHARS_PER_TOKEN,
    MESSAGE_OVERHEAD_TOKENS,
};
pub use events::{ChunkCallback, ChunkType, StreamChunk, TokenTotals};
pub use message::{
    Message, Role, ToolCallRecord, META_TOOL_CALL_ID, META_TOOL_NAME, META_TOOL_SUCCESS, META_TYPE,
};
pub use parser::{
    parse_tool_calls, TOOL_CALLS_BEGIN, TOOL_CALLS_END, TOOL_CALL_BEGIN, TOOL_CALL_END, TOOL_SEP,
};
pub use prompts::system_prompt;
pub use session::Session;
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
