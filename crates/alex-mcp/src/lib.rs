// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP client layer: JSON-RPC 2.0 framing over a spawned child process
//! (stdio) or HTTP + SSE, plus the manager that owns configured servers
//! and surfaces their tools in the agent's tool registry.
//!
//! ```text
//! McpManager ──spawns──► StdioTransport ──stdin/stdout──► child process
//!      │                 SseTransport  ──GET + POST────► remote server
//!      │
//!      └─registers─► McpToolAdapter (one per remote tool) ─► ToolRegistry
//! ```

mod adapter;
mod jsonrpc;
mod manager;
mod sse;
mod stdio;
mod transport;

pub use adapter::{qualified_name, McpToolAdapter};
pub use jsonrpc::{
    classify_frame, Frame, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JSONRPC_VERSION, MCP_PROTOCOL_VERSION,
};
pub use manager::{build_transport, McpManager, RemoteTool};
pub use sse::{SseConfig, SseTransport};
pub use stdio::{StdioConfig, StdioTransport};
pub use transport::{McpTransport, TransportError};
