// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool layer: the [`Tool`] trait, the registry, and the serial executor
//! that turns a batch of parsed tool calls into exactly one result each.

mod context;
pub mod display;
mod executor;
mod registry;
mod tool;

pub use context::{CancelFlag, ExecutionContext};
pub use executor::{execute_serial, ExecEvent};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{Tool, ToolCall, ToolOutput, ToolResult};

/// Registry shared between the agent loop and background tool providers
/// (MCP refresh tasks replace entries while the loop reads schemas).
pub type SharedToolRegistry = std::sync::Arc<tokio::sync::RwLock<ToolRegistry>>;

/// Convenience constructor for a [`SharedToolRegistry`].
pub fn shared_registry(registry: ToolRegistry) -> SharedToolRegistry {
    std::sync::Arc::new(tokio::sync::RwLock::new(registry))
}
