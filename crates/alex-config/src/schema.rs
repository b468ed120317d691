// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    25
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_messages() -> usize {
    50
}

fn default_token_budget() -> usize {
    100_000
}

fn default_recent_keep() -> usize {
    10
}

fn default_compression_ratio() -> f32 {
    0.3
}

fn default_cache_capacity() -> usize {
    16
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_mcp_timeout_secs() -> u64 {
    60
}

fn default_refresh_interval_secs() -> u64 {
    300
}

/// Top-level agent configuration.
///
/// Loading from disk is the caller's concern; this crate only defines the
/// schema (all structs deserialize from YAML or JSON with serde defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub context: ContextConfig,
    /// External MCP tool providers spawned/connected at startup.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

/// Limits and guards for a single task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard ceiling on model calls per task.  Reaching it ends the loop with
    /// a partial result rather than an error.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Attempts (not additional retries) for a transient model-call failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wall-clock budget for one task.  `None` means unbounded.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Cumulative token budget for one task.  `None` means unbounded.
    #[serde(default)]
    pub cost_limit_tokens: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_retries: default_max_retries(),
            timeout_secs: None,
            cost_limit_tokens: None,
        }
    }
}

/// Model endpoint configuration, forwarded to the LLM client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier, e.g. "openai" | "deepseek" | "gemini" | "mock".
    #[serde(default)]
    pub provider: String,
    /// Model name forwarded to the provider API.
    #[serde(default)]
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files.
    pub api_key: Option<String>,
    /// Base URL override.  Also drives provider-family detection: a URL
    /// containing `googleapis` switches tool-result messages to the
    /// user-role shape Gemini requires.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            name: String::new(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Context-window management tuning.
///
/// Compression fires only when BOTH `max_messages` and `token_budget` are
/// exceeded; below either threshold the compressor is a pass-through.  The
/// defaults align with a 128K-token model window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Message-count trigger for compression.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Estimated-token trigger for compression.
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    /// How many trailing messages survive compression verbatim (tool-call
    /// pairs are expanded so the cut never splits a pair).
    #[serde(default = "default_recent_keep")]
    pub recent_keep: usize,
    /// Keep every system message across compression.
    #[serde(default = "default_true")]
    pub preserve_system_messages: bool,
    /// Target fraction of the original token count after compression.
    /// Advisory — the summarizer aims for it, nothing enforces it.
    #[serde(default = "default_compression_ratio")]
    pub compression_ratio: f32,
    /// Entries in the context manager's fingerprint cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Wall-clock expiry for cached optimization results.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            token_budget: default_token_budget(),
            recent_keep: default_recent_keep(),
            preserve_system_messages: true,
            compression_ratio: default_compression_ratio(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// How an MCP server process is started (or reached).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpSpawnKind {
    /// `npx -y <command> <args…>` over stdio.
    Npx,
    /// Plain executable over stdio.
    Executable,
    /// `docker run -i --rm <command> <args…>` over stdio.
    Docker,
    /// Remote server reached over HTTP + SSE; `url` must be set.
    Sse,
}

/// Descriptor for one external MCP tool provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Stable identifier, used for tool-name prefixing (`mcp_<id>_<tool>`).
    pub id: String,
    /// Human-readable name for status output.
    #[serde(default)]
    pub name: String,
    pub kind: McpSpawnKind,
    /// Executable / package / image, depending on `kind`.  Unused for `sse`.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub work_dir: Option<String>,
    /// SSE endpoint URL (kind = `sse` only).
    #[serde(default)]
    pub url: Option<String>,
    /// Start this server when the manager starts.
    #[serde(default = "default_true")]
    pub autostart: bool,
    /// Restart (bounded, with backoff) when the server exits.
    #[serde(default)]
    pub autorestart: bool,
    /// Per-request timeout.  Must be larger than typical model/tool latency.
    #[serde(default = "default_mcp_timeout_secs")]
    pub timeout_secs: u64,
    /// Interval between `tools/list` refreshes.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
