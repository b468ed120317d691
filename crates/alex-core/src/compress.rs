// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Message-list compression under a token budget.
//!
//! The compressor never fails the caller: the LLM summary is best-effort
//! and falls back to a deterministic statistical summary.  Two properties
//! hold on every output:
//!
//! 1. every system message of the input survives, and
//! 2. every retained tool message's call id resolves to a retained
//!    assistant message (tool-call pairs are never split by the cut).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use alex_model::Role;

use crate::estimate::estimate_messages;
use crate::message::{Message, META_TYPE};

/// Metadata key on summary messages: how many messages were folded away.
pub const META_ORIGINAL_COUNT: &str = "original_count";

pub const SUMMARY_TYPE_LLM: &str = "llm_summary";
pub const SUMMARY_TYPE_STATISTICAL: &str = "statistical_summary";

/// Ceiling on one LLM summarization call; past it the statistical fallback
/// takes over.
const SUMMARIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Characters of each recent user request quoted in a statistical summary.
const REQUEST_FRAGMENT_CHARS: usize = 120;

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Message-count trigger.  Compression fires only when BOTH this and
    /// `token_budget` are exceeded.
    pub max_messages: usize,
    pub token_budget: usize,
    /// Trailing messages kept verbatim (expanded over tool-call pairs).
    pub recent_keep: usize,
    pub preserve_system: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_messages: 50,
            token_budget: 100_000,
            recent_keep: 10,
            preserve_system: true,
        }
    }
}

impl From<&alex_config::ContextConfig> for CompressionConfig {
    fn from(cfg: &alex_config::ContextConfig) -> Self {
        Self {
            max_messages: cfg.max_messages,
            token_budget: cfg.token_budget,
            recent_keep: cfg.recent_keep,
            preserve_system: cfg.preserve_system_messages,
        }
    }
}

/// Best-effort LLM summarization of a serialized transcript.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryKind {
    Llm,
    Statistical,
}

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub messages: Vec<Message>,
    pub compressed: bool,
    pub original_count: usize,
    pub summary_kind: Option<SummaryKind>,
}

impl CompressionResult {
    fn pass_through(messages: &[Message]) -> Self {
        Self {
            messages: messages.to_vec(),
            compressed: false,
            original_count: messages.len(),
            summary_kind: None,
        }
    }
}

/// Both thresholds must be exceeded before compression runs.
pub fn needs_compression(messages: &[Message], cfg: &CompressionConfig) -> bool {
    messages.len() > cfg.max_messages && estimate_messages(messages) > cfg.token_budget
}

/// Compress `messages` under the configured budget.
///
/// Below the trigger thresholds this is a pass-through.  Otherwise the
/// recent tail (pair-complete) is kept verbatim, system messages are
/// preserved, and everything older is folded into one summary system
/// message carrying `metadata.type` and `metadata.original_count`.
pub async fn compress(
    messages: &[Message],
    cfg: &CompressionConfig,
    summarizer: Option<&dyn Summarizer>,
) -> CompressionResult {
    if !needs_compression(messages, cfg) {
        return CompressionResult::pass_through(messages);
    }

    let cut = pair_preserving_cut(messages, cfg.recent_keep);
    let to_compress: Vec<&Message> = messages[..cut]
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();
    if to_compress.is_empty() {
        return CompressionResult::pass_through(messages);
    }

    let (summary_text, kind) = summarize(&to_compress, summarizer).await;
    let kind_str = match kind {
        SummaryKind::Llm => SUMMARY_TYPE_LLM,
        SummaryKind::Statistical => SUMMARY_TYPE_STATISTICAL,
    };
    let summary = Message::system(summary_text)
        .with_meta(META_TYPE, kind_str)
        .with_meta(META_ORIGINAL_COUNT, to_compress.len().to_string());

    let mut out: Vec<Message> = Vec::with_capacity(messages.len() - to_compress.len() + 1);
    if cfg.preserve_system {
        out.extend(messages[..cut].iter().filter(|m| m.role == Role::System).cloned());
    }
    out.push(summary);
    out.extend(messages[cut..].iter().cloned());

    debug!(
        before = messages.len(),
        after = out.len(),
        cut,
        summary = kind_str,
        "compressed message history"
    );

    CompressionResult {
        messages: out,
        compressed: true,
        original_count: messages.len(),
        summary_kind: Some(kind),
    }
}

/// Find the cut index: everything at or after it is the verbatim tail.
///
/// Walks backward marking the last `recent_keep` messages, closes the mark
/// set over tool-call pairs (a marked tool response pulls in its producing
/// assistant; a marked assistant pulls in all its responses), then lowers
/// the cut until no tool message in the tail references an assistant
/// before it.
fn pair_preserving_cut(messages: &[Message], recent_keep: usize) -> usize {
    if messages.is_empty() || recent_keep == 0 {
        return messages.len();
    }

    // tool-call id → producing assistant index
    let mut producer: HashMap<&str, usize> = HashMap::new();
    for (i, m) in messages.iter().enumerate() {
        if m.role == Role::Assistant {
            for tc in &m.tool_calls {
                producer.insert(tc.id.as_str(), i);
            }
        }
    }

    let mut marked: HashSet<usize> = HashSet::new();
    for i in (0..messages.len()).rev().take(recent_keep) {
        marked.insert(i);
    }

    // Close over pairs until stable.
    loop {
        let mut added = false;
        let snapshot: Vec<usize> = marked.iter().copied().collect();
        for i in snapshot {
            let m = &messages[i];
            if m.role == Role::Tool {
                if let Some(&a) = m.tool_call_id().and_then(|id| producer.get(id)) {
                    added |= marked.insert(a);
                }
            }
            if m.role == Role::Assistant && !m.tool_calls.is_empty() {
                let ids: HashSet<&str> = m.tool_calls.iter().map(|tc| tc.id.as_str()).collect();
                for (j, candidate) in messages.iter().enumerate().skip(i + 1) {
                    if candidate.role == Role::Tool
                        && candidate.tool_call_id().map(|id| ids.contains(id)).unwrap_or(false)
                    {
                        added |= marked.insert(j);
                    }
                }
            }
        }
        if !added {
            break;
        }
    }

    let mut cut = marked.iter().copied().min().unwrap_or(messages.len());

    // The tail is a contiguous range, so it may include unmarked tool
    // messages whose producer sits before the cut; pull the cut back until
    // none do.
    loop {
        let orphan_producer = messages[cut..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id())
            .filter_map(|id| producer.get(id).copied())
            .filter(|&a| a < cut)
            .min();
        match orphan_producer {
            Some(a) => cut = a,
            None => break,
        }
    }

    cut
}

async fn summarize(
    to_compress: &[&Message],
    summarizer: Option<&dyn Summarizer>,
) -> (String, SummaryKind) {
    if let Some(s) = summarizer {
        let transcript = serialize_history(to_compress);
        let prompt = format!("{SUMMARIZE_PROMPT}\n\n---\n\n{transcript}");
        match tokio::time::timeout(SUMMARIZE_TIMEOUT, s.summarize(&prompt)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                return (
                    format!("[Conversation summary]\n{}", text.trim()),
                    SummaryKind::Llm,
                );
            }
            Ok(Ok(_)) => warn!("summarizer returned empty text; using statistical summary"),
            Ok(Err(e)) => warn!(error = %e, "summarizer failed; using statistical summary"),
            Err(_) => warn!("summarizer timed out; using statistical summary"),
        }
    }
    (statistical_summary(to_compress), SummaryKind::Statistical)
}

/// Serialize messages into plain text for the summarization prompt.
fn serialize_history(messages: &[&Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
            };
            let mut line = format!("{role}: {}", m.content);
            for tc in &m.tool_calls {
                line.push_str(&format!("\n[tool_call: {}({})]", tc.name, tc.arguments));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Deterministic fallback summary: role counts, tool-use frequencies and
/// fragments of the most recent user requests.
fn statistical_summary(messages: &[&Message]) -> String {
    let mut by_role: BTreeMap<&str, usize> = BTreeMap::new();
    let mut tool_uses: BTreeMap<String, usize> = BTreeMap::new();
    for m in messages {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        *by_role.entry(role).or_default() += 1;
        for tc in &m.tool_calls {
            *tool_uses.entry(tc.name.clone()).or_default() += 1;
        }
    }

    let role_counts = by_role
        .iter()
        .map(|(r, n)| format!("{n} {r}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut lines = vec![format!(
        "[Conversation summary] {} earlier messages compressed ({role_counts}).",
        messages.len()
    )];

    if !tool_uses.is_empty() {
        let mut uses: Vec<(String, usize)> = tool_uses.into_iter().collect();
        uses.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let top = uses
            .iter()
            .take(5)
            .map(|(name, n)| format!("{name} ×{n}"))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("Tools used: {top}."));
    }

    let recent_requests: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .rev()
        .take(3)
        .map(|m| {
            let fragment: String = m.content.chars().take(REQUEST_FRAGMENT_CHARS).collect();
            format!("- {fragment}")
        })
        .collect();
    if !recent_requests.is_empty() {
        lines.push("Recent user requests:".to_string());
        lines.extend(recent_requests);
    }

    lines.join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
