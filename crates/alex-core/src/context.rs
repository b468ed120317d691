// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context management: decides when the compressor runs, caches its output
//! by input fingerprint so repeated loop iterations skip recomputation, and
//! exposes statistics and a quality score over a message list.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use tracing::debug;

use alex_config::ContextConfig;
use alex_model::{ChatMessage, CompletionRequest, LlmClient, Role};

use crate::compress::{compress, needs_compression, CompressionConfig, Summarizer};
use crate::estimate::estimate_messages;
use crate::message::Message;

/// Statistics over a message list, for status displays and tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub total: usize,
    pub system: usize,
    pub user: usize,
    pub assistant: usize,
    pub tool: usize,
    pub summaries: usize,
    pub estimated_tokens: usize,
}

struct CacheEntry {
    at: Instant,
    messages: Vec<Message>,
    compressed: bool,
}

/// Wraps the compressor with caching and scoring.
pub struct ContextManager {
    compression: CompressionConfig,
    token_budget: usize,
    cache_ttl: Duration,
    summarizer: Option<Arc<dyn Summarizer>>,
    cache: Mutex<LruCache<u64, CacheEntry>>,
}

impl ContextManager {
    pub fn new(cfg: &ContextConfig) -> Self {
        let capacity = NonZeroUsize::new(cfg.cache_capacity.max(1)).expect("nonzero");
        Self {
            compression: CompressionConfig::from(cfg),
            token_budget: cfg.token_budget,
            cache_ttl: Duration::from_secs(cfg.cache_ttl_secs),
            summarizer: None,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn needs_compression(&self, messages: &[Message]) -> bool {
        needs_compression(messages, &self.compression)
    }

    /// Return an optimized view of `messages` (and whether compression
    /// actually ran).  Results are cached by (session, content fingerprint)
    /// with a wall-clock expiry; a hit returns exactly what the fresh
    /// computation produced for the same input.
    pub async fn optimize(&self, session_id: &str, messages: &[Message]) -> (Vec<Message>, bool) {
        let key = fingerprint(session_id, messages);
        if let Some(hit) = self.cache_lookup(key) {
            debug!(session_id, "context cache hit");
            return hit;
        }

        let result = compress(messages, &self.compression, self.summarizer.as_deref()).await;
        let value = (result.messages.clone(), result.compressed);
        self.cache.lock().unwrap().put(
            key,
            CacheEntry {
                at: Instant::now(),
                messages: result.messages,
                compressed: result.compressed,
            },
        );
        value
    }

    fn cache_lookup(&self, key: u64) -> Option<(Vec<Message>, bool)> {
        let mut cache = self.cache.lock().unwrap();
        let expired = match cache.get(&key) {
            Some(entry) if entry.at.elapsed() < self.cache_ttl => {
                return Some((entry.messages.clone(), entry.compressed));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(&key);
        }
        None
    }

    pub fn stats(&self, messages: &[Message]) -> ContextStats {
        let mut stats = ContextStats {
            total: messages.len(),
            estimated_tokens: estimate_messages(messages),
            ..Default::default()
        };
        for m in messages {
            match m.role {
                Role::System => stats.system += 1,
                Role::User => stats.user += 1,
                Role::Assistant => stats.assistant += 1,
                Role::Tool => stats.tool += 1,
            }
            if m.is_summary() {
                stats.summaries += 1;
            }
        }
        stats
    }

    /// Composite quality score in 0..=1 over four signals:
    /// headroom under the token budget, information density (messages
    /// carrying code, errors, or tool traffic), freshness (mean message
    /// age), and coherence (keyword overlap between adjacent messages).
    pub fn quality_score(&self, messages: &[Message]) -> f64 {
        if messages.is_empty() {
            return 1.0;
        }
        let utilization = {
            let ratio = estimate_messages(messages) as f64 / self.token_budget.max(1) as f64;
            (1.0 - ratio).clamp(0.0, 1.0)
        };
        let density = {
            let informative = messages
                .iter()
                .filter(|m| {
                    !m.tool_calls.is_empty()
                        || m.role == Role::Tool
                        || m.content.contains("```")
                        || m.content.to_lowercase().contains("error")
                })
                .count();
            informative as f64 / messages.len() as f64
        };
        let freshness = {
            let now = chrono::Utc::now();
            let ages: Vec<f64> = messages
                .iter()
                .map(|m| (now - m.timestamp).num_milliseconds().max(0) as f64)
                .collect();
            let max_age = ages.iter().cloned().fold(0.0_f64, f64::max);
            if max_age == 0.0 {
                1.0
            } else {
                let mean_age = ages.iter().sum::<f64>() / ages.len() as f64;
                1.0 - (mean_age / max_age)
            }
        };
        let coherence = adjacent_overlap(messages);

        (0.25 * utilization + 0.25 * density + 0.25 * freshness + 0.25 * coherence).clamp(0.0, 1.0)
    }
}

/// Mean Jaccard word overlap between adjacent message pairs.
fn adjacent_overlap(messages: &[Message]) -> f64 {
    if messages.len() < 2 {
        return 1.0;
    }
    let keyword_sets: Vec<HashSet<String>> = messages.iter().map(|m| keywords(&m.content)).collect();
    let mut total = 0.0;
    let mut pairs = 0usize;
    for pair in keyword_sets.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.is_empty() && b.is_empty() {
            continue;
        }
        let intersection = a.intersection(b).count() as f64;
        let union = a.union(b).count() as f64;
        total += intersection / union;
        pairs += 1;
    }
    if pairs == 0 {
        0.0
    } else {
        total / pairs as f64
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() > 3)
        .map(str::to_lowercase)
        .collect()
}

fn fingerprint(session_id: &str, messages: &[Message]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    session_id.hash(&mut hasher);
    messages.len().hash(&mut hasher);
    for m in messages {
        (m.role as u8).hash(&mut hasher);
        m.content.hash(&mut hasher);
        for tc in &m.tool_calls {
            tc.id.hash(&mut hasher);
            tc.name.hash(&mut hasher);
        }
        if let Some(id) = m.tool_call_id() {
            id.hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Summarizer backed by the model client: one tool-free completion over
/// the serialized transcript.
pub struct LlmSummarizer {
    client: Arc<dyn LlmClient>,
    model: String,
}

impl LlmSummarizer {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self { client, model: model.into() }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, transcript: &str) -> anyhow::Result<String> {
        let req = CompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::user(transcript)],
            ..Default::default()
        };
        let resp = self.client.chat(req).await?;
        if resp.message.content.trim().is_empty() {
            anyhow::bail!("summarizer produced empty content");
        }
        Ok(resp.message.content)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ContextConfig {
        ContextConfig::default()
    }

    fn big_history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message::user(format!("message {i}: {}", "x".repeat(8_000))))
            .collect()
    }

    #[tokio::test]
    async fn optimize_passes_small_history_through() {
        let cm = ContextManager::new(&cfg());
        let msgs = vec![Message::user("hi")];
        let (out, compressed) = cm.optimize("s1", &msgs).await;
        assert!(!compressed);
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn optimize_compresses_large_history() {
        let cm = ContextManager::new(&cfg());
        let msgs = big_history(80);
        let (out, compressed) = cm.optimize("s1", &msgs).await;
        assert!(compressed);
        assert!(out.len() < msgs.len());
    }

    #[tokio::test]
    async fn cache_hit_equals_fresh_computation() {
        let cm = ContextManager::new(&cfg());
        let msgs = big_history(80);
        let (first, _) = cm.optimize("s1", &msgs).await;
        let (second, _) = cm.optimize("s1", &msgs).await;
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.role, b.role);
            assert_eq!(a.content, b.content);
        }
    }

    #[tokio::test]
    async fn different_input_misses_cache() {
        let cm = ContextManager::new(&cfg());
        let msgs = big_history(80);
        let (first, _) = cm.optimize("s1", &msgs).await;
        let mut more = msgs.clone();
        more.push(Message::user("one more"));
        let (second, _) = cm.optimize("s1", &more).await;
        assert!(second.iter().any(|m| m.content == "one more"));
        assert!(first.iter().all(|m| m.content != "one more"));
    }

    #[tokio::test]
    async fn expired_cache_entry_recomputes() {
        let mut config = cfg();
        config.cache_ttl_secs = 0;
        let cm = ContextManager::new(&config);
        let msgs = big_history(80);
        let _ = cm.optimize("s1", &msgs).await;
        // TTL of zero: every lookup is already expired but must still
        // produce a correct (recomputed) result.
        let (out, compressed) = cm.optimize("s1", &msgs).await;
        assert!(compressed);
        assert!(!out.is_empty());
    }

    #[test]
    fn stats_counts_roles_and_summaries() {
        let cm = ContextManager::new(&cfg());
        let msgs = vec![
            Message::system("s"),
            Message::user("u"),
            Message::assistant("a"),
            Message::tool_response("c1", "t", "out"),
            Message::system("sum").with_meta(crate::message::META_TYPE, "llm_summary"),
        ];
        let stats = cm.stats(&msgs);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.system, 2);
        assert_eq!(stats.user, 1);
        assert_eq!(stats.assistant, 1);
        assert_eq!(stats.tool, 1);
        assert_eq!(stats.summaries, 1);
        assert!(stats.estimated_tokens > 0);
    }

    #[test]
    fn quality_score_is_bounded() {
        let cm = ContextManager::new(&cfg());
        assert_eq!(cm.quality_score(&[]), 1.0);
        let msgs = vec![
            Message::user("please fix the parser error in src/parser.rs"),
            Message::assistant("looking at the parser error now ```rust\nfn x(){}\n```"),
        ];
        let score = cm.quality_score(&msgs);
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn related_messages_score_higher_coherence() {
        let related = vec![
            Message::user("refactor the streaming parser module"),
            Message::assistant("the streaming parser module now handles fragments"),
        ];
        let unrelated = vec![
            Message::user("refactor the streaming parser module"),
            Message::assistant("tomorrow looks sunny with gentle wind"),
        ];
        assert!(adjacent_overlap(&related) > adjacent_overlap(&unrelated));
    }

    #[test]
    fn fingerprint_is_stable_and_input_sensitive() {
        let msgs = vec![Message::user("hello")];
        assert_eq!(fingerprint("s", &msgs), fingerprint("s", &msgs));
        assert_ne!(fingerprint("s", &msgs), fingerprint("other", &msgs));
        let changed = vec![Message::user("hello!")];
        assert_ne!(fingerprint("s", &msgs), fingerprint("s", &changed));
    }
}
