// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Token estimation.  Pure arithmetic, no I/O: a fixed chars-per-token
//! divisor plus a per-message overhead for role framing and metadata.
//! Budgets built on this are deliberately conservative; ±20% is fine.

use crate::message::Message;

pub const CHARS_PER_TOKEN: usize = 4;
/// Accounts for role tags, separators and structural framing per message.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

pub fn estimate_text(s: &str) -> usize {
    (s.len() / CHARS_PER_TOKEN).max(1)
}

pub fn estimate_message(m: &Message) -> usize {
    let mut chars = m.content.len();
    for tc in &m.tool_calls {
        chars += tc.name.len();
        chars += tc.arguments.to_string().len();
    }
    for (k, v) in &m.metadata {
        chars += k.len() + v.len();
    }
    chars / CHARS_PER_TOKEN + MESSAGE_OVERHEAD_TOKENS
}

pub fn estimate_messages(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message).sum()
}

/// Estimate over wire-form messages, for request-size accounting when the
/// provider reports no usage.
pub fn estimate_wire_messages(messages: &[alex_model::ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| {
            let mut chars = m.content.len();
            for tc in &m.tool_calls {
                chars += tc.function.name.len() + tc.function.arguments.len();
            }
            chars / CHARS_PER_TOKEN + MESSAGE_OVERHEAD_TOKENS
        })
        .sum()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::ToolCallRecord;

    #[test]
    fn text_divides_by_four_with_floor_of_one() {
        assert_eq!(estimate_text("12345678"), 2);
        assert_eq!(estimate_text("ab"), 1);
        assert_eq!(estimate_text(""), 1);
    }

    #[test]
    fn message_adds_overhead() {
        // 8 chars content → 2 tokens + overhead
        let m = Message::user("12345678");
        assert_eq!(estimate_message(&m), 2 + MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn tool_calls_count_toward_estimate() {
        let plain = Message::assistant("x");
        let with_call = Message::assistant_with_tool_calls(
            "x",
            vec![ToolCallRecord {
                id: "c1".into(),
                name: "a_long_tool_name".into(),
                arguments: json!({"path": "/some/long/path/to/a/file.rs"}),
            }],
        );
        assert!(estimate_message(&with_call) > estimate_message(&plain));
    }

    #[test]
    fn list_estimate_is_sum_of_parts() {
        let msgs = vec![Message::user("aaaa"), Message::assistant("bbbb")];
        assert_eq!(
            estimate_messages(&msgs),
            estimate_message(&msgs[0]) + estimate_message(&msgs[1])
        );
    }

    #[test]
    fn empty_list_estimates_zero() {
        assert_eq!(estimate_messages(&[]), 0);
    }
}
