// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Human-facing rendering of tool calls and results.
//!
//! Truncation counts characters, not bytes: a cut through the middle of a
//! multibyte codepoint would panic on slicing and garble terminal output.

use serde_json::Value;

/// Truncate `s` to at most `max_chars` characters, appending `"..."` when
/// anything was removed.  The result is therefore at most `max_chars + 3`
/// characters and never splits a codepoint.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Render a call as `name(key=value, key=value)` with each string value
/// truncated for display.
pub fn format_tool_call(name: &str, args: &Value, value_cap: usize) -> String {
    let rendered = match args.as_object() {
        Some(map) if !map.is_empty() => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            keys.iter()
                .map(|k| {
                    let v = &map[k.as_str()];
                    let shown = match v {
                        Value::String(s) => truncate_chars(s, value_cap),
                        other => truncate_chars(&other.to_string(), value_cap),
                    };
                    format!("{k}={shown}")
                })
                .collect::<Vec<_>>()
                .join(", ")
        }
        _ => String::new(),
    };
    format!("{name}({rendered})")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
