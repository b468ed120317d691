use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use alex_model::Role;

/// Metadata key holding the answered call id on role=tool messages.
pub const META_TOOL_CALL_ID: &str = "tool_call_id";
/// Metadata key holding the tool name on role=tool messages.
pub const META_TOOL_NAME: &str = "tool_name";
/// Metadata key classifying special messages (`llm_summary`,
/// `statistical_summary`, `memory_context`, …).
pub const META_TYPE: &str = "type";
/// Metadata key recording whether the tool call behind a tool message
/// succeeded ("true"/"false").
pub const META_TOOL_SUCCESS: &str = "tool_success";

/// One tool invocation recorded on an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    /// Decoded argument object.  When the model produced unparseable JSON
    /// the raw text is kept as a string value so nothing is lost.
    pub arguments: Value,
}

/// The session-form message: the universal unit of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Self {
        let mut m = Self::new(Role::Assistant, content);
        m.tool_calls = tool_calls;
        m
    }

    /// A tool response answering `call_id`.  The id and tool name live in
    /// metadata; the converter promotes them to wire fields.
    pub fn tool_response(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(Role::Tool, content)
            .with_meta(META_TOOL_CALL_ID, call_id)
            .with_meta(META_TOOL_NAME, tool_name)
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The call id this tool message answers, if any.
    pub fn tool_call_id(&self) -> Option<&str> {
        self.metadata.get(META_TOOL_CALL_ID).map(String::as_str)
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.metadata.get(META_TOOL_NAME).map(String::as_str)
    }

    pub fn meta_type(&self) -> Option<&str> {
        self.metadata.get(META_TYPE).map(String::as_str)
    }

    /// True for compression products (`metadata.type` ending in "summary").
    pub fn is_summary(&self) -> bool {
        self.meta_type().map(|t| t.ends_with("summary")).unwrap_or(false)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
        assert_eq!(Message::tool_response("c", "t", "o").role, Role::Tool);
    }

    #[test]
    fn tool_response_metadata_is_populated() {
        let m = Message::tool_response("call-1", "file_read", "hello");
        assert_eq!(m.tool_call_id(), Some("call-1"));
        assert_eq!(m.tool_name(), Some("file_read"));
    }

    #[test]
    fn summary_detection_matches_suffix() {
        let m = Message::system("…").with_meta(META_TYPE, "llm_summary");
        assert!(m.is_summary());
        let m = Message::system("…").with_meta(META_TYPE, "statistical_summary");
        assert!(m.is_summary());
        let m = Message::system("…").with_meta(META_TYPE, "memory_context");
        assert!(!m.is_summary());
        assert!(!Message::system("plain").is_summary());
    }

    #[test]
    fn serde_round_trip_preserves_everything() {
        let m = Message::assistant_with_tool_calls(
            "running",
            vec![ToolCallRecord {
                id: "c1".into(),
                name: "shell".into(),
                arguments: json!({"command": "ls"}),
            }],
        )
        .with_meta("custom", "x");
        let s = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&s).unwrap();
        assert_eq!(back.role, Role::Assistant);
        assert_eq!(back.tool_calls, m.tool_calls);
        assert_eq!(back.metadata.get("custom").map(String::as_str), Some("x"));
    }

    #[test]
    fn empty_collections_are_omitted_from_json() {
        let s = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(!s.contains("tool_calls"));
        assert!(!s.contains("metadata"));
    }
}
