// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Lossless bidirectional mapping between session-form [`Message`]s and the
//! wire-form [`ChatMessage`]s sent to model providers.
//!
//! The converter fails only when a required field is missing (a tool
//! message without a call id); it never silently drops data.

use alex_model::{ChatMessage, Role, ToolCallData};
use serde_json::Value;

use crate::message::{Message, ToolCallRecord};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("tool message at index {0} has no tool_call_id metadata")]
    MissingToolCallId(usize),
}

/// Render a tool-call record's arguments as the wire JSON string.
///
/// A string value is passed through raw: it holds argument text that never
/// parsed as JSON, and re-quoting it would corrupt the round trip.
fn arguments_to_wire(args: &Value) -> String {
    match args {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// Decode wire argument text into the session-form value.  Unparseable
/// text is preserved as a string value.
fn arguments_from_wire(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Convert one session message to wire form.
pub fn message_to_wire(index: usize, m: &Message) -> Result<ChatMessage, ConversionError> {
    let tool_calls: Vec<ToolCallData> = m
        .tool_calls
        .iter()
        .map(|tc| ToolCallData::function(tc.id.clone(), tc.name.clone(), arguments_to_wire(&tc.arguments)))
        .collect();

    let (tool_call_id, name) = if m.role == Role::Tool {
        let id = m
            .tool_call_id()
            .ok_or(ConversionError::MissingToolCallId(index))?;
        (Some(id.to_string()), m.tool_name().map(str::to_string))
    } else {
        (None, None)
    };

    Ok(ChatMessage {
        role: m.role,
        content: m.content.clone(),
        tool_calls,
        tool_call_id,
        name,
    })
}

/// Convert an ordered message list to wire form.
pub fn to_wire(messages: &[Message]) -> Result<Vec<ChatMessage>, ConversionError> {
    messages
        .iter()
        .enumerate()
        .map(|(i, m)| message_to_wire(i, m))
        .collect()
}

/// Like [`to_wire`] but drops role=system entries.  Used when re-injecting
/// a history whose system prompt is supplied externally.
pub fn to_wire_without_system(messages: &[Message]) -> Result<Vec<ChatMessage>, ConversionError> {
    messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role != Role::System)
        .map(|(i, m)| message_to_wire(i, m))
        .collect()
}

/// Convert a wire message back to session form, demoting the wire
/// `tool_call_id`/`name` fields into metadata.
pub fn from_wire(m: &ChatMessage) -> Message {
    let mut out = match m.role {
        Role::System => Message::system(m.content.clone()),
        Role::User => Message::user(m.content.clone()),
        Role::Assistant => Message::assistant_with_tool_calls(
            m.content.clone(),
            m.tool_calls
                .iter()
                .map(|tc| ToolCallRecord {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    arguments: arguments_from_wire(&tc.function.arguments),
                })
                .collect(),
        ),
        Role::Tool => Message::tool_response(
            m.tool_call_id.clone().unwrap_or_default(),
            m.name.clone().unwrap_or_default(),
            m.content.clone(),
        ),
    };
    if m.role == Role::Tool && m.name.is_none() {
        out.metadata.remove(crate::message::META_TOOL_NAME);
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn text_messages_convert_both_ways() {
        let session = vec![
            Message::system("sys"),
            Message::user("question"),
            Message::assistant("answer"),
        ];
        let wire = to_wire(&session).unwrap();
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0].role, Role::System);
        assert_eq!(wire[1].content, "question");

        let back = from_wire(&wire[2]);
        assert_eq!(back.role, Role::Assistant);
        assert_eq!(back.content, "answer");
    }

    #[test]
    fn tool_call_records_become_wire_tool_calls() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRecord {
                id: "c1".into(),
                name: "grep".into(),
                arguments: json!({"pattern": "x"}),
            }],
        );
        let wire = message_to_wire(0, &m).unwrap();
        assert_eq!(wire.tool_calls.len(), 1);
        assert_eq!(wire.tool_calls[0].id, "c1");
        assert_eq!(wire.tool_calls[0].kind, "function");
        assert_eq!(wire.tool_calls[0].function.arguments, r#"{"pattern":"x"}"#);
    }

    #[test]
    fn tool_message_promotes_metadata_to_wire_fields() {
        let m = Message::tool_response("c9", "file_read", "contents");
        let wire = message_to_wire(0, &m).unwrap();
        assert_eq!(wire.role, Role::Tool);
        assert_eq!(wire.tool_call_id.as_deref(), Some("c9"));
        assert_eq!(wire.name.as_deref(), Some("file_read"));
    }

    #[test]
    fn tool_message_without_call_id_is_an_error() {
        let mut m = Message::tool_response("c9", "t", "x");
        m.metadata.remove(crate::message::META_TOOL_CALL_ID);
        let err = to_wire(&[Message::user("q"), m]).unwrap_err();
        assert!(matches!(err, ConversionError::MissingToolCallId(1)));
    }

    #[test]
    fn wire_tool_message_demotes_id_into_metadata() {
        let wire = ChatMessage::tool_response("c3", "shell", "done");
        let back = from_wire(&wire);
        assert_eq!(back.tool_call_id(), Some("c3"));
        assert_eq!(back.tool_name(), Some("shell"));
    }

    #[test]
    fn round_trip_preserves_tool_arguments() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRecord {
                id: "c1".into(),
                name: "write".into(),
                arguments: json!({"path": "/tmp/x", "content": "hello\nworld"}),
            }],
        );
        let wire = message_to_wire(0, &m).unwrap();
        let back = from_wire(&wire);
        assert_eq!(back.tool_calls, m.tool_calls);
    }

    #[test]
    fn invalid_json_arguments_survive_round_trip_as_string() {
        let wire = ChatMessage::assistant_with_tool_calls(
            "",
            vec![alex_model::ToolCallData::function("c1", "t", "{broken")],
        );
        let session = from_wire(&wire);
        assert_eq!(session.tool_calls[0].arguments, Value::String("{broken".into()));
        let rewire = message_to_wire(0, &session).unwrap();
        assert_eq!(rewire.tool_calls[0].function.arguments, "{broken");
    }

    #[test]
    fn empty_wire_arguments_decode_to_empty_object() {
        let wire = ChatMessage::assistant_with_tool_calls(
            "",
            vec![alex_model::ToolCallData::function("c1", "t", "")],
        );
        let session = from_wire(&wire);
        assert_eq!(session.tool_calls[0].arguments, json!({}));
    }

    #[test]
    fn filter_variant_drops_system_only() {
        let msgs = vec![
            Message::system("sys"),
            Message::user("u"),
            Message::system("sys2"),
            Message::assistant("a"),
        ];
        let wire = to_wire_without_system(&msgs).unwrap();
        assert_eq!(wire.len(), 2);
        assert!(wire.iter().all(|m| m.role != Role::System));
    }
}
