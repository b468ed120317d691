use serde::{Deserialize, Serialize};

// ─── Wire message types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A function invocation as it appears on the wire: the arguments are the
/// raw JSON-encoded string exactly as the provider sent (or will receive) it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

/// One entry of an assistant message's `tool_calls` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallData {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

impl ToolCallData {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// A single message in wire form (the shape sent to and received from the
/// chat-completions API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallData>,
    /// Set only on role=tool messages: the id of the call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on role=tool messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: text.into(), tool_calls: vec![], tool_call_id: None, name: None }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: text.into(), tool_calls: vec![], tool_call_id: None, name: None }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: text.into(), tool_calls: vec![], tool_call_id: None, name: None }
    }

    pub fn assistant_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCallData>) -> Self {
        Self { role: Role::Assistant, content: text.into(), tool_calls, tool_call_id: None, name: None }
    }

    /// A role=tool response answering `call_id`.
    pub fn tool_response(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: Some(call_id.into()),
            name: Some(tool_name.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

/// How the model is allowed to use tools on this request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    /// Force a specific tool by name.
    Named(String),
}

impl ToolChoice {
    /// Wire value for the `tool_choice` request field.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Self::Auto => serde_json::json!("auto"),
            Self::None => serde_json::json!("none"),
            Self::Named(name) => serde_json::json!({
                "type": "function",
                "function": { "name": name }
            }),
        }
    }
}

/// Request sent to a model client.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: ToolChoice,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

/// Token usage reported by the provider.  Counts may be zero when the
/// provider omits them; callers estimate in that case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

/// A complete (non-streaming, or fully assembled) model response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

// ─── Streaming deltas ─────────────────────────────────────────────────────────

/// One incremental event from a streaming completion.
///
/// A tool-call fragment with a non-empty `id` or `name` starts a new call;
/// a fragment with both empty appends `arguments` to the call in progress.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// Incremental answer text.
    Text(String),
    /// Incremental chain-of-thought text (`reasoning_content` / `reasoning`).
    Reasoning(String),
    /// Incremental provider-generated reasoning summary.
    ReasoningSummary(String),
    /// Incremental `<think>`-channel text from models that separate it from
    /// reasoning proper.
    Think(String),
    /// Incremental tool-call fragment.
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    /// Why the model stopped (e.g. "stop", "tool_calls", "length").
    FinishReason(String),
    /// Final usage statistics.
    Usage(Usage),
    /// The stream finished normally.
    Done,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
