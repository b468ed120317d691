// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! JSON-RPC 2.0 message types for the MCP wire protocol.
//!
//! Requests carry monotonically increasing integer ids; responses are
//! correlated back to their request by that id.  Notifications carry no id
//! and expect no reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol version sent in the `initialize` handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: i64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    /// Servers may reply with a number or a string; keep the raw value and
    /// normalize through [`JsonRpcResponse::id_i64`].
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The response id as an integer, accepting numeric strings.
    pub fn id_i64(&self) -> Option<i64> {
        match &self.id {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Unwrap the result payload, converting a JSON-RPC error object into a
    /// Rust error.
    pub fn into_result(self) -> Result<Value, crate::TransportError> {
        if let Some(err) = self.error {
            return Err(crate::TransportError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// An incoming frame, classified for routing.
#[derive(Debug)]
pub enum Frame {
    /// A response to one of our requests (has an id and a result or error).
    Response(JsonRpcResponse),
    /// Anything else: server-side notifications and requests.  Forwarded
    /// verbatim on the transport's message stream.
    Other(Vec<u8>),
}

/// Classify a raw frame.  Returns `Err` for unparseable payloads — callers
/// log and skip those; they must never corrupt correlation state.
pub fn classify_frame(raw: &[u8]) -> Result<Frame, serde_json::Error> {
    let v: Value = serde_json::from_slice(raw)?;
    let has_id = v.get("id").map(|id| !id.is_null()).unwrap_or(false);
    let is_reply = v.get("result").is_some() || v.get("error").is_some();
    if has_id && is_reply {
        let resp: JsonRpcResponse = serde_json::from_value(v)?;
        Ok(Frame::Response(resp))
    } else {
        Ok(Frame::Other(raw.to_vec()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
