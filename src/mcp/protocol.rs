//! Client-side JSON-RPC 2.0 framing for MCP workers.
//!
//! Messages are newline-delimited JSON over the worker's stdin/stdout. The
//! surface is deliberately minimal: `initialize`, `notifications/initialized`,
//! `tools/list`, and `tools/call`.

use crate::errors::SessionError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2025-06-18";

pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;

/// Outgoing request. A `None` id marks a notification.
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn call(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method: method.into(),
            params: None,
        }
    }

    /// The standard session-opening handshake.
    pub fn initialize(id: u64, client_name: &str) -> Self {
        Self::call(
            id,
            "initialize",
            serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": client_name, "version": env!("CARGO_PKG_VERSION") }
            }),
        )
    }
}

/// Incoming response.
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcErrorBody {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl JsonRpcResponse {
    /// Whether this response answers request `id`.
    pub fn matches(&self, id: u64) -> bool {
        self.id
            .as_ref()
            .and_then(Value::as_u64)
            .is_some_and(|got| got == id)
    }
}

/// Result of one tool call: either an opaque payload or a worker-flagged
/// error. The payload stays opaque to the client except for the error flag.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub is_error: bool,
    /// Raw text content as returned by the worker.
    pub text: String,
}

impl CallResult {
    /// Parse the payload as JSON.
    ///
    /// A malformed payload is not fatal; it surfaces as a `SessionError` the
    /// caller degrades from, never a panic.
    pub fn parse_json(&self) -> Result<Value, SessionError> {
        serde_json::from_str(&self.text)
            .map_err(|e| SessionError::MalformedPayload(format!("{e}: {}", truncate(&self.text))))
    }
}

fn truncate(s: &str) -> String {
    const LIMIT: usize = 120;
    if s.len() <= LIMIT {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i < LIMIT)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…", &s[..cut])
    }
}

/// Extract the tool content from a `tools/call` result.
///
/// The worker returns `{"content": [{"type": "text", "text": ..., "isError": ...}]}`;
/// some servers put `isError` on the result object instead of the content
/// entry, so both spots are honored.
pub fn extract_call_result(result: &Value) -> Result<CallResult, SessionError> {
    let content = result
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| SessionError::MalformedPayload("missing content array".to_string()))?;

    let first = content
        .first()
        .ok_or_else(|| SessionError::MalformedPayload("empty content array".to_string()))?;

    let text = first
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let is_error = first
        .get("isError")
        .or_else(|| result.get("isError"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(CallResult { is_error, text })
}

/// Extract tool names from a `tools/list` result.
pub fn extract_tool_names(result: &Value) -> Vec<String> {
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
