//! JSON-RPC 2.0 message types and Agent Client Protocol payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::{SwitchboardError, METHOD_NOT_FOUND};

/// Method names used by the handshake and prompt flow.
pub mod methods {
    /// Capability negotiation.
    pub const INITIALIZE: &str = "initialize";
    /// Opens a conversation session.
    pub const SESSION_NEW: &str = "session/new";
    /// Runs one prompt turn.
    pub const SESSION_PROMPT: &str = "session/prompt";
    /// Streamed turn output (notification).
    pub const SESSION_UPDATE: &str = "session/update";
}

/// Protocol version offered during `initialize`.
pub const PROTOCOL_VERSION: u64 = 1;

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Correlates the response.
    pub id: u64,
    /// Method to invoke.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// A request with the given id.
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no `id`).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Notification method.
    pub method: String,
    /// Notification parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// A notification for `method`.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Extra error detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Map a structured agent error onto the delegation error taxonomy.
    pub fn into_error(self) -> SwitchboardError {
        if self.code == METHOD_NOT_FOUND {
            SwitchboardError::MethodNotFound(self.message)
        } else {
            SwitchboardError::Rpc {
                code: self.code,
                message: self.message,
            }
        }
    }
}

/// A content block exchanged in prompts and session updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default, rename = "toolUseId", alias = "tool_use_id")]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default, rename = "isError", alias = "is_error")]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Parsed `session/update` notification payload.
///
/// Accepts both a flat `content` array and the nested `update.content` block
/// some agents emit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionUpdate {
    /// Session the update belongs to, if the agent said.
    pub session_id: Option<String>,
    /// Content carried by this update.
    pub content: Vec<ContentBlock>,
    /// The agent marked the turn finished.
    pub is_complete: bool,
    /// Why the turn stopped, when reported.
    pub stop_reason: Option<String>,
}

impl SessionUpdate {
    /// Lenient parse; unknown blocks are dropped.
    pub fn from_params(params: &Value) -> Self {
        let mut content = parse_blocks(params.get("content"));
        if let Some(update) = params.get("update") {
            content.extend(parse_blocks(update.get("content")));
        }
        Self {
            session_id: params
                .get("sessionId")
                .and_then(Value::as_str)
                .map(String::from),
            content,
            is_complete: params
                .get("isComplete")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            stop_reason: params
                .get("stopReason")
                .and_then(Value::as_str)
                .map(String::from),
        }
    }
}

fn parse_blocks(value: Option<&Value>) -> Vec<ContentBlock> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        Some(item @ Value::Object(_)) => serde_json::from_value(item.clone())
            .ok()
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

/// Notifications an agent may send, keyed by method.
#[derive(Debug, Clone, PartialEq)]
pub enum AcpNotification {
    /// Streamed turn output.
    SessionUpdate(SessionUpdate),
    /// Anything else, passed through untouched.
    Unknown { method: String, params: Value },
}

impl AcpNotification {
    /// Decode by method name.
    pub fn from_parts(method: &str, params: Value) -> Self {
        match method {
            methods::SESSION_UPDATE => AcpNotification::SessionUpdate(SessionUpdate::from_params(&params)),
            _ => AcpNotification::Unknown {
                method: method.to_string(),
                params,
            },
        }
    }

    /// The notification method name.
    pub fn method(&self) -> &str {
        match self {
            AcpNotification::SessionUpdate(_) => methods::SESSION_UPDATE,
            AcpNotification::Unknown { method, .. } => method,
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// A reply to one of our requests. `id` is `None` when the echoed id is
    /// not one this client could have issued.
    Response {
        id: Option<u64>,
        outcome: Result<Value, JsonRpcError>,
    },
    /// A request initiated by the agent.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// A notification from the agent.
    Notification(AcpNotification),
    /// Not a JSON-RPC 2.0 frame.
    Invalid(Value),
}

impl IncomingMessage {
    /// Sort a decoded frame into response, request or notification.
    pub fn classify(value: Value) -> Self {
        let mut map = match value {
            Value::Object(map) => map,
            other => return IncomingMessage::Invalid(other),
        };
        let id = map.remove("id").filter(|id| !id.is_null());
        let method = map
            .get("method")
            .and_then(Value::as_str)
            .map(String::from);
        let is_reply = map.contains_key("result") || map.contains_key("error");

        match (id, method) {
            (Some(id), Some(method)) if !is_reply => IncomingMessage::Request {
                id,
                method,
                params: map.remove("params").unwrap_or(Value::Null),
            },
            (Some(id), _) => {
                let outcome = match map.remove("error") {
                    Some(error) if !error.is_null() => {
                        Err(serde_json::from_value(error.clone()).unwrap_or_else(|_| JsonRpcError {
                            code: -32603,
                            message: error.to_string(),
                            data: None,
                        }))
                    }
                    _ => Ok(map.remove("result").unwrap_or(Value::Null)),
                };
                IncomingMessage::Response {
                    id: numeric_id(&id),
                    outcome,
                }
            }
            (None, Some(method)) => {
                let params = map.remove("params").unwrap_or(Value::Null);
                IncomingMessage::Notification(AcpNotification::from_parts(&method, params))
            }
            (None, None) => IncomingMessage::Invalid(Value::Object(map)),
        }
    }
}

fn numeric_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
