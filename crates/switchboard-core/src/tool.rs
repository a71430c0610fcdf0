use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An action invocation coming from the calling agent, e.g.
/// `delegate_to_agent` with `{"agent_name": .., "task": ..}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Caller-chosen id echoed back in the reply.
    pub id: String,
    /// Router action name.
    pub name: String,
    /// Action arguments as sent by the caller.
    pub arguments: Value,
}

impl ToolCall {
    /// A call of action `name`.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// A string argument, trimmed. Blank strings and non-strings read as absent.
    pub fn text_arg(&self, key: &str) -> Option<String> {
        self.arguments
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    }

    /// A boolean argument; anything but a JSON bool reads as absent.
    pub fn flag_arg(&self, key: &str) -> Option<bool> {
        self.arguments.get(key).and_then(Value::as_bool)
    }
}

/// What the router hands back to the calling agent. `content` is a JSON
/// document on success and a plain sentence on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Id of the call being answered.
    pub call_id: String,
    /// Reply body.
    pub content: String,
    /// Set when the action failed.
    pub is_error: bool,
}

impl ToolResult {
    /// A successful reply carrying `payload` as JSON text.
    pub fn reply(call_id: impl Into<String>, payload: Value) -> Self {
        Self {
            call_id: call_id.into(),
            content: payload.to_string(),
            is_error: false,
        }
    }

    /// A failed reply with a message meant for the calling agent.
    pub fn error(call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: message.into(),
            is_error: true,
        }
    }

    /// The JSON payload of a successful reply.
    pub fn payload(&self) -> Option<Value> {
        if self.is_error {
            return None;
        }
        serde_json::from_str(&self.content).ok()
    }
}

/// Name and argument schema of one router action, as advertised to the
/// calling agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Action name used in [`ToolCall::name`].
    pub name: String,
    /// When the calling agent should pick this action.
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters_schema: Value,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_arg_trims_and_skips_blank() {
        let call = ToolCall::new(
            "1",
            "delegate_to_agent",
            json!({"task": "  ", "agent_name": " coder ", "n": 3}),
        );
        assert_eq!(call.text_arg("task"), None);
        assert_eq!(call.text_arg("agent_name").as_deref(), Some("coder"));
        assert_eq!(call.text_arg("n"), None);
        assert_eq!(call.text_arg("missing"), None);
    }

    #[test]
    fn test_flag_arg_only_accepts_bools() {
        let call = ToolCall::new("1", "x", json!({"wait": false, "other": "false"}));
        assert_eq!(call.flag_arg("wait"), Some(false));
        assert_eq!(call.flag_arg("other"), None);
    }

    #[test]
    fn test_reply_payload() {
        let reply = ToolResult::reply("call_1", json!({"run_id": "r-1", "status": "running"}));
        assert!(!reply.is_error);
        assert_eq!(reply.payload().unwrap()["run_id"], "r-1");

        let failed = ToolResult::error("call_1", "Unknown agent 'ghost'");
        assert!(failed.is_error);
        assert_eq!(failed.call_id, "call_1");
        assert!(failed.payload().is_none());
    }
}
