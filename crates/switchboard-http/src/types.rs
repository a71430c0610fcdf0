use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the remote agent should execute a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Wait for the run to finish and return the full result.
    Sync,
    /// Return immediately with a run id to poll.
    Async,
    /// Stream events over SSE until the run finishes.
    Stream,
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

/// One part of a run message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    /// MIME type; only `text/*` parts contribute to text output.
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Part body.
    #[serde(default)]
    pub content: String,
}

/// A message in a run's input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMessage {
    /// `user` for input, `agent` for output.
    #[serde(default)]
    pub role: String,
    /// Message body, in order.
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl RunMessage {
    /// A single `text/plain` part.
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            parts: vec![MessagePart {
                content_type: default_content_type(),
                content: text.into(),
            }],
        }
    }

    /// Concatenated text of every text part.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|p| p.content_type.starts_with("text/"))
            .map(|p| p.content.as_str())
            .collect()
    }
}

/// Body of `POST /runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Agent the server should run.
    pub agent_name: String,
    /// Conversation handed to the agent.
    pub input: Vec<RunMessage>,
    /// Execution mode.
    pub mode: RunMode,
}

impl RunRequest {
    /// A single user message carrying `task`, prefixed by `context` when given.
    pub fn new(agent_name: impl Into<String>, task: &str, context: Option<&str>, mode: RunMode) -> Self {
        let text = match context {
            Some(context) if !context.trim().is_empty() => format!("{context}\n\n{task}"),
            _ => task.to_string(),
        };
        Self {
            agent_name: agent_name.into(),
            input: vec![RunMessage::new("user", text)],
            mode,
        }
    }
}

/// Remote run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// Accepted, not started.
    Created,
    /// Executing.
    InProgress,
    /// Paused waiting for input.
    Awaiting,
    /// Cancellation requested, not yet settled.
    Cancelling,
    /// Finished with output.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before finishing.
    Cancelled,
    /// Missing or unrecognized status.
    #[default]
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Whether the run can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Created => "created",
            RunStatus::InProgress => "in-progress",
            RunStatus::Awaiting => "awaiting",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Result shape shared by `POST /runs`, `GET /runs/{id}` and the final
/// stream event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunResult {
    /// Server-assigned run id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Run status at the time of the response.
    #[serde(default)]
    pub status: RunStatus,
    /// Messages produced so far.
    #[serde(default)]
    pub output: Vec<RunMessage>,
    /// Error as sent by the server, string or object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Free-form server metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl RunResult {
    /// Text of every output message, one message per line.
    pub fn text(&self) -> String {
        self.output
            .iter()
            .map(RunMessage::text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The error as a display string, whether the server sent a plain string
    /// or an object with a `message`.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => Some(
                map.get("message")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
            ),
            other => Some(other.to_string()),
        }
    }
}
