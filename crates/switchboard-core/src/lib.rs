//! Core types and error definitions for Switchboard.
//!
//! This crate holds everything the transports, the orchestrator and the router
//! share: the error taxonomy, agent definitions and live instances, the agent
//! registry, the tool-call envelope, and the sink interfaces used to push
//! progress and notifications toward the host application.
//!
//! # Main types
//!
//! - [`SwitchboardError`] — Failure taxonomy shared by transports, orchestrator and router.
//! - [`SwitchboardResult`] — `Result` alias over [`SwitchboardError`].
//! - [`AgentDefinition`] — Static description of an agent and its transport.
//! - [`AgentRegistry`] — Owner of every agent's live status and run counter.
//! - [`ToolCall`] / [`ToolResult`] — Envelope exchanged with the calling agent.
//! - [`ProgressSink`] / [`NotificationSink`] — Outbound collaborator interfaces.

/// Agent definitions, status model, and live instances.
pub mod agent;
/// TOML configuration schema.
pub mod config;
/// In-memory agent registry.
pub mod registry;
/// Progress and notification sink interfaces.
pub mod sinks;
/// Tool call envelope types.
pub mod tool;

pub use agent::{AgentAuth, AgentDefinition, AgentInstance, AgentStatus, TransportConfig};
pub use config::{DelegationSettings, SwitchboardConfig};
pub use registry::{AgentRegistry, RunSlot};
pub use sinks::{
    AgentProgressUpdate, NoopNotificationSink, NotificationSink, ProgressSink, ProgressStep,
    TracingProgressSink,
};
pub use tool::{ToolCall, ToolDescriptor, ToolResult};

use serde::{Deserialize, Serialize};

// --- Error types ---

/// JSON-RPC error code for "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Top-level error type for Switchboard.
///
/// Variants follow the delegation failure taxonomy: configuration problems,
/// transport failures, protocol mismatches, timeouts and cancellations are
/// kept apart so callers can render a precise message for each.
#[derive(Debug, thiserror::Error)]
pub enum SwitchboardError {
    /// Unknown or disabled agent, missing command or URL.
    #[error("Config error: {0}")]
    Config(String),

    /// Process spawn failure, broken pipe, process exit.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Structured error returned by an agent in a JSON-RPC response.
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message reported by the agent.
        message: String,
    },

    /// The agent does not implement the requested method.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// A request or call exceeded its time bound.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The caller aborted the operation.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// An HTTP-level failure (non-2xx status or network error).
    #[error("HTTP error: {0}")]
    Http(String),

    /// An error from the parallel orchestrator or delegation tracker.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchboardError {
    /// Whether this error indicates the agent speaks a different protocol.
    pub fn is_protocol_mismatch(&self) -> bool {
        match self {
            SwitchboardError::MethodNotFound(_) => true,
            SwitchboardError::Rpc { code, message } => {
                *code == METHOD_NOT_FOUND || mentions_method_not_found(message)
            }
            SwitchboardError::Transport(message) | SwitchboardError::Http(message) => {
                mentions_method_not_found(message)
            }
            _ => false,
        }
    }

    /// Whether this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SwitchboardError::Timeout(_))
    }

    /// Whether this error is a caller-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SwitchboardError::Cancelled(_))
    }
}

fn mentions_method_not_found(message: &str) -> bool {
    message.to_lowercase().contains("method not found")
}

/// A convenience `Result` alias using [`SwitchboardError`].
pub type SwitchboardResult<T> = Result<T, SwitchboardError>;

// --- Delegation output ---

/// Output produced by one successful delegation, independent of transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelegationOutput {
    /// The textual result.
    pub text: String,
    /// Transport-specific metadata (stop reason, remote run id, ...).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl DelegationOutput {
    /// Creates an output holding only text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Attaches a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
