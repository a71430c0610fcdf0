use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// How Switchboard talks to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    /// A local subprocess speaking newline-delimited JSON-RPC over stdio.
    Stdio {
        /// Executable to launch.
        command: String,
        /// Command-line arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Environment overrides merged over the inherited environment.
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// A remote service reachable over HTTP.
    Http {
        /// Base URL; `/runs` is appended for invocations.
        base_url: String,
    },
}

impl TransportConfig {
    /// Short name of the transport kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Http { .. } => "http",
        }
    }
}

/// Authentication metadata attached to HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentAuth {
    /// `Authorization: Bearer <token>`.
    Bearer {
        /// The bearer token.
        bearer_token: String,
    },
    /// An arbitrary header.
    Header {
        /// Header name.
        header: String,
        /// Header value.
        value: String,
    },
}

/// Static description of an agent. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique agent name.
    pub name: String,
    /// Human-friendly name; defaults to `name`.
    #[serde(default)]
    pub display_name: Option<String>,
    /// What the agent is good at.
    #[serde(default)]
    pub description: String,
    /// Capability tags used for discovery.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Transport configuration.
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Optional auth metadata for HTTP agents.
    #[serde(default)]
    pub auth: Option<AgentAuth>,
    /// Spawn the agent when the hub starts.
    #[serde(default)]
    pub auto_spawn: bool,
    /// Disabled agents are listed but refuse delegations.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AgentDefinition {
    /// Creates an enabled stdio agent definition.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_transport(
            name,
            TransportConfig::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
        )
    }

    /// Creates an enabled HTTP agent definition.
    pub fn http(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self::with_transport(
            name,
            TransportConfig::Http {
                base_url: base_url.into(),
            },
        )
    }

    fn with_transport(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            description: String::new(),
            capabilities: BTreeSet::new(),
            transport,
            auth: None,
            auto_spawn: false,
            enabled: true,
        }
    }

    /// Adds a capability tag.
    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.insert(tag.into());
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Display name, falling back to the agent name.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// Base URL for HTTP agents.
    pub fn base_url(&self) -> Option<&str> {
        match &self.transport {
            TransportConfig::Http { base_url } if !base_url.trim().is_empty() => Some(base_url),
            _ => None,
        }
    }

    /// Whether this agent can be spawned locally.
    pub fn is_spawnable(&self) -> bool {
        matches!(&self.transport, TransportConfig::Stdio { command, .. } if !command.trim().is_empty())
    }
}

/// Live status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Never connected.
    Disconnected,
    /// Process launched, waiting for the settle delay.
    Starting,
    /// Accepting requests.
    Ready,
    /// Accepting requests with work in flight.
    Busy,
    /// Failed; see `last_error`.
    Error,
    /// Process exited or was stopped.
    Stopped,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Disconnected => "disconnected",
            AgentStatus::Starting => "starting",
            AgentStatus::Ready => "ready",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
            AgentStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A registered agent: its definition plus mutable runtime state.
///
/// Owned by [`crate::AgentRegistry`]; callers only ever see clones.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInstance {
    /// Static configuration.
    pub definition: AgentDefinition,
    /// Current status.
    pub status: AgentStatus,
    /// Delegations currently executing on this agent.
    pub active_runs: u32,
    /// Last transition to `ready`.
    pub last_connected: Option<DateTime<Utc>>,
    /// Message from the last transition to `error`.
    pub last_error: Option<String>,
}

impl AgentInstance {
    pub(crate) fn new(definition: AgentDefinition) -> Self {
        Self {
            definition,
            status: AgentStatus::Disconnected,
            active_runs: 0,
            last_connected: None,
            last_error: None,
        }
    }

    /// Agent name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Whether requests may be sent to this agent.
    pub fn accepts_requests(&self) -> bool {
        matches!(self.status, AgentStatus::Ready | AgentStatus::Busy)
    }
}
