use crate::agent::AgentDefinition;
use crate::{SwitchboardError, SwitchboardResult};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level `switchboard.toml` schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub delegation: DelegationSettings,
}

impl SwitchboardConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> SwitchboardResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| SwitchboardError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn load(path: &Path) -> SwitchboardResult<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            SwitchboardError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&source)
    }

    fn validate(&self) -> SwitchboardResult<()> {
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(SwitchboardError::Config("Agent with empty name".into()));
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(SwitchboardError::Config(format!(
                    "Duplicate agent name '{}'",
                    agent.name
                )));
            }
        }
        Ok(())
    }
}

/// Timing knobs for delegation.
#[derive(Debug, Clone, Deserialize)]
pub struct DelegationSettings {
    /// Upper bound for a single stdio JSON-RPC request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Grace period after spawning before an agent counts as ready.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// How long `stop` waits after the terminate signal before killing.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    /// Background poll interval for asynchronous HTTP runs.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// How long terminal delegation runs are retained.
    #[serde(default = "default_retention")]
    pub run_retention_secs: u64,
    /// Upper bound for a single HTTP call.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    300
}
fn default_settle_delay() -> u64 {
    500
}
fn default_stop_grace() -> u64 {
    5
}
fn default_poll_interval() -> u64 {
    3
}
fn default_retention() -> u64 {
    3600
}
fn default_http_timeout() -> u64 {
    300
}

impl Default for DelegationSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            settle_delay_ms: default_settle_delay(),
            stop_grace_secs: default_stop_grace(),
            poll_interval_secs: default_poll_interval(),
            run_retention_secs: default_retention(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

impl DelegationSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn run_retention(&self) -> Duration {
        Duration::from_secs(self.run_retention_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
