use crate::agent::{AgentDefinition, AgentInstance, AgentStatus};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A status transition observed by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
    /// Agent whose status changed.
    pub agent: String,
    /// New status.
    pub status: AgentStatus,
    /// Error recorded with the change.
    pub error: Option<String>,
}

/// Catalog of known agents and the single writer of their runtime state.
///
/// Transports and the orchestrator request transitions through the mutator
/// methods; nothing else writes instance fields. Operations on unknown agent
/// names are logged no-ops so status churn never fails a caller mid-flow.
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentInstance>>>,
    changes: broadcast::Sender<StatusChange>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    /// Register or replace an agent definition.
    ///
    /// Replacing resets the runtime state of the previous instance.
    pub fn register(&self, definition: AgentDefinition) {
        let name = definition.name.clone();
        let previous = self
            .agents
            .write()
            .insert(name.clone(), AgentInstance::new(definition));
        if previous.is_some() {
            info!(agent = %name, "Replaced agent definition");
        } else {
            info!(agent = %name, "Registered agent");
        }
    }

    /// Bulk-register definitions loaded from configuration.
    pub fn load_from_config(&self, definitions: Vec<AgentDefinition>) {
        let count = definitions.len();
        for definition in definitions {
            self.register(definition);
        }
        info!(count, "Agents loaded from config");
    }

    /// Remove an agent. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.agents.write().remove(name).is_some();
        if removed {
            info!(agent = %name, "Unregistered agent");
        } else {
            debug!(agent = %name, "Unregister requested for unknown agent");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<AgentInstance> {
        self.agents.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.read().contains_key(name)
    }

    /// All agents, sorted by name.
    pub fn list(&self) -> Vec<AgentInstance> {
        let mut all: Vec<AgentInstance> = self.agents.read().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Agents advertising the given capability tag.
    pub fn list_by_capability(&self, tag: &str) -> Vec<AgentInstance> {
        self.list()
            .into_iter()
            .filter(|a| a.definition.capabilities.contains(tag))
            .collect()
    }

    /// Agents whose status is `ready`.
    pub fn list_ready(&self) -> Vec<AgentInstance> {
        self.list()
            .into_iter()
            .filter(|a| a.status == AgentStatus::Ready)
            .collect()
    }

    /// Transition an agent's status.
    ///
    /// `ready` clears the last error and stamps `last_connected`; `error`
    /// records the supplied message. An agent asked to be `ready` while it
    /// has runs in flight lands on `busy`.
    pub fn set_status(&self, name: &str, status: AgentStatus, error: Option<String>) {
        let status = {
            let mut agents = self.agents.write();
            let Some(instance) = agents.get_mut(name) else {
                warn!(agent = %name, status = %status, "Status update for unknown agent");
                return;
            };
            instance.status = status;
            match status {
                AgentStatus::Ready => {
                    instance.last_error = None;
                    instance.last_connected = Some(Utc::now());
                }
                AgentStatus::Error => {
                    instance.last_error = error.clone();
                }
                _ => {}
            }
            follow_run_count(instance).unwrap_or(status)
        };
        debug!(agent = %name, status = %status, "Agent status changed");
        let _ = self.changes.send(StatusChange {
            agent: name.to_string(),
            status,
            error,
        });
    }

    pub fn increment_active_runs(&self, name: &str) {
        let flipped = match self.agents.write().get_mut(name) {
            Some(instance) => {
                instance.active_runs += 1;
                follow_run_count(instance)
            }
            None => {
                warn!(agent = %name, "Run started on unknown agent");
                None
            }
        };
        announce(&self.changes, name, flipped);
    }

    /// Decrement the run counter, flooring at zero.
    pub fn decrement_active_runs(&self, name: &str) {
        let flipped = match self.agents.write().get_mut(name) {
            Some(instance) => release_run(instance),
            None => {
                warn!(agent = %name, "Run finished on unknown agent");
                None
            }
        };
        announce(&self.changes, name, flipped);
    }

    /// Increment the run counter and return a guard that decrements it on drop.
    pub fn begin_run(&self, name: &str) -> RunSlot {
        self.increment_active_runs(name);
        RunSlot {
            agents: self.agents.clone(),
            changes: self.changes.clone(),
            name: name.to_string(),
        }
    }

    /// Subscribe to status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `ready` with runs in flight becomes `busy`; `busy` with none goes back
/// to `ready`. Returns the new status when it flipped.
fn follow_run_count(instance: &mut AgentInstance) -> Option<AgentStatus> {
    let next = match (instance.status, instance.active_runs) {
        (AgentStatus::Ready, n) if n > 0 => AgentStatus::Busy,
        (AgentStatus::Busy, 0) => AgentStatus::Ready,
        _ => return None,
    };
    instance.status = next;
    Some(next)
}

fn release_run(instance: &mut AgentInstance) -> Option<AgentStatus> {
    instance.active_runs = instance.active_runs.saturating_sub(1);
    follow_run_count(instance)
}

fn announce(changes: &broadcast::Sender<StatusChange>, name: &str, flipped: Option<AgentStatus>) {
    if let Some(status) = flipped {
        debug!(agent = %name, status = %status, "Agent status follows run count");
        let _ = changes.send(StatusChange {
            agent: name.to_string(),
            status,
            error: None,
        });
    }
}

/// Holds one unit of an agent's `active_runs` counter.
pub struct RunSlot {
    agents: Arc<RwLock<HashMap<String, AgentInstance>>>,
    changes: broadcast::Sender<StatusChange>,
    name: String,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        let flipped = self
            .agents
            .write()
            .get_mut(&self.name)
            .and_then(release_run);
        announce(&self.changes, &self.name, flipped);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn registry_with(names: &[&str]) -> AgentRegistry {
        let registry = AgentRegistry::new();
        for name in names {
            registry.register(AgentDefinition::stdio(*name, "agent-bin", vec![]));
        }
        registry
    }

    #[test]
    fn test_register_and_get() {
        let registry = registry_with(&["alpha"]);
        let agent = registry.get("alpha").unwrap();
        assert_eq!(agent.status, AgentStatus::Disconnected);
        assert_eq!(agent.active_runs, 0);
        assert!(registry.get("beta").is_none());
    }

    #[test]
    fn test_register_replaces_existing() {
        let registry = registry_with(&["alpha"]);
        registry.set_status("alpha", AgentStatus::Ready, None);
        registry.register(AgentDefinition::http("alpha", "http://localhost:1"));
        let agent = registry.get("alpha").unwrap();
        assert_eq!(agent.status, AgentStatus::Disconnected);
        assert_eq!(agent.definition.base_url(), Some("http://localhost:1"));
        assert_eq!(registry.agent_count(), 1);
    }

    #[test]
    fn test_unregister() {
        let registry = registry_with(&["alpha"]);
        assert!(registry.unregister("alpha"));
        assert!(!registry.unregister("alpha"));
        assert_eq!(registry.agent_count(), 0);
    }

    #[test]
    fn test_list_sorted_and_filtered() {
        let registry = AgentRegistry::new();
        registry.register(AgentDefinition::stdio("zeta", "z", vec![]).with_capability("code"));
        registry.register(AgentDefinition::stdio("alpha", "a", vec![]).with_capability("search"));
        registry.register(AgentDefinition::http("mid", "http://x").with_capability("code"));

        let names: Vec<String> = registry.list().iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);

        let coders = registry.list_by_capability("code");
        assert_eq!(coders.len(), 2);

        registry.set_status("mid", AgentStatus::Ready, None);
        let ready = registry.list_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].name(), "mid");
    }

    #[test]
    fn test_ready_clears_error_and_stamps_connection() {
        let registry = registry_with(&["alpha"]);
        registry.set_status("alpha", AgentStatus::Error, Some("boom".into()));
        assert_eq!(registry.get("alpha").unwrap().last_error.as_deref(), Some("boom"));

        registry.set_status("alpha", AgentStatus::Ready, None);
        let agent = registry.get("alpha").unwrap();
        assert!(agent.last_error.is_none());
        assert!(agent.last_connected.is_some());
    }

    #[test]
    fn test_unknown_agent_operations_are_noops() {
        let registry = AgentRegistry::new();
        registry.set_status("ghost", AgentStatus::Ready, None);
        registry.increment_active_runs("ghost");
        registry.decrement_active_runs("ghost");
        assert_eq!(registry.agent_count(), 0);
    }

    #[test]
    fn test_active_runs_never_negative() {
        let registry = registry_with(&["alpha"]);
        registry.decrement_active_runs("alpha");
        registry.decrement_active_runs("alpha");
        assert_eq!(registry.get("alpha").unwrap().active_runs, 0);

        registry.increment_active_runs("alpha");
        registry.decrement_active_runs("alpha");
        registry.decrement_active_runs("alpha");
        assert_eq!(registry.get("alpha").unwrap().active_runs, 0);
    }

    #[test]
    fn test_run_slot_releases_on_drop() {
        let registry = registry_with(&["alpha"]);
        {
            let _a = registry.begin_run("alpha");
            let _b = registry.begin_run("alpha");
            assert_eq!(registry.get("alpha").unwrap().active_runs, 2);
        }
        assert_eq!(registry.get("alpha").unwrap().active_runs, 0);
    }

    #[test]
    fn test_busy_follows_active_runs() {
        let registry = registry_with(&["alpha"]);
        registry.set_status("alpha", AgentStatus::Ready, None);
        let mut rx = registry.subscribe();

        let first = registry.begin_run("alpha");
        assert_eq!(registry.get("alpha").unwrap().status, AgentStatus::Busy);
        let second = registry.begin_run("alpha");
        drop(first);
        assert_eq!(registry.get("alpha").unwrap().status, AgentStatus::Busy);
        assert!(registry.get("alpha").unwrap().accepts_requests());
        assert!(registry.list_ready().is_empty());

        drop(second);
        assert_eq!(registry.get("alpha").unwrap().status, AgentStatus::Ready);
        let seen: Vec<AgentStatus> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|c| c.status)
            .collect();
        assert_eq!(seen, vec![AgentStatus::Busy, AgentStatus::Ready]);
    }

    #[test]
    fn test_ready_with_runs_in_flight_is_busy() {
        let registry = registry_with(&["alpha"]);
        registry.increment_active_runs("alpha");
        assert_eq!(registry.get("alpha").unwrap().status, AgentStatus::Disconnected);
        registry.set_status("alpha", AgentStatus::Ready, None);
        assert_eq!(registry.get("alpha").unwrap().status, AgentStatus::Busy);
        registry.decrement_active_runs("alpha");
        assert_eq!(registry.get("alpha").unwrap().status, AgentStatus::Ready);

        registry.increment_active_runs("alpha");
        registry.set_status("alpha", AgentStatus::Error, Some("crashed".into()));
        registry.decrement_active_runs("alpha");
        assert_eq!(registry.get("alpha").unwrap().status, AgentStatus::Error);
    }

    #[test]
    fn test_subscribe_receives_transitions() {
        let registry = registry_with(&["alpha"]);
        let mut rx = registry.subscribe();
        registry.set_status("alpha", AgentStatus::Error, Some("spawn failed".into()));
        let change = rx.try_recv().unwrap();
        assert_eq!(change.agent, "alpha");
        assert_eq!(change.status, AgentStatus::Error);
        assert_eq!(change.error.as_deref(), Some("spawn failed"));
    }
}
