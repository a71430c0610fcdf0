use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use switchboard_acp::StdioTransport;
use switchboard_core::{
    AgentInstance, AgentRegistry, SwitchboardError, SwitchboardResult, ToolCall, ToolDescriptor,
    ToolResult, TransportConfig,
};
use switchboard_orchestrator::{
    DelegationExecutor, DelegationRequest, DelegationRun, DelegationTracker, Submission,
};
use tracing::{info, warn};
use uuid::Uuid;

/// List registered agents.
pub const LIST_AGENTS: &str = "list_available_agents";
/// Delegate one task to one agent.
pub const DELEGATE: &str = "delegate_to_agent";
/// Report the state of a delegation run.
pub const CHECK_STATUS: &str = "check_agent_status";
/// Start a stdio agent.
pub const SPAWN_AGENT: &str = "spawn_agent";
/// Stop a stdio agent.
pub const STOP_AGENT: &str = "stop_agent";

const DEFAULT_SESSION: &str = "default";

/// Process control for locally spawned agents.
#[async_trait]
pub trait AgentLifecycle: Send + Sync {
    async fn spawn(&self, name: &str) -> SwitchboardResult<()>;
    async fn stop(&self, name: &str) -> SwitchboardResult<()>;
    fn is_running(&self, name: &str) -> bool;
}

#[async_trait]
impl AgentLifecycle for StdioTransport {
    async fn spawn(&self, name: &str) -> SwitchboardResult<()> {
        self.spawn_agent(name).await
    }

    async fn stop(&self, name: &str) -> SwitchboardResult<()> {
        self.stop_agent(name).await
    }

    fn is_running(&self, name: &str) -> bool {
        StdioTransport::is_running(self, name)
    }
}

/// The fixed set of delegation actions exposed to a calling agent.
///
/// Every action answers with a [`ToolResult`]; failures never escape as
/// errors.
pub struct DelegationRouter {
    registry: Arc<AgentRegistry>,
    executor: Arc<dyn DelegationExecutor>,
    lifecycle: Arc<dyn AgentLifecycle>,
    tracker: Arc<DelegationTracker>,
    retention: Duration,
}

impl DelegationRouter {
    pub fn new(
        registry: Arc<AgentRegistry>,
        executor: Arc<dyn DelegationExecutor>,
        lifecycle: Arc<dyn AgentLifecycle>,
        tracker: Arc<DelegationTracker>,
    ) -> Self {
        Self {
            registry,
            executor,
            lifecycle,
            tracker,
            retention: Duration::from_secs(3600),
        }
    }

    /// How long finished runs stay queryable.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Action names and argument schemas.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: LIST_AGENTS.to_string(),
                description: "List the agents available for delegation with their capabilities \
                              and current status."
                    .to_string(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "capability": {
                            "type": "string",
                            "description": "Only list agents advertising this capability"
                        }
                    }
                }),
            },
            ToolDescriptor {
                name: DELEGATE.to_string(),
                description: "Delegate a task to another agent. Waits for the result by default; \
                              set wait_for_result to false to get a run_id and poll it later."
                    .to_string(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "agent_name": {
                            "type": "string",
                            "description": "Name of the agent to delegate to"
                        },
                        "task": {
                            "type": "string",
                            "description": "What the agent should do"
                        },
                        "context": {
                            "type": "string",
                            "description": "Optional background information for the agent"
                        },
                        "parent_session_id": {
                            "type": "string",
                            "description": "Session that owns this delegation"
                        },
                        "wait_for_result": {
                            "type": "boolean",
                            "description": "Wait for the agent to finish (default true)"
                        }
                    },
                    "required": ["agent_name", "task"]
                }),
            },
            ToolDescriptor {
                name: CHECK_STATUS.to_string(),
                description: "Check the status of a delegation by run_id, or list the \
                              delegations of a session."
                    .to_string(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "run_id": {
                            "type": "string",
                            "description": "Run id returned by delegate_to_agent"
                        },
                        "parent_session_id": {
                            "type": "string",
                            "description": "List the runs of this session when run_id is omitted"
                        }
                    }
                }),
            },
            ToolDescriptor {
                name: SPAWN_AGENT.to_string(),
                description: "Start a local agent process so it can accept delegations."
                    .to_string(),
                parameters_schema: agent_name_schema(),
            },
            ToolDescriptor {
                name: STOP_AGENT.to_string(),
                description: "Stop a running local agent process.".to_string(),
                parameters_schema: agent_name_schema(),
            },
        ]
    }

    /// Route a call to its action.
    pub async fn dispatch(&self, call: ToolCall) -> ToolResult {
        match call.name.as_str() {
            LIST_AGENTS => self.list_agents(&call),
            DELEGATE => self.delegate(&call).await,
            CHECK_STATUS => self.check_status(&call),
            SPAWN_AGENT => self.spawn(&call).await,
            STOP_AGENT => self.stop(&call).await,
            other => ToolResult::error(&call.id, format!("Unknown action '{other}'")),
        }
    }

    fn list_agents(&self, call: &ToolCall) -> ToolResult {
        let agents = match call.text_arg("capability") {
            Some(tag) => self.registry.list_by_capability(&tag),
            None => self.registry.list(),
        };
        let listed: Vec<Value> = agents.iter().map(agent_summary).collect();
        ToolResult::reply(
            &call.id,
            json!({ "count": listed.len(), "agents": listed }),
        )
    }

    async fn delegate(&self, call: &ToolCall) -> ToolResult {
        let Some(agent) = call.text_arg("agent_name") else {
            return ToolResult::error(&call.id, "agent_name is required");
        };
        let Some(task) = call.text_arg("task") else {
            return ToolResult::error(&call.id, "task is required");
        };
        let Some(instance) = self.registry.get(&agent) else {
            return ToolResult::error(&call.id, format!("Unknown agent '{agent}'"));
        };
        if !instance.definition.enabled {
            return ToolResult::error(&call.id, format!("Agent '{agent}' is disabled"));
        }
        let parent = call.text_arg("parent_session_id").unwrap_or_else(|| DEFAULT_SESSION.into());
        let wait = call.flag_arg("wait_for_result").unwrap_or(true);

        self.tracker.cleanup_old_delegated_runs(self.retention);

        let run_id = Uuid::new_v4().to_string();
        let request = DelegationRequest::new(&agent, &task)
            .with_run_id(&run_id)
            .with_context(call.text_arg("context"));
        let mut run = DelegationRun::new(&run_id, &agent, parent, &task);
        if !wait {
            run = run.announced();
        }
        self.tracker.record(run);
        info!(agent = %agent, run_id = %run_id, wait, "Delegating task");

        if let Err(e) = self.executor.ensure_ready(&agent).await {
            self.tracker.fail(&run_id, e.to_string());
            return ToolResult::error(&call.id, describe_failure(&agent, &e));
        }
        self.tracker.mark_running(&run_id);

        if wait {
            self.delegate_and_wait(call, request).await
        } else {
            self.delegate_detached(call, request).await
        }
    }

    async fn delegate_and_wait(&self, call: &ToolCall, request: DelegationRequest) -> ToolResult {
        let run_id = request.run_id.clone();
        let agent = request.agent_name.clone();
        let outcome = {
            let _slot = self.registry.begin_run(&agent);
            self.executor.execute(request).await
        };
        match outcome {
            Ok(output) => {
                let text = output.text.clone();
                self.tracker.complete(&run_id, output);
                ToolResult::reply(
                    &call.id,
                    json!({
                        "run_id": run_id,
                        "agent": agent,
                        "status": "completed",
                        "output": text,
                    })
                    ,
                )
            }
            Err(e) => {
                warn!(agent = %agent, run_id = %run_id, error = %e, "Delegation failed");
                self.tracker.fail(&run_id, e.to_string());
                ToolResult::error(&call.id, describe_failure(&agent, &e))
            }
        }
    }

    async fn delegate_detached(&self, call: &ToolCall, request: DelegationRequest) -> ToolResult {
        let run_id = request.run_id.clone();
        let agent = request.agent_name.clone();
        match self.executor.submit(&request).await {
            Ok(Submission::Remote {
                base_url,
                remote_run_id,
            }) => {
                self.tracker.set_remote(&run_id, base_url, &remote_run_id);
                ToolResult::reply(
                    &call.id,
                    json!({
                        "run_id": run_id,
                        "agent": agent,
                        "status": "running",
                        "remote_run_id": remote_run_id,
                        "message": format!("Delegation started. Use {CHECK_STATUS} with this run_id to follow it."),
                    })
                    ,
                )
            }
            Ok(Submission::Local) => {
                let executor = self.executor.clone();
                let tracker = self.tracker.clone();
                let slot = self.registry.begin_run(&agent);
                tokio::spawn(async move {
                    let run_id = request.run_id.clone();
                    let outcome = executor.execute(request).await;
                    drop(slot);
                    match outcome {
                        Ok(output) => {
                            tracker.complete(&run_id, output);
                        }
                        Err(e) => {
                            tracker.fail(&run_id, e.to_string());
                        }
                    }
                });
                ToolResult::reply(
                    &call.id,
                    json!({
                        "run_id": run_id,
                        "agent": agent,
                        "status": "running",
                        "message": format!("Delegation started. Use {CHECK_STATUS} with this run_id to follow it."),
                    })
                    ,
                )
            }
            Err(e) => {
                self.tracker.fail(&run_id, e.to_string());
                ToolResult::error(&call.id, describe_failure(&agent, &e))
            }
        }
    }

    fn check_status(&self, call: &ToolCall) -> ToolResult {
        if let Some(run_id) = call.text_arg("run_id") {
            return match self.tracker.get(&run_id) {
                Some(run) => ToolResult::reply(&call.id, run_summary(&run)),
                None => ToolResult::error(&call.id, format!("No delegation run with id '{run_id}'")),
            };
        }
        let runs = match call.text_arg("parent_session_id") {
            Some(parent) => self.tracker.list_for_session(&parent),
            None => self.tracker.list(),
        };
        let listed: Vec<Value> = runs.iter().map(run_summary).collect();
        ToolResult::reply(
            &call.id,
            json!({
                "count": listed.len(),
                "running": self.tracker.running_count(),
                "runs": listed,
            })
            ,
        )
    }

    async fn spawn(&self, call: &ToolCall) -> ToolResult {
        let agent = match self.stdio_agent(call) {
            Ok(agent) => agent,
            Err(result) => return result,
        };
        if self.lifecycle.is_running(&agent)
            && self
                .registry
                .get(&agent)
                .map_or(false, |a| a.accepts_requests())
        {
            return ToolResult::reply(
                &call.id,
                json!({ "agent": agent, "status": "ready", "message": "Agent is already running" })
                    ,
            );
        }
        match self.lifecycle.spawn(&agent).await {
            Ok(()) => ToolResult::reply(
                &call.id,
                json!({ "agent": agent, "status": "ready", "message": "Agent started" }),
            ),
            Err(e) => ToolResult::error(&call.id, format!("Failed to start agent '{agent}': {e}")),
        }
    }

    async fn stop(&self, call: &ToolCall) -> ToolResult {
        let agent = match self.stdio_agent(call) {
            Ok(agent) => agent,
            Err(result) => return result,
        };
        if !self.lifecycle.is_running(&agent) {
            return ToolResult::reply(
                &call.id,
                json!({ "agent": agent, "status": "stopped", "message": "Agent is not running" })
                    ,
            );
        }
        match self.lifecycle.stop(&agent).await {
            Ok(()) => ToolResult::reply(
                &call.id,
                json!({ "agent": agent, "status": "stopped", "message": "Agent stopped" })
                    ,
            ),
            Err(e) => ToolResult::error(&call.id, format!("Failed to stop agent '{agent}': {e}")),
        }
    }

    fn stdio_agent(&self, call: &ToolCall) -> Result<String, ToolResult> {
        let Some(agent) = call.text_arg("agent_name") else {
            return Err(ToolResult::error(&call.id, "agent_name is required"));
        };
        let Some(instance) = self.registry.get(&agent) else {
            return Err(ToolResult::error(&call.id, format!("Unknown agent '{agent}'")));
        };
        if let TransportConfig::Http { .. } = instance.definition.transport {
            return Err(ToolResult::error(
                &call.id,
                format!("Agent '{agent}' is a remote HTTP agent and has no local process"),
            ));
        }
        Ok(agent)
    }
}

/// User-facing message for a failed delegation.
pub fn describe_failure(agent: &str, error: &SwitchboardError) -> String {
    if error.is_protocol_mismatch() {
        format!(
            "Agent '{agent}' does not implement the expected delegation protocol \
             (method not found). Check that it speaks ACP over stdio or the runs API \
             over HTTP. Details: {error}"
        )
    } else if error.is_timeout() {
        format!("Delegation to '{agent}' timed out: {error}")
    } else if error.is_cancelled() {
        format!("Delegation to '{agent}' was cancelled: {error}")
    } else {
        format!("Delegation to '{agent}' failed: {error}")
    }
}

fn agent_name_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "agent_name": {
                "type": "string",
                "description": "Name of the agent"
            }
        },
        "required": ["agent_name"]
    })
}

fn agent_summary(agent: &AgentInstance) -> Value {
    let definition = &agent.definition;
    json!({
        "name": definition.name,
        "display_name": definition.display_name(),
        "description": definition.description,
        "capabilities": definition.capabilities,
        "transport": definition.transport.kind(),
        "enabled": definition.enabled,
        "status": agent.status.to_string(),
        "active_runs": agent.active_runs,
        "last_error": agent.last_error,
    })
}

fn run_summary(run: &DelegationRun) -> Value {
    json!({
        "run_id": run.run_id,
        "agent": run.agent_name,
        "parent_session_id": run.parent_session_id,
        "task": run.task,
        "status": run.status.to_string(),
        "elapsed_secs": run.elapsed().as_secs_f64(),
        "progress": run.progress,
        "output": run.result.as_ref().map(|o| o.text.clone()),
        "error": run.error,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_failure_flags_protocol_mismatch() {
        let err = SwitchboardError::Rpc {
            code: switchboard_core::METHOD_NOT_FOUND,
            message: "session/prompt".into(),
        };
        let message = describe_failure("coder", &err);
        assert!(message.contains("does not implement the expected delegation protocol"));
        assert!(message.contains("coder"));
    }

    #[test]
    fn test_describe_failure_other_kinds() {
        let timeout = describe_failure("a", &SwitchboardError::Timeout("request 4".into()));
        assert!(timeout.contains("timed out"));
        let generic = describe_failure("a", &SwitchboardError::Transport("broken pipe".into()));
        assert!(generic.starts_with("Delegation to 'a' failed"));
        assert!(!generic.contains("protocol"));
    }
}
