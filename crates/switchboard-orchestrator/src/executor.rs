use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use switchboard_acp::StdioTransport;
use switchboard_core::{
    AgentRegistry, DelegationOutput, SwitchboardError, SwitchboardResult, TransportConfig,
};
use switchboard_http::{HttpTransport, RunInvocation, RunStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// One task handed to an agent.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub run_id: String,
    pub agent_name: String,
    pub task: String,
    pub context: Option<String>,
    /// Aborts the call where the transport supports it (HTTP).
    pub cancel: Option<CancellationToken>,
}

impl DelegationRequest {
    pub fn new(agent_name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            agent_name: agent_name.into(),
            task: task.into(),
            context: None,
            cancel: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// How a fire-and-forget delegation continues after submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The remote side owns the run; poll it by id.
    Remote {
        base_url: String,
        remote_run_id: String,
    },
    /// Nothing was started remotely; the caller must drive `execute` itself.
    Local,
}

/// Executes delegations against concrete agents.
#[async_trait]
pub trait DelegationExecutor: Send + Sync {
    /// Make the agent able to accept work, spawning it if needed.
    async fn ensure_ready(&self, agent_name: &str) -> SwitchboardResult<()>;

    /// Run a task to completion.
    async fn execute(&self, request: DelegationRequest) -> SwitchboardResult<DelegationOutput>;

    /// Start a task without waiting for it.
    async fn submit(&self, _request: &DelegationRequest) -> SwitchboardResult<Submission> {
        Ok(Submission::Local)
    }
}

/// Executor backed by the stdio and HTTP transports.
pub struct TransportExecutor {
    registry: Arc<AgentRegistry>,
    stdio: Arc<StdioTransport>,
    http: Arc<HttpTransport>,
}

impl TransportExecutor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        stdio: Arc<StdioTransport>,
        http: Arc<HttpTransport>,
    ) -> Self {
        Self {
            registry,
            stdio,
            http,
        }
    }

    fn transport_of(&self, agent_name: &str) -> SwitchboardResult<TransportConfig> {
        let instance = self
            .registry
            .get(agent_name)
            .ok_or_else(|| SwitchboardError::Config(format!("Unknown agent '{agent_name}'")))?;
        if !instance.definition.enabled {
            return Err(SwitchboardError::Config(format!(
                "Agent '{agent_name}' is disabled"
            )));
        }
        Ok(instance.definition.transport)
    }
}

#[async_trait]
impl DelegationExecutor for TransportExecutor {
    async fn ensure_ready(&self, agent_name: &str) -> SwitchboardResult<()> {
        let instance = self
            .registry
            .get(agent_name)
            .ok_or_else(|| SwitchboardError::Config(format!("Unknown agent '{agent_name}'")))?;
        let definition = &instance.definition;
        if !definition.enabled {
            return Err(SwitchboardError::Config(format!(
                "Agent '{agent_name}' is disabled"
            )));
        }
        if instance.accepts_requests() || self.stdio.is_running(agent_name) {
            return Ok(());
        }
        if definition.is_spawnable() {
            debug!(agent = %agent_name, "Spawning agent on demand");
            return self.stdio.spawn_agent(agent_name).await;
        }
        if definition.base_url().is_some() {
            return Ok(());
        }
        Err(SwitchboardError::Config(format!(
            "Agent '{agent_name}' has neither a command nor a base URL"
        )))
    }

    async fn execute(&self, request: DelegationRequest) -> SwitchboardResult<DelegationOutput> {
        match self.transport_of(&request.agent_name)? {
            TransportConfig::Stdio { .. } => {
                self.stdio
                    .prompt(&request.agent_name, &request.task, request.context.as_deref())
                    .await
            }
            TransportConfig::Http { .. } => {
                let mut invocation = RunInvocation::new(&request.agent_name, &request.task)
                    .with_run_id(&request.run_id);
                invocation.context = request.context.clone();
                invocation.cancel = request.cancel.clone();

                let result = self.http.run_sync(invocation).await?;
                match result.status {
                    RunStatus::Failed | RunStatus::Cancelled => Err(SwitchboardError::Http(
                        result
                            .error_message()
                            .unwrap_or_else(|| format!("Run ended with status {}", result.status)),
                    )),
                    status => {
                        let mut output = DelegationOutput::text(result.text())
                            .with_metadata("agent", json!(request.agent_name))
                            .with_metadata("status", json!(status.to_string()));
                        if let Some(run_id) = result.run_id {
                            output = output.with_metadata("runId", json!(run_id));
                        }
                        Ok(output)
                    }
                }
            }
        }
    }

    async fn submit(&self, request: &DelegationRequest) -> SwitchboardResult<Submission> {
        let TransportConfig::Http { base_url } = self.transport_of(&request.agent_name)? else {
            return Ok(Submission::Local);
        };
        let mut invocation =
            RunInvocation::new(&request.agent_name, &request.task).with_run_id(&request.run_id);
        invocation.context = request.context.clone();
        invocation.cancel = request.cancel.clone();

        let accepted = self.http.run_async(invocation).await?;
        let remote_run_id = accepted
            .run_id
            .unwrap_or_else(|| request.run_id.clone());
        info!(
            agent = %request.agent_name,
            run_id = %request.run_id,
            remote_run_id = %remote_run_id,
            "Delegation submitted"
        );
        Ok(Submission::Remote {
            base_url,
            remote_run_id,
        })
    }
}
