use serde::{Deserialize, Serialize};
use std::time::Duration;
use switchboard_core::DelegationOutput;
use uuid::Uuid;

/// One task in a parallel group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelTask {
    /// Agent that runs the task.
    pub agent_name: String,
    /// Instruction sent to the agent.
    pub task: String,
    /// Prepended to the task when present.
    #[serde(default)]
    pub context: Option<String>,
    /// Higher runs first. Defaults to 0.
    #[serde(default)]
    pub priority: Option<i32>,
}

impl ParallelTask {
    /// A task with default priority and no context.
    pub fn new(agent_name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            task: task.into(),
            context: None,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// A set of tasks executed together.
#[derive(Debug, Clone)]
pub struct ParallelTaskGroup {
    /// Generated on construction.
    pub group_id: String,
    /// Session runs are recorded under.
    pub parent_session_id: String,
    /// Tasks to run.
    pub tasks: Vec<ParallelTask>,
    /// `None` runs every task at once.
    pub max_concurrency: Option<usize>,
    /// Deadline for the whole group, measured from the start of execution.
    pub timeout: Option<Duration>,
    /// Stop launching new tasks after the first failure.
    pub fail_fast: bool,
}

impl ParallelTaskGroup {
    pub fn new(parent_session_id: impl Into<String>, tasks: Vec<ParallelTask>) -> Self {
        Self {
            group_id: Uuid::new_v4().to_string(),
            parent_session_id: parent_session_id.into(),
            tasks,
            max_concurrency: None,
            timeout: None,
            fail_fast: false,
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Final status of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    /// Every task succeeded.
    Completed,
    /// Some tasks succeeded.
    Partial,
    /// Nothing succeeded, or the group was cancelled or halted.
    Failed,
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupStatus::Completed => write!(f, "completed"),
            GroupStatus::Partial => write!(f, "partial"),
            GroupStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a task ended up in `errors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The agent could not be made ready.
    Unavailable,
    /// The agent returned an error.
    Execution,
    /// The group deadline passed.
    Timeout,
    /// The group was cancelled before the task started.
    Cancelled,
    /// Not launched because an earlier task failed in a fail-fast group.
    Skipped,
}

/// A task that produced output.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSuccess {
    /// Tracker run id.
    pub run_id: String,
    pub agent_name: String,
    pub task: String,
    /// What the agent returned.
    pub output: DelegationOutput,
    /// Wall time of the run.
    pub duration: Duration,
}

/// A task that ended without output.
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    /// Set for tasks that were actually launched.
    pub run_id: Option<String>,
    pub agent_name: String,
    pub task: String,
    /// Failure category.
    pub kind: FailureKind,
    /// Failure message.
    pub error: String,
    pub duration: Duration,
}

/// Outcome of `execute_parallel`. Every task appears exactly once, in
/// `results` or in `errors`, in completion order.
#[derive(Debug, Clone, Serialize)]
pub struct ParallelExecutionResult {
    /// Group this outcome belongs to.
    pub group_id: String,
    /// Overall status.
    pub status: GroupStatus,
    /// Successful tasks, in completion order.
    pub results: Vec<TaskSuccess>,
    /// Failed tasks, in completion order.
    pub errors: Vec<TaskFailure>,
    /// Wall time of the whole group.
    pub total_duration: Duration,
}

/// Reported after each task finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupProgress {
    pub group_id: String,
    pub agent_name: String,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Point-in-time view of a running group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSnapshot {
    pub group_id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}
