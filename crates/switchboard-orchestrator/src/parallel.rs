use crate::executor::{DelegationExecutor, DelegationRequest};
use crate::tracker::{DelegationRun, DelegationTracker};
use crate::types::{
    FailureKind, GroupProgress, GroupSnapshot, GroupStatus, ParallelExecutionResult, ParallelTask,
    ParallelTaskGroup, TaskFailure, TaskSuccess,
};
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{AgentRegistry, SwitchboardError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Callback invoked after each task of a group finishes.
pub type ProgressCallback = Arc<dyn Fn(GroupProgress) + Send + Sync>;

struct GroupEntry {
    token: CancellationToken,
    total: usize,
    completed: usize,
    failed: usize,
}

type GroupTable = Arc<Mutex<HashMap<String, GroupEntry>>>;

/// Removes the group from the active table on every exit path.
struct GroupRegistration {
    groups: GroupTable,
    group_id: String,
}

impl Drop for GroupRegistration {
    fn drop(&mut self) {
        self.groups.lock().remove(&self.group_id);
    }
}

/// Results shared between the dispatcher and running tasks.
#[derive(Default)]
struct Outcome {
    results: Vec<TaskSuccess>,
    errors: Vec<TaskFailure>,
    first_failure: Option<String>,
}

/// Everything a spawned task needs, cloned per task.
#[derive(Clone)]
struct TaskContext {
    group_id: String,
    parent_session_id: String,
    total: usize,
    fail_fast: bool,
    executor: Arc<dyn DelegationExecutor>,
    registry: Arc<AgentRegistry>,
    tracker: Arc<DelegationTracker>,
    groups: GroupTable,
    outcome: Arc<Mutex<Outcome>>,
    halt: CancellationToken,
    on_progress: Option<ProgressCallback>,
}

impl TaskContext {
    fn record_success(&self, success: TaskSuccess) {
        let agent = success.agent_name.clone();
        self.outcome.lock().results.push(success);
        self.bump(&agent, true);
    }

    fn record_failure(&self, failure: TaskFailure) {
        let agent = failure.agent_name.clone();
        let triggers = !matches!(failure.kind, FailureKind::Skipped | FailureKind::Cancelled);
        {
            let mut outcome = self.outcome.lock();
            if triggers && outcome.first_failure.is_none() {
                outcome.first_failure = Some(format!("{}: {}", failure.agent_name, failure.error));
            }
            outcome.errors.push(failure);
        }
        if triggers && self.fail_fast && !self.halt.is_cancelled() {
            warn!(group_id = %self.group_id, agent = %agent, "Task failed; halting fail-fast group");
            self.halt.cancel();
        }
        self.bump(&agent, false);
    }

    fn bump(&self, agent: &str, succeeded: bool) {
        let (completed, failed) = {
            let outcome = self.outcome.lock();
            (outcome.results.len(), outcome.errors.len())
        };
        if let Some(entry) = self.groups.lock().get_mut(&self.group_id) {
            if succeeded {
                entry.completed += 1;
            } else {
                entry.failed += 1;
            }
        }
        if let Some(callback) = &self.on_progress {
            callback(GroupProgress {
                group_id: self.group_id.clone(),
                agent_name: agent.to_string(),
                completed,
                failed,
                total: self.total,
            });
        }
    }

    fn failure(&self, task: &ParallelTask, kind: FailureKind, error: String) -> TaskFailure {
        TaskFailure {
            run_id: None,
            agent_name: task.agent_name.clone(),
            task: task.task.clone(),
            kind,
            error,
            duration: Duration::ZERO,
        }
    }

    async fn run(self, task: ParallelTask, budget: Option<Duration>) {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let _slot = self.registry.begin_run(&task.agent_name);

        self.tracker.record(DelegationRun::new(
            &run_id,
            &task.agent_name,
            &self.parent_session_id,
            &task.task,
        ));
        self.tracker.mark_running(&run_id);
        debug!(group_id = %self.group_id, run_id = %run_id, agent = %task.agent_name, "Task started");

        let request = DelegationRequest::new(&task.agent_name, &task.task)
            .with_run_id(&run_id)
            .with_context(task.context.clone());
        let call = AssertUnwindSafe(self.executor.execute(request)).catch_unwind();
        let outcome = match budget {
            Some(budget) => match tokio::time::timeout(budget, call).await {
                Ok(result) => result,
                Err(_) => Ok(Err(SwitchboardError::Timeout(format!(
                    "Task for '{}' exceeded the group deadline",
                    task.agent_name
                )))),
            },
            None => call.await,
        };
        let result = outcome.unwrap_or_else(|_| {
            error!(agent = %task.agent_name, "Delegation panicked");
            Err(SwitchboardError::Orchestrator(format!(
                "Delegation to '{}' panicked",
                task.agent_name
            )))
        });

        let duration = started.elapsed();
        match result {
            Ok(output) => {
                self.tracker.complete(&run_id, output.clone());
                self.record_success(TaskSuccess {
                    run_id,
                    agent_name: task.agent_name,
                    task: task.task,
                    output,
                    duration,
                });
            }
            Err(e) => {
                self.tracker.fail(&run_id, e.to_string());
                let kind = if e.is_timeout() {
                    FailureKind::Timeout
                } else {
                    FailureKind::Execution
                };
                let mut failure = self.failure(&task, kind, e.to_string());
                failure.run_id = Some(run_id);
                failure.duration = duration;
                self.record_failure(failure);
            }
        }
    }
}

/// Runs groups of delegations concurrently under a concurrency cap.
pub struct ParallelOrchestrator {
    executor: Arc<dyn DelegationExecutor>,
    registry: Arc<AgentRegistry>,
    tracker: Arc<DelegationTracker>,
    groups: GroupTable,
}

impl ParallelOrchestrator {
    pub fn new(
        executor: Arc<dyn DelegationExecutor>,
        registry: Arc<AgentRegistry>,
        tracker: Arc<DelegationTracker>,
    ) -> Self {
        Self {
            executor,
            registry,
            tracker,
            groups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Execute every task of the group and collect the outcome.
    ///
    /// Never fails as a whole: each task's outcome lands in `results` or
    /// `errors` exactly once.
    pub async fn execute_parallel(
        &self,
        group: ParallelTaskGroup,
        on_progress: Option<ProgressCallback>,
    ) -> ParallelExecutionResult {
        let started = Instant::now();
        let deadline = group.timeout.map(|t| started + t);
        let total = group.tasks.len();
        let token = CancellationToken::new();
        let halt = token.child_token();

        self.groups.lock().insert(
            group.group_id.clone(),
            GroupEntry {
                token: token.clone(),
                total,
                completed: 0,
                failed: 0,
            },
        );
        let _registration = GroupRegistration {
            groups: self.groups.clone(),
            group_id: group.group_id.clone(),
        };
        info!(
            group_id = %group.group_id,
            tasks = total,
            max_concurrency = ?group.max_concurrency,
            fail_fast = group.fail_fast,
            "Executing parallel group"
        );

        let ctx = TaskContext {
            group_id: group.group_id.clone(),
            parent_session_id: group.parent_session_id.clone(),
            total,
            fail_fast: group.fail_fast,
            executor: self.executor.clone(),
            registry: self.registry.clone(),
            tracker: self.tracker.clone(),
            groups: self.groups.clone(),
            outcome: Arc::new(Mutex::new(Outcome::default())),
            halt: halt.clone(),
            on_progress,
        };

        // Readiness, concurrently across distinct agents.
        let mut seen = HashSet::new();
        let distinct: Vec<&str> = group
            .tasks
            .iter()
            .map(|t| t.agent_name.as_str())
            .filter(|name| seen.insert(*name))
            .collect();
        let checks = join_all(distinct.iter().map(|name| async move {
            (*name, self.executor.ensure_ready(name).await)
        }))
        .await;
        let unavailable: HashMap<&str, String> = checks
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e.to_string())))
            .collect();

        let mut runnable = Vec::with_capacity(total);
        for task in &group.tasks {
            match unavailable.get(task.agent_name.as_str()) {
                Some(reason) => {
                    warn!(agent = %task.agent_name, error = %reason, "Agent not ready");
                    ctx.record_failure(ctx.failure(task, FailureKind::Unavailable, reason.clone()));
                }
                None => runnable.push(task.clone()),
            }
        }
        runnable.sort_by_key(|t| Reverse(t.priority.unwrap_or(0)));

        let limit = group
            .max_concurrency
            .filter(|n| *n > 0)
            .unwrap_or_else(|| runnable.len().max(1));
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut join_set = JoinSet::new();
        let mut queue = runnable.into_iter();

        while let Some(task) = queue.next() {
            let permit = tokio::select! {
                biased;
                () = halt.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit.filter(|_| !halt.is_cancelled()) else {
                self.record_halted(&ctx, &token, std::iter::once(task).chain(queue.by_ref()));
                break;
            };

            let budget = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        ctx.record_failure(ctx.failure(
                            &task,
                            FailureKind::Timeout,
                            "Group deadline passed before the task started".to_string(),
                        ));
                        continue;
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let task_ctx = ctx.clone();
            join_set.spawn(async move {
                let _permit = permit;
                task_ctx.run(task, budget).await;
            });
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!(group_id = %group.group_id, error = %e, "Group task aborted");
            }
        }

        let cancelled = token.is_cancelled();
        let outcome = std::mem::take(&mut *ctx.outcome.lock());
        let status = if cancelled || (group.fail_fast && !outcome.errors.is_empty()) {
            GroupStatus::Failed
        } else if outcome.errors.is_empty() {
            GroupStatus::Completed
        } else if outcome.results.is_empty() {
            GroupStatus::Failed
        } else {
            GroupStatus::Partial
        };

        let total_duration = started.elapsed();
        info!(
            group_id = %group.group_id,
            status = %status,
            succeeded = outcome.results.len(),
            failed = outcome.errors.len(),
            duration_ms = total_duration.as_millis() as u64,
            "Parallel group finished"
        );
        if let Some(trigger) = &outcome.first_failure {
            debug!(group_id = %group.group_id, trigger = %trigger, "First failure in group");
        }

        ParallelExecutionResult {
            group_id: group.group_id,
            status,
            results: outcome.results,
            errors: outcome.errors,
            total_duration,
        }
    }

    fn record_halted(
        &self,
        ctx: &TaskContext,
        token: &CancellationToken,
        tasks: impl Iterator<Item = ParallelTask>,
    ) {
        let cancelled = token.is_cancelled();
        let trigger = ctx.outcome.lock().first_failure.clone();
        for task in tasks {
            let (kind, reason) = if cancelled {
                (FailureKind::Cancelled, "Group was cancelled".to_string())
            } else {
                (
                    FailureKind::Skipped,
                    format!(
                        "Not started: group halted after failure ({})",
                        trigger.as_deref().unwrap_or("unknown")
                    ),
                )
            };
            ctx.record_failure(ctx.failure(&task, kind, reason));
        }
    }

    /// Stop launching new tasks for a group and drop it from the active
    /// table. Running tasks finish on their own; the group will report
    /// `failed`. Returns false for unknown or already cancelled groups.
    pub fn cancel_group(&self, group_id: &str) -> bool {
        let Some(entry) = self.groups.lock().remove(group_id) else {
            return false;
        };
        entry.token.cancel();
        info!(group_id, "Parallel group cancelled");
        true
    }

    pub fn get_group_status(&self, group_id: &str) -> Option<GroupSnapshot> {
        self.groups.lock().get(group_id).map(|entry| GroupSnapshot {
            group_id: group_id.to_string(),
            total: entry.total,
            completed: entry.completed,
            failed: entry.failed,
        })
    }

    pub fn active_group_count(&self) -> usize {
        self.groups.lock().len()
    }
}

/// Human-readable summary of a group's outcome.
pub fn aggregate_results(result: &ParallelExecutionResult) -> String {
    let mut out = format!(
        "Parallel execution {} ({} succeeded, {} failed) in {:.1}s\n",
        result.status,
        result.results.len(),
        result.errors.len(),
        result.total_duration.as_secs_f64()
    );
    for success in &result.results {
        let _ = writeln!(
            out,
            "\n✓ {} ({:.1}s)\n{}",
            success.agent_name,
            success.duration.as_secs_f64(),
            success.output.text.trim()
        );
    }
    for failure in &result.errors {
        let _ = writeln!(
            out,
            "\n✗ {} ({:.1}s)\nError: {}",
            failure.agent_name,
            failure.duration.as_secs_f64(),
            failure.error
        );
    }
    out
}
