#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for the parallel orchestrator using a scripted executor.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{
    AgentDefinition, AgentRegistry, DelegationOutput, SwitchboardError, SwitchboardResult,
};
use switchboard_orchestrator::{
    DelegationExecutor, DelegationRequest, DelegationTracker, FailureKind, GroupProgress,
    GroupStatus, ParallelOrchestrator, ParallelTask, ParallelTaskGroup, ProgressCallback, RunState,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedExecutor {
    default_delay: Duration,
    delays: HashMap<String, Duration>,
    failing: HashSet<String>,
    unavailable: HashSet<String>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: Mutex<Vec<String>>,
    readiness_checks: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn with_delay(delay: Duration) -> Self {
        Self {
            default_delay: delay,
            ..Default::default()
        }
    }

    fn failing(mut self, agents: &[&str]) -> Self {
        self.failing.extend(agents.iter().map(|a| a.to_string()));
        self
    }

    fn unavailable(mut self, agents: &[&str]) -> Self {
        self.unavailable.extend(agents.iter().map(|a| a.to_string()));
        self
    }

    fn delay_for(mut self, agent: &str, delay: Duration) -> Self {
        self.delays.insert(agent.to_string(), delay);
        self
    }
}

#[async_trait]
impl DelegationExecutor for ScriptedExecutor {
    async fn ensure_ready(&self, agent_name: &str) -> SwitchboardResult<()> {
        self.readiness_checks.lock().push(agent_name.to_string());
        if self.unavailable.contains(agent_name) {
            return Err(SwitchboardError::Config(format!(
                "Agent '{agent_name}' has neither a command nor a base URL"
            )));
        }
        Ok(())
    }

    async fn execute(&self, request: DelegationRequest) -> SwitchboardResult<DelegationOutput> {
        self.started.lock().push(request.task.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self
            .delays
            .get(&request.agent_name)
            .copied()
            .unwrap_or(self.default_delay);
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&request.agent_name) {
            Err(SwitchboardError::Rpc {
                code: -32000,
                message: format!("{} could not finish", request.agent_name),
            })
        } else {
            Ok(DelegationOutput::text(format!("{} done", request.task)))
        }
    }
}

struct Harness {
    executor: Arc<ScriptedExecutor>,
    registry: Arc<AgentRegistry>,
    tracker: Arc<DelegationTracker>,
    orchestrator: Arc<ParallelOrchestrator>,
}

fn harness(executor: ScriptedExecutor, agents: &[&str]) -> Harness {
    let executor = Arc::new(executor);
    let registry = Arc::new(AgentRegistry::new());
    for agent in agents {
        registry.register(AgentDefinition::stdio(*agent, "agent-bin", vec![]));
    }
    let tracker = DelegationTracker::builder().build();
    let orchestrator = Arc::new(ParallelOrchestrator::new(
        executor.clone(),
        registry.clone(),
        tracker.clone(),
    ));
    Harness {
        executor,
        registry,
        tracker,
        orchestrator,
    }
}

fn tasks(agents: &[&str]) -> Vec<ParallelTask> {
    agents
        .iter()
        .enumerate()
        .map(|(i, agent)| ParallelTask::new(*agent, format!("task-{i}")))
        .collect()
}

const FIVE: [&str; 5] = ["a1", "a2", "a3", "a4", "a5"];

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrency_cap_is_respected() {
    let h = harness(ScriptedExecutor::with_delay(Duration::from_millis(50)), &FIVE);
    let group = ParallelTaskGroup::new("session-1", tasks(&FIVE)).with_max_concurrency(2);

    let result = h.orchestrator.execute_parallel(group, None).await;

    assert_eq!(result.status, GroupStatus::Completed);
    assert_eq!(result.results.len(), 5);
    assert!(result.errors.is_empty());
    assert!(h.executor.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert_eq!(h.orchestrator.active_group_count(), 0);
    for agent in FIVE {
        assert_eq!(h.registry.get(agent).unwrap().active_runs, 0);
    }
    let runs = h.tracker.list_for_session("session-1");
    assert_eq!(runs.len(), 5);
    assert!(runs.iter().all(|r| r.status == RunState::Completed));
}

#[tokio::test]
async fn test_unlimited_concurrency_runs_everything_at_once() {
    let h = harness(ScriptedExecutor::with_delay(Duration::from_millis(100)), &FIVE);
    let group = ParallelTaskGroup::new("s", tasks(&FIVE));

    let result = h.orchestrator.execute_parallel(group, None).await;

    assert_eq!(result.results.len(), 5);
    assert_eq!(h.executor.max_in_flight.load(Ordering::SeqCst), 5);
    assert!(result.total_duration < Duration::from_millis(450));
}

#[tokio::test]
async fn test_results_arrive_in_completion_order() {
    let executor = ScriptedExecutor::with_delay(Duration::from_millis(10))
        .delay_for("slow", Duration::from_millis(200))
        .delay_for("medium", Duration::from_millis(80));
    let h = harness(executor, &["slow", "medium", "fast"]);
    let group = ParallelTaskGroup::new("s", tasks(&["slow", "medium", "fast"]));

    let result = h.orchestrator.execute_parallel(group, None).await;

    let order: Vec<&str> = result.results.iter().map(|r| r.agent_name.as_str()).collect();
    assert_eq!(order, vec!["fast", "medium", "slow"]);
}

#[tokio::test]
async fn test_higher_priority_starts_first() {
    let h = harness(ScriptedExecutor::with_delay(Duration::from_millis(5)), &["a", "b", "c", "d"]);
    let group = ParallelTaskGroup::new(
        "s",
        vec![
            ParallelTask::new("a", "low"),
            ParallelTask::new("b", "high").with_priority(10),
            ParallelTask::new("c", "low-too"),
            ParallelTask::new("d", "mid").with_priority(5),
        ],
    )
    .with_max_concurrency(1);

    h.orchestrator.execute_parallel(group, None).await;

    assert_eq!(*h.executor.started.lock(), vec!["high", "mid", "low", "low-too"]);
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_best_effort_with_three_failures_is_partial() {
    let executor = ScriptedExecutor::with_delay(Duration::from_millis(10)).failing(&["a1", "a3", "a5"]);
    let h = harness(executor, &FIVE);
    let group = ParallelTaskGroup::new("s", tasks(&FIVE)).with_max_concurrency(2);

    let result = h.orchestrator.execute_parallel(group, None).await;

    assert_eq!(result.status, GroupStatus::Partial);
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.errors.len(), 3);
    assert!(result.errors.iter().all(|e| e.kind == FailureKind::Execution));
    assert!(result.errors.iter().all(|e| e.run_id.is_some()));
}

#[tokio::test]
async fn test_best_effort_with_all_failures_is_failed() {
    let executor = ScriptedExecutor::with_delay(Duration::from_millis(5)).failing(&FIVE);
    let h = harness(executor, &FIVE);
    let group = ParallelTaskGroup::new("s", tasks(&FIVE));

    let result = h.orchestrator.execute_parallel(group, None).await;

    assert_eq!(result.status, GroupStatus::Failed);
    assert!(result.results.is_empty());
    assert_eq!(result.errors.len(), 5);
    assert_eq!(h.tracker.list().iter().filter(|r| r.status == RunState::Failed).count(), 5);
}

#[tokio::test]
async fn test_fail_fast_stops_launching_new_tasks() {
    let executor = ScriptedExecutor::with_delay(Duration::from_millis(20)).failing(&["bad"]);
    let h = harness(executor, &["bad", "ok1", "ok2"]);
    let group = ParallelTaskGroup::new(
        "s",
        vec![
            ParallelTask::new("bad", "explode").with_priority(1),
            ParallelTask::new("ok1", "fine"),
            ParallelTask::new("ok2", "fine-too"),
        ],
    )
    .with_max_concurrency(1)
    .with_fail_fast(true);

    let result = h.orchestrator.execute_parallel(group, None).await;

    assert_eq!(result.status, GroupStatus::Failed);
    assert!(result.results.is_empty());
    assert_eq!(result.errors.len(), 3);
    assert_eq!(result.errors[0].kind, FailureKind::Execution);
    assert!(result.errors[0].error.contains("bad could not finish"));
    assert!(result.errors[1..].iter().all(|e| e.kind == FailureKind::Skipped));
    assert_eq!(*h.executor.started.lock(), vec!["explode"]);
}

#[tokio::test]
async fn test_unavailable_agents_fail_their_tasks_only() {
    let executor = ScriptedExecutor::with_delay(Duration::from_millis(5)).unavailable(&["ghost"]);
    let h = harness(executor, &["ghost", "real"]);
    let group = ParallelTaskGroup::new(
        "s",
        vec![
            ParallelTask::new("ghost", "one"),
            ParallelTask::new("real", "two"),
            ParallelTask::new("ghost", "three"),
        ],
    );

    let result = h.orchestrator.execute_parallel(group, None).await;

    assert_eq!(result.status, GroupStatus::Partial);
    assert_eq!(result.results.len(), 1);
    assert_eq!(result.errors.len(), 2);
    assert!(result.errors.iter().all(|e| e.kind == FailureKind::Unavailable));
    let mut checks = h.executor.readiness_checks.lock().clone();
    checks.sort();
    assert_eq!(checks, vec!["ghost", "real"]);
}

#[tokio::test]
async fn test_group_deadline_times_out_remaining_tasks() {
    let h = harness(ScriptedExecutor::with_delay(Duration::from_millis(200)), &["a", "b", "c"]);
    let group = ParallelTaskGroup::new("s", tasks(&["a", "b", "c"]))
        .with_max_concurrency(1)
        .with_timeout(Duration::from_millis(300));

    let result = h.orchestrator.execute_parallel(group, None).await;

    assert_eq!(result.status, GroupStatus::Partial);
    assert_eq!(result.results.len(), 1);
    assert_eq!(result.errors.len(), 2);
    assert!(result.errors.iter().all(|e| e.kind == FailureKind::Timeout));
}

#[tokio::test]
async fn test_empty_group_completes() {
    let h = harness(ScriptedExecutor::default(), &[]);
    let result = h
        .orchestrator
        .execute_parallel(ParallelTaskGroup::new("s", vec![]), None)
        .await;
    assert_eq!(result.status, GroupStatus::Completed);
    assert_eq!(h.orchestrator.active_group_count(), 0);
}

// ---------------------------------------------------------------------------
// Observation and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_progress_callback_sees_every_task() {
    let executor = ScriptedExecutor::with_delay(Duration::from_millis(5)).failing(&["a2"]);
    let h = harness(executor, &FIVE);
    let seen: Arc<Mutex<Vec<GroupProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: ProgressCallback = Arc::new(move |p: GroupProgress| sink.lock().push(p));

    h.orchestrator
        .execute_parallel(
            ParallelTaskGroup::new("s", tasks(&FIVE)).with_max_concurrency(2),
            Some(callback),
        )
        .await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 5);
    let last = seen.last().unwrap();
    assert_eq!(last.total, 5);
    assert_eq!(last.completed + last.failed, 5);
    assert_eq!(last.failed, 1);
}

#[tokio::test]
async fn test_cancel_group_stops_dispatch_and_reports_failed() {
    let h = harness(ScriptedExecutor::with_delay(Duration::from_millis(100)), &FIVE);
    let group = ParallelTaskGroup::new("s", tasks(&FIVE)).with_max_concurrency(1);
    let group_id = group.group_id.clone();

    let orchestrator = h.orchestrator.clone();
    let handle = tokio::spawn(async move { orchestrator.execute_parallel(group, None).await });

    for _ in 0..50 {
        if h.orchestrator.get_group_status(&group_id).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let snapshot = h.orchestrator.get_group_status(&group_id).unwrap();
    assert_eq!(snapshot.total, 5);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(h.orchestrator.cancel_group(&group_id));
    assert!(!h.orchestrator.cancel_group(&group_id));
    assert!(h.orchestrator.get_group_status(&group_id).is_none());
    assert_eq!(h.orchestrator.active_group_count(), 0);

    let result = handle.await.unwrap();
    assert_eq!(result.status, GroupStatus::Failed);
    assert_eq!(result.results.len() + result.errors.len(), 5);
    // The task already running when cancelled still finishes.
    assert_eq!(result.results.len(), 1);
    assert!(result.errors.iter().all(|e| e.kind == FailureKind::Cancelled));
    assert_eq!(h.executor.started.lock().len(), 1);
}
