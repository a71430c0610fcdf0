use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use switchboard_core::{
    AgentProgressUpdate, DelegationOutput, NoopNotificationSink, NotificationSink, ProgressSink,
    ProgressStep, SwitchboardResult, TracingProgressSink,
};
use switchboard_http::{HttpTransport, RunStatus};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EXCERPT_CHARS: usize = 200;

/// Lifecycle of a delegation run. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Recorded, not started.
    Pending,
    /// Executing.
    Running,
    /// Finished with output.
    Completed,
    /// Finished with an error.
    Failed,
}

impl RunState {
    /// Completed or failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            RunState::Pending => 0,
            RunState::Running => 1,
            RunState::Completed | RunState::Failed => 2,
        }
    }

    /// Whether `next` is strictly later in the lifecycle.
    pub fn can_transition_to(self, next: RunState) -> bool {
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// One attempt to execute a task on an agent.
#[derive(Debug, Clone, Serialize)]
pub struct DelegationRun {
    /// Local run id.
    pub run_id: String,
    /// Agent executing the run.
    pub agent_name: String,
    /// Session that requested the run.
    pub parent_session_id: String,
    /// Delegated instruction.
    pub task: String,
    /// Current lifecycle state.
    pub status: RunState,
    /// When the run was recorded.
    pub start_time: DateTime<Utc>,
    /// Set on completion or failure.
    pub end_time: Option<DateTime<Utc>>,
    /// Output of a completed run.
    pub result: Option<DelegationOutput>,
    /// Error of a failed run.
    pub error: Option<String>,
    /// Latest progress note.
    pub progress: Option<String>,
    /// Set for runs the remote side executes; enables polling.
    pub base_url: Option<String>,
    /// Run id on the remote server.
    pub remote_run_id: Option<String>,
    /// Raise progress and notification events when the run ends.
    pub announce: bool,
}

impl DelegationRun {
    pub fn new(
        run_id: impl Into<String>,
        agent_name: impl Into<String>,
        parent_session_id: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            agent_name: agent_name.into(),
            parent_session_id: parent_session_id.into(),
            task: task.into(),
            status: RunState::Pending,
            start_time: Utc::now(),
            end_time: None,
            result: None,
            error: None,
            progress: None,
            base_url: None,
            remote_run_id: None,
            announce: false,
        }
    }

    /// Mark the run as detached from its caller so completion is announced.
    pub fn announced(mut self) -> Self {
        self.announce = true;
        self
    }

    fn is_pollable(&self) -> bool {
        self.status == RunState::Running && self.base_url.is_some() && self.remote_run_id.is_some()
    }

    /// Time from start to end, or to now while running.
    pub fn elapsed(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).to_std().unwrap_or_default()
    }
}

/// Terminal state reported by a remote run, or `Running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRunState {
    /// Still executing.
    Running,
    /// Finished; carries the output text.
    Completed(String),
    /// Finished with an error message.
    Failed(String),
}

/// Where the poller fetches remote run status from.
#[async_trait]
pub trait RunStatusSource: Send + Sync {
    async fn fetch_status(&self, base_url: &str, remote_run_id: &str)
        -> SwitchboardResult<RemoteRunState>;
}

#[async_trait]
impl RunStatusSource for HttpTransport {
    async fn fetch_status(
        &self,
        base_url: &str,
        remote_run_id: &str,
    ) -> SwitchboardResult<RemoteRunState> {
        let result = self.get_run_status(base_url, remote_run_id).await?;
        Ok(match result.status {
            RunStatus::Completed => RemoteRunState::Completed(result.text()),
            RunStatus::Failed => RemoteRunState::Failed(
                result
                    .error_message()
                    .unwrap_or_else(|| "Remote run failed".to_string()),
            ),
            RunStatus::Cancelled => RemoteRunState::Failed(
                result
                    .error_message()
                    .unwrap_or_else(|| "Remote run was cancelled".to_string()),
            ),
            _ => RemoteRunState::Running,
        })
    }
}

/// Owns every delegation run and the background poller for remote runs.
pub struct DelegationTracker {
    runs: Mutex<HashMap<String, DelegationRun>>,
    status_source: Option<Arc<dyn RunStatusSource>>,
    progress: Arc<dyn ProgressSink>,
    notifier: Arc<dyn NotificationSink>,
    poll_interval: Duration,
    poller: Mutex<Option<JoinHandle<()>>>,
    me: Weak<DelegationTracker>,
}

/// Builder for [`DelegationTracker`].
pub struct TrackerBuilder {
    status_source: Option<Arc<dyn RunStatusSource>>,
    progress: Arc<dyn ProgressSink>,
    notifier: Arc<dyn NotificationSink>,
    poll_interval: Duration,
}

impl TrackerBuilder {
    pub fn status_source(mut self, source: Arc<dyn RunStatusSource>) -> Self {
        self.status_source = Some(source);
        self
    }

    pub fn progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifier = sink;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn build(self) -> Arc<DelegationTracker> {
        Arc::new_cyclic(|me| DelegationTracker {
            runs: Mutex::new(HashMap::new()),
            status_source: self.status_source,
            progress: self.progress,
            notifier: self.notifier,
            poll_interval: self.poll_interval,
            poller: Mutex::new(None),
            me: me.clone(),
        })
    }
}

impl DelegationTracker {
    pub fn builder() -> TrackerBuilder {
        TrackerBuilder {
            status_source: None,
            progress: Arc::new(TracingProgressSink),
            notifier: Arc::new(NoopNotificationSink),
            poll_interval: Duration::from_secs(3),
        }
    }

    /// Track a new run. A run with the same id is replaced.
    pub fn record(&self, run: DelegationRun) {
        debug!(run_id = %run.run_id, agent = %run.agent_name, "Tracking delegation run");
        if let Some(old) = self.runs.lock().insert(run.run_id.clone(), run) {
            warn!(run_id = %old.run_id, "Replaced existing delegation run");
        }
    }

    pub fn mark_running(&self, run_id: &str) -> bool {
        self.transition(run_id, RunState::Running, |_| {})
    }

    pub fn complete(&self, run_id: &str, output: DelegationOutput) -> bool {
        let done = self.transition(run_id, RunState::Completed, |run| {
            run.result = Some(output);
        });
        if done {
            self.announce(run_id);
        }
        done
    }

    pub fn fail(&self, run_id: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        let done = self.transition(run_id, RunState::Failed, |run| {
            run.error = Some(error);
        });
        if done {
            self.announce(run_id);
        }
        done
    }

    pub fn set_progress(&self, run_id: &str, progress: impl Into<String>) {
        if let Some(run) = self.runs.lock().get_mut(run_id) {
            run.progress = Some(progress.into());
        }
    }

    /// Attach the remote coordinates of a run and make sure the poller is
    /// running.
    pub fn set_remote(&self, run_id: &str, base_url: impl Into<String>, remote_run_id: impl Into<String>) {
        {
            let mut runs = self.runs.lock();
            let Some(run) = runs.get_mut(run_id) else {
                warn!(run_id, "Remote id for unknown run");
                return;
            };
            run.base_url = Some(base_url.into());
            run.remote_run_id = Some(remote_run_id.into());
        }
        self.ensure_poller();
    }

    fn transition(&self, run_id: &str, next: RunState, apply: impl FnOnce(&mut DelegationRun)) -> bool {
        let mut runs = self.runs.lock();
        let Some(run) = runs.get_mut(run_id) else {
            warn!(run_id, status = %next, "Transition for unknown run");
            return false;
        };
        if !run.status.can_transition_to(next) {
            warn!(run_id, from = %run.status, to = %next, "Ignoring backward run transition");
            return false;
        }
        run.status = next;
        if next.is_terminal() {
            run.end_time = Some(Utc::now());
        }
        apply(run);
        true
    }

    pub fn get(&self, run_id: &str) -> Option<DelegationRun> {
        self.runs.lock().get(run_id).cloned()
    }

    /// Every run, oldest first.
    pub fn list(&self) -> Vec<DelegationRun> {
        let mut runs: Vec<_> = self.runs.lock().values().cloned().collect();
        runs.sort_by_key(|r| r.start_time);
        runs
    }

    pub fn list_for_session(&self, parent_session_id: &str) -> Vec<DelegationRun> {
        self.list()
            .into_iter()
            .filter(|r| r.parent_session_id == parent_session_id)
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.runs
            .lock()
            .values()
            .filter(|r| r.status == RunState::Running)
            .count()
    }

    fn pollable_count(&self) -> usize {
        self.runs.lock().values().filter(|r| r.is_pollable()).count()
    }

    /// Evict terminal runs that ended more than `max_age` ago. Returns how
    /// many were removed.
    pub fn cleanup_old_delegated_runs(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;
        let mut runs = self.runs.lock();
        let before = runs.len();
        runs.retain(|_, run| {
            !(run.status.is_terminal() && run.end_time.unwrap_or(run.start_time) < cutoff)
        });
        let removed = before - runs.len();
        if removed > 0 {
            info!(removed, "Cleaned up old delegation runs");
        }
        removed
    }

    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Start the poller unless it is already running.
    pub fn ensure_poller(&self) {
        let Some(source) = self.status_source.clone() else {
            debug!("No status source configured; remote runs will not be polled");
            return;
        };
        let mut poller = self.poller.lock();
        if poller.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return;
        }
        debug!(interval_ms = self.poll_interval.as_millis() as u64, "Starting delegation poller");
        *poller = Some(tokio::spawn(poll_loop(
            self.me.clone(),
            source,
            self.poll_interval,
        )));
    }

    /// Stop the poller if it is running.
    pub fn stop_poller(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
    }

    /// Poll every pollable run once.
    pub async fn poll_once(&self, source: &dyn RunStatusSource) {
        let targets: Vec<(String, String, String)> = self
            .runs
            .lock()
            .values()
            .filter(|r| r.is_pollable())
            .filter_map(|r| {
                Some((
                    r.run_id.clone(),
                    r.base_url.clone()?,
                    r.remote_run_id.clone()?,
                ))
            })
            .collect();

        for (run_id, base_url, remote_run_id) in targets {
            match source.fetch_status(&base_url, &remote_run_id).await {
                Ok(RemoteRunState::Running) => {
                    debug!(run_id = %run_id, "Remote run still running");
                }
                Ok(RemoteRunState::Completed(text)) => {
                    let output = DelegationOutput::text(text)
                        .with_metadata("runId", serde_json::json!(remote_run_id));
                    self.complete(&run_id, output);
                }
                Ok(RemoteRunState::Failed(error)) => {
                    self.fail(&run_id, error);
                }
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Failed to poll remote run");
                }
            }
        }
    }

    fn announce(&self, run_id: &str) {
        let Some(run) = self.get(run_id) else {
            return;
        };
        if !run.announce {
            return;
        }
        let agent = run.agent_name.as_str();
        let elapsed = format_elapsed(run.elapsed());
        let (title, status, detail) = match (&run.result, &run.error) {
            (Some(output), _) => (
                format!("Delegation to {agent} completed"),
                "completed",
                excerpt(&output.text),
            ),
            (None, error) => (
                format!("Delegation to {agent} failed"),
                "failed",
                excerpt(error.as_deref().unwrap_or("unknown error")),
            ),
        };

        self.progress.emit(AgentProgressUpdate {
            session_id: run.parent_session_id.clone(),
            current_iteration: 1,
            max_iterations: 1,
            is_complete: true,
            steps: vec![ProgressStep::new("delegation", title.clone(), status).with_description(detail.clone())],
            final_content: run.result.as_ref().map(|o| o.text.clone()),
        });

        let body = if detail.is_empty() {
            format!("Finished in {elapsed}")
        } else {
            format!("Finished in {elapsed}: {detail}")
        };
        self.notifier.notify(&title, &body);
    }
}

async fn poll_loop(tracker: Weak<DelegationTracker>, source: Arc<dyn RunStatusSource>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(tracker) = tracker.upgrade() else {
            break;
        };
        tracker.poll_once(source.as_ref()).await;

        let mut poller = tracker.poller.lock();
        if tracker.pollable_count() == 0 {
            debug!("No remote runs left; stopping delegation poller");
            *poller = None;
            break;
        }
    }
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}
