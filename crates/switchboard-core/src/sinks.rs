use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// One step in a delegation progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ProgressStep {
    /// Creates a step stamped with the current time.
    pub fn new(step_type: impl Into<String>, title: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            step_type: step_type.into(),
            title: title.into(),
            description: None,
            status: status.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A delegation lifecycle event pushed toward the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProgressUpdate {
    pub session_id: String,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub is_complete: bool,
    pub steps: Vec<ProgressStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,
}

/// Receives delegation progress records. Rendering is the host's concern.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, update: AgentProgressUpdate);
}

/// Raises user-facing notifications. Unsupported platforms make this a no-op.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Progress sink that writes every record to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn emit(&self, update: AgentProgressUpdate) {
        info!(
            session_id = %update.session_id,
            complete = update.is_complete,
            steps = update.steps.len(),
            "Delegation progress"
        );
    }
}

/// Notification sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotificationSink;

impl NotificationSink for NoopNotificationSink {
    fn notify(&self, _title: &str, _body: &str) {}
}
