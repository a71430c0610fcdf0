use crate::sse::SseDecoder;
use crate::types::{RunMessage, RunMode, RunRequest, RunResult, RunStatus};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{
    AgentAuth, AgentDefinition, AgentRegistry, AgentStatus, DelegationSettings, SwitchboardError,
    SwitchboardResult,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Timing for the HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Upper bound for sync calls, async submissions and status polls.
    /// Streams are bounded only by cancellation.
    pub timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self::from(&DelegationSettings::default())
    }
}

impl From<&DelegationSettings> for HttpTransportConfig {
    fn from(settings: &DelegationSettings) -> Self {
        Self {
            timeout: settings.http_timeout(),
        }
    }
}

/// One call to a remote agent.
#[derive(Debug, Clone)]
pub struct RunInvocation {
    /// Local id under which the call can be cancelled.
    pub run_id: String,
    pub agent_name: String,
    pub task: String,
    pub context: Option<String>,
    /// Caller-owned token; cancelling it aborts this call.
    pub cancel: Option<CancellationToken>,
}

impl RunInvocation {
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

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

struct ActiveRun {
    agent: String,
    token: CancellationToken,
}

type ActiveRuns = Arc<Mutex<HashMap<String, ActiveRun>>>;

/// Removes a run's bookkeeping when the call ends, however it ends.
struct ActiveRunGuard {
    active: ActiveRuns,
    run_id: String,
}

impl ActiveRunGuard {
    /// Move the record to a server-assigned id.
    fn rekey(&mut self, new_id: &str) {
        if new_id == self.run_id {
            return;
        }
        let mut active = self.active.lock();
        if let Some(run) = active.remove(&self.run_id) {
            active.insert(new_id.to_string(), run);
        }
        debug!(local = %self.run_id, remote = %new_id, "Re-keyed active run");
        self.run_id = new_id.to_string();
    }
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.run_id);
    }
}

/// Talks to agents that expose the `/runs` HTTP interface.
pub struct HttpTransport {
    http: reqwest::Client,
    registry: Arc<AgentRegistry>,
    active: ActiveRuns,
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(registry: Arc<AgentRegistry>, config: HttpTransportConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            registry,
            active: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Run to completion and return the full result.
    pub async fn run_sync(&self, invocation: RunInvocation) -> SwitchboardResult<RunResult> {
        let definition = self.resolve(&invocation.agent_name)?;
        let (token, _guard) = self.track(&invocation);
        let body = RunRequest::new(
            &invocation.agent_name,
            &invocation.task,
            invocation.context.as_deref(),
            RunMode::Sync,
        );

        let call = async {
            let response = self.post_run(&definition, &body, false).await?;
            parse_result(response).await
        };
        let mut result = with_cancel(&token, &invocation.run_id, call).await?;
        result.run_id.get_or_insert_with(|| invocation.run_id.clone());
        self.mark_reachable(&definition.name);
        Ok(result)
    }

    /// Submit the run and return as soon as the server accepts it.
    ///
    /// The returned `run_id` is the server's id when it assigned one.
    /// Cancelling after acceptance only affects the local side.
    pub async fn run_async(&self, invocation: RunInvocation) -> SwitchboardResult<RunResult> {
        let definition = self.resolve(&invocation.agent_name)?;
        let (token, mut guard) = self.track(&invocation);
        let body = RunRequest::new(
            &invocation.agent_name,
            &invocation.task,
            invocation.context.as_deref(),
            RunMode::Async,
        );

        let call = async {
            let response = self.post_run(&definition, &body, false).await?;
            parse_result(response).await
        };
        let mut result = with_cancel(&token, &invocation.run_id, call).await?;
        match result.run_id.as_deref() {
            Some(remote) => guard.rekey(remote),
            None => result.run_id = Some(invocation.run_id.clone()),
        }
        info!(
            agent = %definition.name,
            run_id = result.run_id.as_deref().unwrap_or_default(),
            status = %result.status,
            "Async run accepted"
        );
        self.mark_reachable(&definition.name);
        Ok(result)
    }

    /// Stream the run, invoking `on_chunk` for every piece of text as it
    /// arrives.
    pub async fn run_stream<F>(
        &self,
        invocation: RunInvocation,
        mut on_chunk: F,
    ) -> SwitchboardResult<RunResult>
    where
        F: FnMut(&str) + Send,
    {
        let definition = self.resolve(&invocation.agent_name)?;
        let (token, _guard) = self.track(&invocation);
        let body = RunRequest::new(
            &invocation.agent_name,
            &invocation.task,
            invocation.context.as_deref(),
            RunMode::Stream,
        );

        let call = async {
            let response = self.post_run(&definition, &body, true).await?;
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut state = StreamState::default();

            while let Some(chunk) = stream.next().await {
                let chunk = chunk
                    .map_err(|e| SwitchboardError::Http(format!("Stream read error: {e}")))?;
                for payload in decoder.feed(&chunk) {
                    state.apply(&payload, &mut on_chunk);
                }
            }
            if let Some(payload) = decoder.finish() {
                state.apply(&payload, &mut on_chunk);
            }
            state.into_result(&invocation.run_id)
        };

        let result = with_cancel(&token, &invocation.run_id, call).await?;
        self.mark_reachable(&definition.name);
        Ok(result)
    }

    /// `GET {base_url}/runs/{run_id}`.
    pub async fn get_run_status(&self, base_url: &str, run_id: &str) -> SwitchboardResult<RunResult> {
        let url = format!("{}/runs/{run_id}", base_url.trim_end_matches('/'));
        let mut request = self.http.get(&url).timeout(self.config.timeout);
        if let Some(auth) = self.auth_for_base_url(base_url) {
            request = apply_auth(request, &auth);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;
        let response = check_status(response).await?;
        parse_result(response).await
    }

    /// Abort an in-flight call. Returns false if no call is tracked under
    /// that id.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        let Some(run) = self.active.lock().remove(run_id) else {
            return false;
        };
        info!(run_id, agent = %run.agent, "Cancelling HTTP run");
        run.token.cancel();
        true
    }

    /// Abort every in-flight call. Returns how many were cancelled.
    pub fn cancel_all_runs(&self) -> usize {
        let drained: Vec<(String, ActiveRun)> = self.active.lock().drain().collect();
        for (run_id, run) in &drained {
            debug!(run_id = %run_id, agent = %run.agent, "Cancelling HTTP run");
            run.token.cancel();
        }
        drained.len()
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.active.lock().contains_key(run_id)
    }

    pub fn active_run_count(&self) -> usize {
        self.active.lock().len()
    }

    fn resolve(&self, agent_name: &str) -> SwitchboardResult<AgentDefinition> {
        let instance = self
            .registry
            .get(agent_name)
            .ok_or_else(|| SwitchboardError::Config(format!("Unknown agent '{agent_name}'")))?;
        let definition = instance.definition;
        if !definition.enabled {
            return Err(SwitchboardError::Config(format!(
                "Agent '{agent_name}' is disabled"
            )));
        }
        if definition.base_url().is_none() {
            return Err(SwitchboardError::Config(format!(
                "Agent '{agent_name}' has no base URL configured"
            )));
        }
        Ok(definition)
    }

    fn track(&self, invocation: &RunInvocation) -> (CancellationToken, ActiveRunGuard) {
        let token = invocation
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        self.active.lock().insert(
            invocation.run_id.clone(),
            ActiveRun {
                agent: invocation.agent_name.clone(),
                token: token.clone(),
            },
        );
        let guard = ActiveRunGuard {
            active: self.active.clone(),
            run_id: invocation.run_id.clone(),
        };
        (token, guard)
    }

    fn mark_reachable(&self, agent_name: &str) {
        let current = self.registry.get(agent_name).map(|a| a.status);
        if !matches!(current, Some(AgentStatus::Ready | AgentStatus::Busy)) {
            self.registry.set_status(agent_name, AgentStatus::Ready, None);
        }
    }

    fn auth_for_base_url(&self, base_url: &str) -> Option<AgentAuth> {
        let wanted = base_url.trim_end_matches('/');
        self.registry.list().into_iter().find_map(|agent| {
            let url = agent.definition.base_url()?.trim_end_matches('/');
            if url == wanted {
                agent.definition.auth.clone()
            } else {
                None
            }
        })
    }

    async fn post_run(
        &self,
        definition: &AgentDefinition,
        body: &RunRequest,
        stream: bool,
    ) -> SwitchboardResult<reqwest::Response> {
        let base_url = definition.base_url().unwrap_or_default();
        let url = format!("{}/runs", base_url.trim_end_matches('/'));
        debug!(agent = %definition.name, url = %url, mode = ?body.mode, "Posting run");

        let mut request = self.http.post(&url).json(body);
        request = if stream {
            request.header(reqwest::header::ACCEPT, "text/event-stream")
        } else {
            request.timeout(self.config.timeout)
        };
        if let Some(auth) = &definition.auth {
            request = apply_auth(request, auth);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        check_status(response).await
    }
}

async fn with_cancel<T>(
    token: &CancellationToken,
    run_id: &str,
    call: impl Future<Output = SwitchboardResult<T>>,
) -> SwitchboardResult<T> {
    tokio::select! {
        _ = token.cancelled() => Err(SwitchboardError::Cancelled(format!("Run '{run_id}' was cancelled"))),
        result = call => result,
    }
}

fn apply_auth(request: reqwest::RequestBuilder, auth: &AgentAuth) -> reqwest::RequestBuilder {
    match auth {
        AgentAuth::Bearer { bearer_token } => request.bearer_auth(bearer_token),
        AgentAuth::Header { header, value } => request.header(header.as_str(), value.as_str()),
    }
}

fn map_reqwest_error(e: reqwest::Error) -> SwitchboardError {
    if e.is_timeout() {
        SwitchboardError::Timeout(format!("HTTP request timed out: {e}"))
    } else {
        SwitchboardError::Http(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> SwitchboardResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    Err(SwitchboardError::Http(format!("{status}: {body}")))
}

async fn parse_result(response: reqwest::Response) -> SwitchboardResult<RunResult> {
    let text = response.text().await.map_err(map_reqwest_error)?;
    serde_json::from_str(&text)
        .map_err(|e| SwitchboardError::Http(format!("Invalid run result: {e}: {text}")))
}

/// Accumulates stream events until the body ends.
#[derive(Default)]
struct StreamState {
    text: String,
    last_event: Option<Value>,
}

impl StreamState {
    fn apply<F: FnMut(&str)>(&mut self, payload: &str, on_chunk: &mut F) {
        for event in parse_payload(payload) {
            let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
            match kind {
                "chunk" | "content" => {
                    if let Some(thought) = event.get("thought").and_then(Value::as_str) {
                        debug!(thought, "Agent thought");
                    }
                    if let Some(text) = event_text(&event) {
                        if !text.is_empty() {
                            on_chunk(text);
                            self.text.push_str(text);
                        }
                    }
                }
                "result" | "complete" => {
                    self.last_event = Some(event);
                }
                "error" => {
                    let error = event
                        .get("error")
                        .cloned()
                        .or_else(|| event.get("content").cloned())
                        .unwrap_or_else(|| json!("stream error"));
                    self.last_event = Some(json!({ "status": "failed", "error": error }));
                }
                other => debug!(event_type = other, "Ignoring stream event"),
            }
        }
    }

    fn into_result(self, run_id: &str) -> SwitchboardResult<RunResult> {
        let mut merged = json!({
            "run_id": run_id,
            "status": RunStatus::Completed,
            "output": [RunMessage::new("agent", self.text.clone())],
        });
        if let Some(event) = self.last_event {
            let event = match event.get("result") {
                Some(inner @ Value::Object(_)) => inner.clone(),
                _ => event,
            };
            if let (Value::Object(target), Value::Object(source)) = (&mut merged, event) {
                for (key, value) in source {
                    let keep_default = key == "type"
                        || value.is_null()
                        || (key == "output" && value.as_array().map_or(true, Vec::is_empty));
                    if !keep_default {
                        target.insert(key, value);
                    }
                }
            }
        }
        serde_json::from_value(merged)
            .map_err(|e| SwitchboardError::Http(format!("Invalid final stream result: {e}")))
    }
}

/// One SSE payload usually holds one JSON event, but some servers omit the
/// blank separator line; fall back to parsing each line.
fn parse_payload(payload: &str) -> Vec<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(payload) {
        return vec![value];
    }
    payload
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(line, error = %e, "Skipping malformed stream event");
                None
            }
        })
        .collect()
}

fn event_text(event: &Value) -> Option<&str> {
    match event.get("content")? {
        Value::String(s) => Some(s),
        Value::Object(map) => map.get("text").and_then(Value::as_str),
        _ => None,
    }
}
