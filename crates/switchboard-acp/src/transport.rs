//! Stdio transport: one subprocess per agent, JSON-RPC 2.0 over its pipes.

use crate::framing::LineDecoder;
use crate::protocol::{
    methods, AcpNotification, ContentBlock, IncomingMessage, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, PROTOCOL_VERSION,
};
use crate::session::{ProtocolSession, SessionTranscript};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{
    AgentRegistry, AgentStatus, DelegationOutput, DelegationSettings, SwitchboardError,
    SwitchboardResult, TransportConfig, METHOD_NOT_FOUND,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EXITED_UNEXPECTEDLY: &str = "process exited unexpectedly";
const AGENT_STOPPED: &str = "agent stopped";

/// Timing for the stdio transport.
#[derive(Debug, Clone)]
pub struct StdioTransportConfig {
    /// How long a request may wait for its response.
    pub request_timeout: Duration,
    /// How long a fresh process must stay alive before it counts as ready.
    pub settle_delay: Duration,
    /// Time between SIGTERM and a hard kill on stop.
    pub stop_grace: Duration,
}

impl Default for StdioTransportConfig {
    fn default() -> Self {
        Self::from(&DelegationSettings::default())
    }
}

impl From<&DelegationSettings> for StdioTransportConfig {
    fn from(settings: &DelegationSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout(),
            settle_delay: settings.settle_delay(),
            stop_grace: settings.stop_grace(),
        }
    }
}

/// A notification received from an agent, tagged with the agent's name.
#[derive(Debug, Clone)]
pub struct AgentNotification {
    /// Agent that sent the notification.
    pub agent: String,
    /// The decoded notification.
    pub notification: AcpNotification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Ready,
    Exited,
}

/// A running agent process and its protocol state.
struct AgentProcess {
    session: Arc<ProtocolSession>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Child>,
    pid: Option<u32>,
    phase: Mutex<Phase>,
    stopping: AtomicBool,
}

impl AgentProcess {
    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }
}

/// Spawns and supervises stdio agents and runs the JSON-RPC protocol over
/// their standard streams.
pub struct StdioTransport {
    registry: Arc<AgentRegistry>,
    processes: Mutex<HashMap<String, Arc<AgentProcess>>>,
    spawn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    notifications: broadcast::Sender<AgentNotification>,
    config: StdioTransportConfig,
}

impl StdioTransport {
    /// A transport with no running processes.
    pub fn new(registry: Arc<AgentRegistry>, config: StdioTransportConfig) -> Self {
        let (notifications, _) = broadcast::channel(1024);
        Self {
            registry,
            processes: Mutex::new(HashMap::new()),
            spawn_locks: Mutex::new(HashMap::new()),
            notifications,
            config,
        }
    }

    /// Subscribe to notifications from every agent.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentNotification> {
        self.notifications.subscribe()
    }

    /// Whether a live process exists for the agent.
    pub fn is_running(&self, name: &str) -> bool {
        self.process(name)
            .map_or(false, |p| !p.session.is_closed())
    }

    /// Number of requests awaiting a response from the agent.
    pub fn pending_requests(&self, name: &str) -> usize {
        self.process(name)
            .map_or(0, |p| p.session.pending_count())
    }

    fn process(&self, name: &str) -> Option<Arc<AgentProcess>> {
        self.processes.lock().get(name).cloned()
    }

    fn spawn_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.spawn_locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Launch the agent's process and wait for it to settle.
    ///
    /// Idempotent: an agent that is already ready is left untouched.
    pub async fn spawn_agent(&self, name: &str) -> SwitchboardResult<()> {
        let instance = self
            .registry
            .get(name)
            .ok_or_else(|| SwitchboardError::Config(format!("Unknown agent '{name}'")))?;
        if !instance.definition.enabled {
            return Err(SwitchboardError::Config(format!("Agent '{name}' is disabled")));
        }
        let (command, args, env) = match &instance.definition.transport {
            TransportConfig::Stdio { command, args, env } if !command.trim().is_empty() => {
                (command.clone(), args.clone(), env.clone())
            }
            TransportConfig::Stdio { .. } => {
                return Err(SwitchboardError::Config(format!(
                    "Agent '{name}' has no command configured"
                )))
            }
            TransportConfig::Http { .. } => {
                return Err(SwitchboardError::Config(format!(
                    "Agent '{name}' does not use the stdio transport"
                )))
            }
        };

        let lock = self.spawn_lock(name);
        let _guard = lock.lock().await;

        if self.is_running(name)
            && self
                .registry
                .get(name)
                .map_or(false, |a| a.accepts_requests())
        {
            debug!(agent = %name, "Agent already running");
            return Ok(());
        }

        self.registry.set_status(name, AgentStatus::Starting, None);
        info!(agent = %name, command = %command, "Spawning agent");

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .envs(&env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to spawn agent '{name}' ({command}): {e}");
                self.registry
                    .set_status(name, AgentStatus::Error, Some(message.clone()));
                return Err(SwitchboardError::Transport(message));
            }
        };

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
            let message = format!("Agent '{name}' stdio pipes not available");
            let _ = child.start_kill();
            self.registry
                .set_status(name, AgentStatus::Error, Some(message.clone()));
            return Err(SwitchboardError::Transport(message));
        };

        let session = Arc::new(ProtocolSession::new(name));
        let process = Arc::new(AgentProcess {
            session: session.clone(),
            stdin: tokio::sync::Mutex::new(stdin),
            pid: child.id(),
            child: tokio::sync::Mutex::new(child),
            phase: Mutex::new(Phase::Starting),
            stopping: AtomicBool::new(false),
        });

        if let Some(old) = self.processes.lock().insert(name.to_string(), process.clone()) {
            old.session.close(EXITED_UNEXPECTEDLY);
        }

        tokio::spawn(forward_stderr(name.to_string(), stderr));
        tokio::spawn(read_stdout(
            name.to_string(),
            stdout,
            process.clone(),
            self.registry.clone(),
            self.notifications.clone(),
        ));

        self.settle(name, &process).await
    }

    async fn settle(&self, name: &str, process: &Arc<AgentProcess>) -> SwitchboardResult<()> {
        let mut closed = process.session.closed_signal();
        let exited_early = tokio::time::timeout(self.config.settle_delay, closed.wait_for(|c| *c))
            .await
            .is_ok();

        let failure = {
            let mut phase = process.phase.lock();
            if exited_early || *phase == Phase::Exited {
                Some(())
            } else {
                *phase = Phase::Ready;
                self.registry.set_status(name, AgentStatus::Ready, None);
                None
            }
        };

        if failure.is_none() {
            info!(agent = %name, "Agent ready");
            return Ok(());
        }

        let status = process.child.lock().await.try_wait().ok().flatten();
        let message = match status {
            Some(status) => format!("Agent '{name}' exited during startup ({status})"),
            None => format!("Agent '{name}' exited during startup"),
        };
        self.remove_process(name, process);
        self.registry
            .set_status(name, AgentStatus::Error, Some(message.clone()));
        error!(agent = %name, error = %message, "Agent failed to start");
        Err(SwitchboardError::Transport(message))
    }

    fn remove_process(&self, name: &str, process: &Arc<AgentProcess>) {
        let mut processes = self.processes.lock();
        if processes
            .get(name)
            .map_or(false, |current| Arc::ptr_eq(current, process))
        {
            processes.remove(name);
        }
    }

    /// Stop an agent: fail its pending requests, ask it to terminate, and
    /// kill it if it is still alive after the grace period.
    pub async fn stop_agent(&self, name: &str) -> SwitchboardResult<()> {
        if !self.registry.contains(name) {
            return Err(SwitchboardError::Config(format!("Unknown agent '{name}'")));
        }
        let Some(process) = self.processes.lock().remove(name) else {
            debug!(agent = %name, "Stop requested for agent that is not running");
            return Ok(());
        };

        process.stopping.store(true, Ordering::SeqCst);
        let failed = process.session.fail_all(AGENT_STOPPED);
        info!(agent = %name, failed_requests = failed, "Stopping agent");

        let mut child = process.child.lock().await;
        request_terminate(&mut child, process.pid);
        match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(agent = %name, %status, "Agent exited"),
            Ok(Err(e)) => warn!(agent = %name, error = %e, "Failed to wait for agent exit"),
            Err(_) => {
                warn!(agent = %name, "Agent ignored terminate signal, killing");
                if let Err(e) = child.kill().await {
                    warn!(agent = %name, error = %e, "Failed to kill agent");
                }
            }
        }
        drop(child);

        process.session.close(AGENT_STOPPED);
        *process.phase.lock() = Phase::Exited;
        self.registry.set_status(name, AgentStatus::Stopped, None);
        Ok(())
    }

    /// Stop every running agent.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.processes.lock().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop_agent(&name).await {
                warn!(agent = %name, error = %e, "Failed to stop agent");
            }
        }
    }

    fn ready_process(&self, name: &str) -> SwitchboardResult<Arc<AgentProcess>> {
        let instance = self
            .registry
            .get(name)
            .ok_or_else(|| SwitchboardError::Config(format!("Unknown agent '{name}'")))?;
        if !instance.accepts_requests() {
            return Err(SwitchboardError::Transport(format!(
                "Agent '{name}' is not ready (status: {})",
                instance.status
            )));
        }
        self.process(name)
            .ok_or_else(|| SwitchboardError::Transport(format!("Agent '{name}' is not running")))
    }

    /// Send a JSON-RPC request and wait for the matching response.
    pub async fn send_request(
        &self,
        name: &str,
        method: &str,
        params: Option<Value>,
    ) -> SwitchboardResult<Value> {
        let process = self.ready_process(name)?;
        let (id, rx) = process.session.register()?;
        let _pending = process.session.track(id);
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        debug!(agent = %name, id, method, "Sending request");
        if let Err(e) = process.write_line(&line).await {
            let message = format!("Failed to write to agent '{name}': {e}");
            self.registry
                .set_status(name, AgentStatus::Error, Some(message.clone()));
            return Err(SwitchboardError::Transport(message));
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SwitchboardError::Transport(format!(
                "Response channel for agent '{name}' closed"
            ))),
            Err(_) => Err(SwitchboardError::Timeout(format!(
                "Request '{method}' to agent '{name}' timed out after {}s",
                self.config.request_timeout.as_secs_f64()
            ))),
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn send_notification(
        &self,
        name: &str,
        method: &str,
        params: Option<Value>,
    ) -> SwitchboardResult<()> {
        let process = self.ready_process(name)?;
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        process
            .write_line(&line)
            .await
            .map_err(|e| SwitchboardError::Transport(format!("Failed to write to agent '{name}': {e}")))
    }

    /// Negotiate capabilities once per process. Failures are tolerated.
    ///
    /// Runs under the handshake guard, so a concurrent caller waits here
    /// until the agent has answered. An agent that rejects the request is
    /// not asked again; one that never answers is retried on the next call.
    pub async fn initialize(&self, name: &str) -> SwitchboardResult<()> {
        let process = self.ready_process(name)?;
        let _handshake = process.session.handshake_guard().await;
        if process.session.is_initialized() {
            return Ok(());
        }
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientCapabilities": {
                "fs": { "readTextFile": false, "writeTextFile": false }
            },
            "clientInfo": {
                "name": "switchboard",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        match self.send_request(name, methods::INITIALIZE, Some(params)).await {
            Ok(result) => {
                process.session.set_initialized();
                debug!(agent = %name, result = %result, "Agent initialized");
            }
            Err(e @ (SwitchboardError::Rpc { .. } | SwitchboardError::MethodNotFound(_))) => {
                process.session.set_initialized();
                warn!(agent = %name, error = %e, "Initialize rejected, continuing without it");
            }
            Err(e) => warn!(agent = %name, error = %e, "Initialize failed, continuing without it"),
        }
        Ok(())
    }

    /// Return the agent's session id, creating one with `session/new` the
    /// first time.
    pub async fn ensure_session(&self, name: &str) -> SwitchboardResult<String> {
        let process = self.ready_process(name)?;
        let _handshake = process.session.handshake_guard().await;
        if let Some(id) = process.session.session_id() {
            return Ok(id);
        }

        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| ".".to_string());
        let result = self
            .send_request(
                name,
                methods::SESSION_NEW,
                Some(json!({ "cwd": cwd, "mcpServers": [] })),
            )
            .await?;
        let id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SwitchboardError::Transport(format!(
                    "Agent '{name}' returned no sessionId from session/new"
                ))
            })?
            .to_string();
        process.session.set_session_id(id.clone());
        info!(agent = %name, session_id = %id, "Agent session created");
        Ok(id)
    }

    /// Run a task through the full handshake and return the text the agent
    /// streamed back for this prompt.
    ///
    /// Turns on one agent are serialized: `session/update` frames carry no
    /// request id, so the transcript slice is only unambiguous while a single
    /// prompt is outstanding.
    pub async fn prompt(
        &self,
        name: &str,
        task: &str,
        context: Option<&str>,
    ) -> SwitchboardResult<DelegationOutput> {
        self.initialize(name).await?;
        let session_id = self.ensure_session(name).await?;
        let process = self.ready_process(name)?;
        let _turn = process.session.turn_guard().await;
        let start = process.session.transcript_len(&session_id);

        let text = match context {
            Some(context) if !context.trim().is_empty() => format!("{context}\n\n{task}"),
            _ => task.to_string(),
        };
        let params = json!({
            "sessionId": session_id,
            "prompt": [ContentBlock::text(text)],
        });
        let result = self
            .send_request(name, methods::SESSION_PROMPT, Some(params))
            .await?;

        let transcript = process.session.transcript(&session_id).unwrap_or_default();
        let mut output = transcript.text_from(start);
        if output.is_empty() {
            output = result_text(&result);
        }
        let stop_reason = result
            .get("stopReason")
            .and_then(Value::as_str)
            .map(String::from)
            .or(transcript.stop_reason);

        let mut delegation = DelegationOutput::text(output)
            .with_metadata("agent", json!(name))
            .with_metadata("sessionId", json!(session_id));
        if let Some(reason) = stop_reason {
            delegation = delegation.with_metadata("stopReason", json!(reason));
        }
        Ok(delegation)
    }

    /// Accumulated `session/update` content for one of an agent's sessions.
    pub fn session_output(&self, name: &str, session_id: &str) -> Option<SessionTranscript> {
        self.process(name)?.session.transcript(session_id)
    }

    /// The agent's cached protocol session id, if one has been created.
    pub fn session_id(&self, name: &str) -> Option<String> {
        self.process(name)?.session.session_id()
    }
}

fn result_text(result: &Value) -> String {
    match result.get("content") {
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect(),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

#[cfg(unix)]
fn request_terminate(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM failed, killing instead");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

async fn forward_stderr(agent: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(agent = %agent, line = %line, "Agent stderr"),
            Ok(None) => break,
            Err(e) => {
                debug!(agent = %agent, error = %e, "Agent stderr closed");
                break;
            }
        }
    }
}

async fn read_stdout(
    agent: String,
    mut stdout: ChildStdout,
    process: Arc<AgentProcess>,
    registry: Arc<AgentRegistry>,
    notifications: broadcast::Sender<AgentNotification>,
) {
    let mut decoder = LineDecoder::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let read = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error!(agent = %agent, error = %e, "Error reading agent stdout");
                break;
            }
        };
        for value in decoder.feed(&buf[..read]) {
            dispatch(&agent, value, &process, &notifications).await;
        }
    }
    if let Some(value) = decoder.finish() {
        dispatch(&agent, value, &process, &notifications).await;
    }

    let failed = process.session.close(EXITED_UNEXPECTEDLY);
    let previous = {
        let mut phase = process.phase.lock();
        let previous = *phase;
        *phase = Phase::Exited;
        if previous == Phase::Ready && !process.stopping.load(Ordering::SeqCst) {
            registry.set_status(&agent, AgentStatus::Stopped, None);
        }
        previous
    };
    if previous == Phase::Ready && !process.stopping.load(Ordering::SeqCst) {
        warn!(agent = %agent, failed_requests = failed, "Agent process exited");
    }
}

async fn dispatch(
    agent: &str,
    value: Value,
    process: &AgentProcess,
    notifications: &broadcast::Sender<AgentNotification>,
) {
    match IncomingMessage::classify(value) {
        IncomingMessage::Response { id: Some(id), outcome } => {
            if !process.session.resolve(id, outcome) {
                debug!(agent = %agent, id, "Ignoring response with no waiting caller");
            }
        }
        IncomingMessage::Response { id: None, .. } => {
            debug!(agent = %agent, "Ignoring response with foreign id");
        }
        IncomingMessage::Request { id, method, .. } => {
            warn!(agent = %agent, method = %method, "Agent request not supported");
            let reply = json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": JsonRpcError {
                    code: METHOD_NOT_FOUND,
                    message: format!("Client does not support '{method}'"),
                    data: None,
                },
            });
            if let Err(e) = process.write_line(&reply.to_string()).await {
                debug!(agent = %agent, error = %e, "Failed to reply to agent request");
            }
        }
        IncomingMessage::Notification(notification) => {
            match &notification {
                AcpNotification::SessionUpdate(update) => process.session.record_update(update),
                AcpNotification::Unknown { method, .. } => {
                    debug!(agent = %agent, method = %method, "Unhandled notification");
                }
            }
            let _ = notifications.send(AgentNotification {
                agent: agent.to_string(),
                notification,
            });
        }
        IncomingMessage::Invalid(value) => {
            debug!(agent = %agent, frame = %value, "Ignoring frame that is not JSON-RPC");
        }
    }
}
