use crate::protocol::{ContentBlock, JsonRpcError, SessionUpdate};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use switchboard_core::{SwitchboardError, SwitchboardResult};
use tokio::sync::{oneshot, watch};
use tracing::debug;

type Waiter = oneshot::Sender<SwitchboardResult<Value>>;

/// Content accumulated from `session/update` notifications for one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionTranscript {
    /// Content blocks in arrival order.
    pub blocks: Vec<ContentBlock>,
    /// Set once any update flagged the turn as finished.
    pub is_complete: bool,
    /// Last stop reason the agent reported.
    pub stop_reason: Option<String>,
}

impl SessionTranscript {
    /// Concatenated text of every text block from `start` onward.
    pub fn text_from(&self, start: usize) -> String {
        self.blocks
            .iter()
            .skip(start)
            .filter_map(ContentBlock::as_text)
            .collect()
    }

    /// Concatenated text of the whole transcript.
    pub fn text(&self) -> String {
        self.text_from(0)
    }
}

/// Per-process protocol state: request ids, waiting callers, handshake flags
/// and session transcripts.
///
/// Lives exactly as long as the agent process. Closing it fails every pending
/// caller once and leaves the pending map empty.
pub struct ProtocolSession {
    agent: String,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Waiter>>,
    initialized: AtomicBool,
    session_id: Mutex<Option<String>>,
    transcripts: Mutex<HashMap<String, SessionTranscript>>,
    handshake: tokio::sync::Mutex<()>,
    turn: tokio::sync::Mutex<()>,
    closed: watch::Sender<bool>,
}

/// Removes a request's waiter when the caller stops waiting for it.
///
/// Dropping the guard after the response was delivered is a no-op, since
/// `resolve` already took the entry and ids are never reused.
pub struct PendingGuard<'a> {
    session: &'a ProtocolSession,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.forget(self.id);
    }
}

impl ProtocolSession {
    /// Fresh state for a newly spawned agent process.
    pub fn new(agent: impl Into<String>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            agent: agent.into(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            session_id: Mutex::new(None),
            transcripts: Mutex::new(HashMap::new()),
            handshake: tokio::sync::Mutex::new(()),
            turn: tokio::sync::Mutex::new(()),
            closed,
        }
    }

    /// Name of the agent this state belongs to.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Allocate the next request id and park a waiter for it.
    ///
    /// Must be called before the request is written so a fast reply always
    /// finds its waiter.
    pub fn register(&self) -> SwitchboardResult<(u64, oneshot::Receiver<SwitchboardResult<Value>>)> {
        if self.is_closed() {
            return Err(SwitchboardError::Transport(format!(
                "Agent '{}' process is not running",
                self.agent
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        Ok((id, rx))
    }

    /// Tie the waiter for `id` to the returned guard's lifetime.
    pub fn track(&self, id: u64) -> PendingGuard<'_> {
        PendingGuard { session: self, id }
    }

    /// Deliver a response to its waiter. Returns false for unknown ids
    /// (late, duplicate, or never issued).
    pub fn resolve(&self, id: u64, outcome: Result<Value, JsonRpcError>) -> bool {
        let Some(waiter) = self.pending.lock().remove(&id) else {
            return false;
        };
        let _ = waiter.send(outcome.map_err(JsonRpcError::into_error));
        true
    }

    /// Drop a waiter without answering it.
    pub fn forget(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    /// Reject every pending caller with `reason`. Returns how many were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(u64, Waiter)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (id, waiter) in drained {
            debug!(agent = %self.agent, id, reason, "Failing pending request");
            let _ = waiter.send(Err(SwitchboardError::Transport(reason.to_string())));
        }
        count
    }

    /// Fail all pending callers and mark the session as closed.
    pub fn close(&self, reason: &str) -> usize {
        let failed = self.fail_all(reason);
        self.closed.send_replace(true);
        failed
    }

    /// Whether the process behind this state has gone away.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// A receiver that observes the transition to closed.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Record that the agent answered `initialize`.
    pub fn set_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Whether `initialize` has been answered for this process.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// The protocol session id returned by `session/new`, once known.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// Cache the protocol session id.
    pub fn set_session_id(&self, id: impl Into<String>) {
        *self.session_id.lock() = Some(id.into());
    }

    /// Serializes handshake steps. A caller holding it sees either no
    /// handshake progress or a fully answered step, never one in flight.
    pub async fn handshake_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.handshake.lock().await
    }

    /// Serializes prompt turns. Updates for the session arrive untagged by
    /// request, so only one turn may be collecting at a time.
    pub async fn turn_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.turn.lock().await
    }

    /// Append a session update to its session's transcript.
    ///
    /// Updates without a session id are attributed to the cached session.
    pub fn record_update(&self, update: &SessionUpdate) {
        let key = update
            .session_id
            .clone()
            .or_else(|| self.session_id())
            .unwrap_or_default();
        let mut transcripts = self.transcripts.lock();
        let transcript = transcripts.entry(key).or_default();
        transcript.blocks.extend(update.content.iter().cloned());
        if update.is_complete {
            transcript.is_complete = true;
        }
        if update.stop_reason.is_some() {
            transcript.stop_reason = update.stop_reason.clone();
        }
    }

    /// Snapshot of a session's transcript.
    pub fn transcript(&self, session_id: &str) -> Option<SessionTranscript> {
        self.transcripts.lock().get(session_id).cloned()
    }

    /// Number of blocks recorded so far for a session.
    pub fn transcript_len(&self, session_id: &str) -> usize {
        self.transcripts
            .lock()
            .get(session_id)
            .map_or(0, |t| t.blocks.len())
    }
}
