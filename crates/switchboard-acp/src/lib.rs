//! Stdio transport for Switchboard agents.
//!
//! Each stdio agent runs as a child process that speaks newline-delimited
//! JSON-RPC 2.0 (the Agent Client Protocol) over stdin/stdout. This crate
//! owns process lifecycle, request/response correlation, the
//! `initialize` → `session/new` → `session/prompt` handshake, and
//! accumulation of `session/update` notifications.
//!
//! # Main types
//!
//! - [`StdioTransport`] — Spawns, supervises, and talks to stdio agents.
//! - [`ProtocolSession`] — Per-process request ids, waiters, and transcripts.
//! - [`LineDecoder`] — Splits stdout bytes into JSON frames.
//! - [`IncomingMessage`] — Classification of an inbound frame.

/// Newline-delimited JSON framing.
pub mod framing;
/// JSON-RPC and ACP message types.
pub mod protocol;
/// Per-process protocol state.
pub mod session;
/// Process supervision and request flow.
pub mod transport;

pub use framing::LineDecoder;
pub use protocol::{
    AcpNotification, ContentBlock, IncomingMessage, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, SessionUpdate,
};
pub use session::{PendingGuard, ProtocolSession, SessionTranscript};
pub use transport::{AgentNotification, StdioTransport, StdioTransportConfig};
