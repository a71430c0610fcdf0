//! HTTP transport for Switchboard agents.
//!
//! Remote agents expose `POST {base_url}/runs` and `GET {base_url}/runs/{id}`.
//! A run can be executed synchronously, submitted asynchronously and polled
//! later, or streamed as Server-Sent Events. Every in-flight call is tracked
//! under a run id with its own cancellation token so it can be aborted
//! individually or all at once.

/// Server-Sent-Events decoding.
pub mod sse;
/// Run invocation and cancellation.
pub mod transport;
/// `/runs` wire types.
pub mod types;

pub use sse::SseDecoder;
pub use transport::{HttpTransport, HttpTransportConfig, RunInvocation};
pub use types::{MessagePart, RunMessage, RunMode, RunRequest, RunResult, RunStatus};
