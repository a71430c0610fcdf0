//! Parallel delegation and run tracking for Switchboard.
//!
//! - [`ParallelOrchestrator`] fans a task group out over several agents
//!   under a concurrency cap, with fail-fast or best-effort semantics.
//! - [`DelegationTracker`] records every delegation run and polls remote
//!   runs in the background, announcing completion through the progress
//!   and notification sinks.
//! - [`DelegationExecutor`] is the seam between both and the transports;
//!   [`TransportExecutor`] is the production implementation.

/// Executor seam over the stdio and HTTP transports.
pub mod executor;
/// Bounded-concurrency group execution.
pub mod parallel;
/// Delegation run tracking and background polling.
pub mod tracker;
/// Group, task, and result types.
pub mod types;

pub use executor::{DelegationExecutor, DelegationRequest, Submission, TransportExecutor};
pub use parallel::{aggregate_results, ParallelOrchestrator, ProgressCallback};
pub use tracker::{
    DelegationRun, DelegationTracker, RemoteRunState, RunState, RunStatusSource, TrackerBuilder,
};
pub use types::{
    FailureKind, GroupProgress, GroupSnapshot, GroupStatus, ParallelExecutionResult, ParallelTask,
    ParallelTaskGroup, TaskFailure, TaskSuccess,
};
