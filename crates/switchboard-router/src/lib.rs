//! Delegation actions for a calling agent.
//!
//! [`DelegationRouter`] maps action names to the registry, transports,
//! tracker and executor, and always answers with a success/error
//! [`switchboard_core::ToolResult`]. [`Switchboard`] builds every component
//! from a [`switchboard_core::SwitchboardConfig`] and owns their lifecycle.

/// Component wiring and lifecycle.
pub mod hub;
/// Action dispatch table.
pub mod router;

pub use hub::Switchboard;
pub use router::{
    describe_failure, AgentLifecycle, DelegationRouter, CHECK_STATUS, DELEGATE, LIST_AGENTS,
    SPAWN_AGENT, STOP_AGENT,
};
