#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use switchboard_core::*;

const CONFIG: &str = r#"
[[agents]]
name = "coder"
display_name = "Coder"
capabilities = ["code"]
transport = "stdio"
command = "coder-acp"
auto_spawn = true

[[agents]]
name = "reviewer"
capabilities = ["code", "review"]
transport = "http"
base_url = "http://localhost:8100"
[agents.auth]
bearer_token = "t0ken"
"#;

// ---------------------------------------------------------------------------
// 1. Config file -> registry
// ---------------------------------------------------------------------------

#[test]
fn test_config_populates_registry() {
    let config = SwitchboardConfig::from_toml_str(CONFIG).unwrap();
    let registry = AgentRegistry::new();
    registry.load_from_config(config.agents);

    assert_eq!(registry.agent_count(), 2);
    let coder = registry.get("coder").unwrap();
    assert_eq!(coder.definition.display_name(), "Coder");
    assert!(coder.definition.is_spawnable());
    assert_eq!(coder.status, AgentStatus::Disconnected);

    let reviewer = registry.get("reviewer").unwrap();
    assert_eq!(reviewer.definition.base_url(), Some("http://localhost:8100"));
    assert_eq!(reviewer.definition.display_name(), "reviewer");
    assert_eq!(
        reviewer.definition.auth,
        Some(AgentAuth::Bearer {
            bearer_token: "t0ken".into()
        })
    );

    let names: Vec<String> = registry
        .list_by_capability("code")
        .into_iter()
        .map(|a| a.definition.name)
        .collect();
    assert_eq!(names, vec!["coder", "reviewer"]);
    assert_eq!(registry.list_by_capability("review").len(), 1);
}

#[test]
fn test_missing_config_file_is_a_config_error() {
    let err = SwitchboardConfig::load(std::path::Path::new("/nonexistent/switchboard.toml"))
        .unwrap_err();
    assert!(matches!(err, SwitchboardError::Config(_)));
    assert!(err.to_string().contains("/nonexistent/switchboard.toml"));
}

// ---------------------------------------------------------------------------
// 2. Status transitions are broadcast
// ---------------------------------------------------------------------------

#[test]
fn test_status_changes_are_observable() {
    let registry = AgentRegistry::new();
    registry.register(AgentDefinition::stdio("coder", "coder-acp", vec![]));
    let mut changes = registry.subscribe();

    registry.set_status("coder", AgentStatus::Starting, None);
    registry.set_status("coder", AgentStatus::Error, Some("exited during startup".into()));
    registry.set_status("coder", AgentStatus::Ready, None);

    let seen: Vec<AgentStatus> = std::iter::from_fn(|| changes.try_recv().ok())
        .map(|c| c.status)
        .collect();
    assert_eq!(
        seen,
        vec![AgentStatus::Starting, AgentStatus::Error, AgentStatus::Ready]
    );

    let coder = registry.get("coder").unwrap();
    assert!(coder.last_error.is_none());
    assert!(coder.last_connected.is_some());
    assert_eq!(registry.list_ready().len(), 1);
}

#[test]
fn test_unknown_agents_are_ignored_by_mutators() {
    let registry = AgentRegistry::new();
    registry.set_status("ghost", AgentStatus::Ready, None);
    registry.increment_active_runs("ghost");
    registry.decrement_active_runs("ghost");
    assert!(!registry.contains("ghost"));
    assert!(!registry.unregister("ghost"));
}

// ---------------------------------------------------------------------------
// 3. Run slots survive panics
// ---------------------------------------------------------------------------

#[test]
fn test_run_slot_released_on_unwind() {
    let registry = Arc::new(AgentRegistry::new());
    registry.register(AgentDefinition::http("remote", "http://localhost:1"));

    let inner = registry.clone();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        let _slot = inner.begin_run("remote");
        assert_eq!(inner.get("remote").unwrap().active_runs, 1);
        panic!("delegation blew up");
    }));
    assert!(outcome.is_err());
    assert_eq!(registry.get("remote").unwrap().active_runs, 0);
}

// ---------------------------------------------------------------------------
// 4. Tool envelope and progress records
// ---------------------------------------------------------------------------

#[test]
fn test_tool_result_envelope_serializes() {
    let call = ToolCall::new("call_1", "delegate_to_agent", serde_json::json!({"task": "x"}));
    let result = ToolResult::error(&call.id, "Agent 'x' is disabled");
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["call_id"], "call_1");
    assert_eq!(value["is_error"], true);
}

#[test]
fn test_progress_update_wire_shape() {
    let update = AgentProgressUpdate {
        session_id: "s-1".into(),
        current_iteration: 1,
        max_iterations: 1,
        is_complete: true,
        steps: vec![ProgressStep::new("delegation", "Delegation to coder completed", "completed")
            .with_description("all tests pass")],
        final_content: Some("all tests pass".into()),
    };
    let value = serde_json::to_value(&update).unwrap();
    assert_eq!(value["sessionId"], "s-1");
    assert_eq!(value["isComplete"], true);
    assert_eq!(value["finalContent"], "all tests pass");
    assert_eq!(value["steps"][0]["type"], "delegation");
    assert_eq!(value["steps"][0]["description"], "all tests pass");
}
