#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end tests for `TransportExecutor` and HTTP polling against wiremock.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use switchboard_acp::{StdioTransport, StdioTransportConfig};
use switchboard_core::{AgentDefinition, AgentRegistry, SwitchboardError};
use switchboard_http::{HttpTransport, HttpTransportConfig};
use switchboard_orchestrator::{
    DelegationExecutor, DelegationRequest, DelegationRun, DelegationTracker, RunState,
    Submission, TransportExecutor,
};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    registry: Arc<AgentRegistry>,
    http: Arc<HttpTransport>,
    executor: TransportExecutor,
}

fn fixture(definitions: Vec<AgentDefinition>) -> Fixture {
    let registry = Arc::new(AgentRegistry::new());
    registry.load_from_config(definitions);
    let stdio = Arc::new(StdioTransport::new(registry.clone(), StdioTransportConfig::default()));
    let http = Arc::new(HttpTransport::new(registry.clone(), HttpTransportConfig::default()));
    let executor = TransportExecutor::new(registry.clone(), stdio, http.clone());
    Fixture {
        registry,
        http,
        executor,
    }
}

#[tokio::test]
async fn test_http_agent_is_ready_without_spawning() {
    let f = fixture(vec![AgentDefinition::http("remote", "http://localhost:9")]);
    f.executor.ensure_ready("remote").await.unwrap();
}

#[tokio::test]
async fn test_agent_without_command_or_url_is_not_ready() {
    let f = fixture(vec![
        AgentDefinition::stdio("blank", "  ", vec![]),
        AgentDefinition::http("nowhere", ""),
    ]);
    for name in ["blank", "nowhere", "missing"] {
        let err = f.executor.ensure_ready(name).await.unwrap_err();
        assert!(matches!(err, SwitchboardError::Config(_)), "{name}: {err}");
    }
}

#[tokio::test]
async fn test_execute_maps_failed_remote_status_to_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/runs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "run_id": "srv-1",
            "status": "failed",
            "error": {"message": "model overloaded"}
        })))
        .mount(&server)
        .await;

    let f = fixture(vec![AgentDefinition::http("remote", server.uri())]);
    let err = f
        .executor
        .execute(DelegationRequest::new("remote", "x"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("model overloaded"));
}

#[tokio::test]
async fn test_execute_returns_text_and_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/runs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "run_id": "srv-2",
            "status": "completed",
            "output": [{"role": "agent", "parts": [{"content": "all good"}]}]
        })))
        .mount(&server)
        .await;

    let f = fixture(vec![AgentDefinition::http("remote", server.uri())]);
    let output = f
        .executor
        .execute(DelegationRequest::new("remote", "x"))
        .await
        .unwrap();
    assert_eq!(output.text, "all good");
    assert_eq!(output.metadata["runId"], "srv-2");
}

#[tokio::test]
async fn test_submitted_run_is_polled_to_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/runs"))
        .and(body_partial_json(json!({"mode": "async"})))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "run_id": "srv-77",
            "status": "in-progress"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/runs/srv-77"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "run_id": "srv-77",
            "status": "completed",
            "output": [{"role": "agent", "parts": [{"content": "background result"}]}]
        })))
        .mount(&server)
        .await;

    let f = fixture(vec![AgentDefinition::http("remote", server.uri())]);
    let tracker = DelegationTracker::builder()
        .status_source(f.http.clone())
        .poll_interval(Duration::from_millis(50))
        .build();

    let request = DelegationRequest::new("remote", "long job").with_run_id("local-1");
    tracker.record(DelegationRun::new("local-1", "remote", "session-1", "long job").announced());
    tracker.mark_running("local-1");

    let submission = f.executor.submit(&request).await.unwrap();
    let Submission::Remote {
        base_url,
        remote_run_id,
    } = submission
    else {
        panic!("expected remote submission");
    };
    assert_eq!(remote_run_id, "srv-77");
    tracker.set_remote("local-1", base_url, remote_run_id);

    for _ in 0..100 {
        if tracker.get("local-1").unwrap().status == RunState::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let run = tracker.get("local-1").unwrap();
    assert_eq!(run.status, RunState::Completed);
    assert_eq!(run.result.unwrap().text, "background result");
    assert!(f.registry.get("remote").is_some());
}
