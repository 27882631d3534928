//! Tests for the status server routes.


use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use compute_node::models::{ExecutionState, ResourceUsage};
use compute_node::status::{router, StatusState};
use test_harness::{mock_job, MockMode, TestNode};

fn app(node: &TestNode) -> Router {
    router(StatusState {
        node_id: node.node.config.node_id.clone(),
        store: node.node.store.clone(),
        buffer: node.node.buffer.clone(),
        registry: node.node.registry.clone(),
    })
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_execution_and_history_lookup() {
    let node = TestNode::new(MockMode::Succeed, ResourceUsage::cpu(1.0));
    let id = node.submit(mock_job("job-1", 1.0)).await;
    node.wait_for(&id, &[ExecutionState::WaitingVerification]).await;

    let (status, json) = get_json(app(&node), &format!("/api/executions/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], id.as_str());
    assert_eq!(json["state"], "WaitingVerification");
    assert_eq!(json["version"], 4);

    let (status, json) = get_json(app(&node), &format!("/api/executions/{}/history", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_unknown_execution_is_not_found() {
    let node = TestNode::new(MockMode::Succeed, ResourceUsage::cpu(1.0));

    let (status, json) = get_json(app(&node), "/api/executions/e-missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "execution not found: e-missing");

    let (status, _) = get_json(app(&node), "/api/executions/e-missing/history").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_counts_report_states_and_buffer() {
    let node = TestNode::new(MockMode::Gated, ResourceUsage::cpu(1.0));
    let first = node.submit(mock_job("job-1", 1.0)).await;
    let second = node.submit(mock_job("job-2", 1.0)).await;
    node.wait_for(&first, &[ExecutionState::Running]).await;

    let (status, json) = get_json(app(&node), "/api/counts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["node_id"], "test-node");
    assert_eq!(json["states"]["running"], 1);
    assert_eq!(json["states"]["bid_accepted"], 1);
    assert_eq!(json["states"]["completed"], 0);
    assert!(json["states"].get("undefined").is_none());
    assert_eq!(json["running"], serde_json::json!([first]));
    assert_eq!(json["enqueued"], serde_json::json!([second]));

    node.executor.release(2);
}

#[tokio::test]
async fn test_metrics_are_scraped_from_node_registry() {
    let node = TestNode::new(MockMode::Succeed, ResourceUsage::cpu(1.0));
    let id = node.submit(mock_job("job-1", 1.0)).await;
    node.wait_for(&id, &[ExecutionState::WaitingVerification]).await;

    let (status, body) = get(app(&node), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains(r#"compute_jobs_received_total{node_id="test-node"} 1"#));
    assert!(text.contains(r#"compute_jobs_accepted_total{node_id="test-node"} 1"#));
}
