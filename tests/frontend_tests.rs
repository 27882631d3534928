//! Integration tests for the frontend protocol handlers.


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use compute_node::error::{ComputeError, StoreError};
use compute_node::frontend::{
    AskForBidRequest, BidAcceptedRequest, BidRejectedRequest, CancelJobRequest, Endpoint,
    ResultAcceptedRequest, ResultRejectedRequest,
};
use compute_node::metrics::NodeMetric;
use compute_node::models::{ExecutionState, Job, ResourceUsage};
use compute_node::store::{ExecutionStore, KvExecutionStore, MemoryBackend};
use test_harness::{mock_job, mock_spec, wait_until, FailingStore, MockMode, Recorded, TestNode};

fn memory_store() -> Arc<dyn ExecutionStore> {
    Arc::new(KvExecutionStore::open(MemoryBackend::new()).unwrap())
}

// ---------------------------------------------------------------------------
// AskForBid
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_bid_creates_one_execution_per_shard() {
    let node = TestNode::new(MockMode::Succeed, ResourceUsage::cpu(4.0));
    let mut spec = mock_spec(1.0);
    spec.shard_count = 3;

    let response = node
        .node
        .frontend
        .ask_for_bid(AskForBidRequest {
            job: Job::new("job-1", spec),
            shard_indexes: vec![],
        })
        .await
        .unwrap();

    assert_eq!(response.job_id, "job-1");
    let indexes: Vec<u32> = response.shard_responses.iter().map(|r| r.shard_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert_eq!(response.accepted().count(), 3);

    for shard in &response.shard_responses {
        let id = shard.execution_id.as_deref().unwrap();
        assert!(id.starts_with("e-"));
        let execution = node.store().get_execution(id).unwrap();
        assert_eq!(execution.state, ExecutionState::Created);
        assert_eq!(execution.shard.index, shard.shard_index);
        assert_eq!(execution.resource_usage, ResourceUsage::cpu(1.0));
    }
    assert_eq!(node.store().get_execution_count(ExecutionState::Created).unwrap(), 3);
}

#[tokio::test]
async fn test_partial_bid_failure_is_isolated_to_its_shard() {
    let store = FailingStore::new(memory_store(), vec![1]);
    let node = TestNode::with_store(MockMode::Succeed, ResourceUsage::cpu(4.0), Some(store));

    let response = node
        .node
        .frontend
        .ask_for_bid(AskForBidRequest {
            job: mock_job("job-1", 1.0),
            shard_indexes: vec![0, 1, 2],
        })
        .await
        .unwrap();

    let shards = &response.shard_responses;
    assert!(shards[0].accepted);
    assert!(!shards[1].accepted);
    assert!(shards[2].accepted);
    assert!(shards[1].reason.contains("injected failure"));
    assert!(shards[1].execution_id.is_none());

    let ids: HashSet<&str> = response
        .accepted()
        .map(|r| r.execution_id.as_deref().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(matches!(
        node.store().get_executions("job-1:1"),
        Err(StoreError::ExecutionsNotFoundForShard(_))
    ));
}

#[tokio::test]
async fn test_bid_fails_when_no_shard_could_be_recorded() {
    let store = FailingStore::new(memory_store(), vec![0, 1]);
    let node = TestNode::with_store(MockMode::Succeed, ResourceUsage::cpu(4.0), Some(store));

    let err = node
        .node
        .frontend
        .ask_for_bid(AskForBidRequest {
            job: mock_job("job-1", 1.0),
            shard_indexes: vec![0, 1],
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ComputeError::NoShardsAccepted { ref job_id, .. } if job_id == "job-1"));
}

#[tokio::test]
async fn test_bid_declined_for_unknown_engine() {
    let node = TestNode::new(MockMode::Succeed, ResourceUsage::cpu(4.0));
    let mut spec = mock_spec(1.0);
    spec.engine = "wasm".to_string();

    let response = node
        .node
        .frontend
        .ask_for_bid(AskForBidRequest {
            job: Job::new("job-1", spec),
            shard_indexes: vec![0, 1],
        })
        .await
        .unwrap();

    assert_eq!(response.accepted().count(), 0);
    for shard in &response.shard_responses {
        assert_eq!(shard.reason, "node does not support engine wasm");
    }
    assert_eq!(node.store().get_execution_count(ExecutionState::Created).unwrap(), 0);
}

#[tokio::test]
async fn test_bid_declined_when_job_exceeds_node() {
    let node = TestNode::new(MockMode::Succeed, ResourceUsage::cpu(1.0));

    let response = node
        .node
        .frontend
        .ask_for_bid(AskForBidRequest {
            job: mock_job("job-1", 8.0),
            shard_indexes: vec![0],
        })
        .await
        .unwrap();

    let shard = &response.shard_responses[0];
    assert!(!shard.accepted);
    assert!(shard.reason.contains("exceeds node capacity"));
    assert!(shard.execution_id.is_none());
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_bid_rejected_cancels_execution() {
    let node = TestNode::new(MockMode::Succeed, ResourceUsage::cpu(1.0));
    let id = node.bid(mock_job("job-1", 1.0)).await;

    let metadata = node
        .node
        .frontend
        .bid_rejected(BidRejectedRequest {
            execution_id: id.clone(),
            justification: "found a cheaper node".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(metadata.execution_id, id);
    assert_eq!(metadata.job_id, "job-1");

    let execution = node.store().get_execution(&id).unwrap();
    assert_eq!(execution.state, ExecutionState::Cancelled);
    assert_eq!(execution.latest_comment, "bid rejected due to: found a cheaper node");
    assert!(node.executor.started().is_empty());
}

#[tokio::test]
async fn test_preconditions_are_not_retried() {
    let node = TestNode::new(MockMode::Gated, ResourceUsage::cpu(1.0));
    let id = node.submit(mock_job("job-1", 1.0)).await;

    let err = node
        .node
        .frontend
        .bid_accepted(BidAcceptedRequest {
            execution_id: id.clone(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ComputeError::Store(StoreError::InvalidExecutionState {
            expected: ExecutionState::Created,
            ..
        })
    ));

    let err = node
        .node
        .frontend
        .result_accepted(ResultAcceptedRequest {
            execution_id: id.clone(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ComputeError::Store(StoreError::InvalidExecutionState {
            expected: ExecutionState::WaitingVerification,
            ..
        })
    ));

    let err = node
        .node
        .frontend
        .bid_rejected(BidRejectedRequest {
            execution_id: "e-missing".to_string(),
            justification: String::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ComputeError::Store(StoreError::ExecutionNotFound(_))));

    node.executor.release(1);
    node.wait_for(&id, &[ExecutionState::WaitingVerification]).await;
}

#[tokio::test]
async fn test_result_rejected_fails_execution() {
    let node = TestNode::new(MockMode::Succeed, ResourceUsage::cpu(1.0));
    let id = node.submit(mock_job("job-1", 1.0)).await;
    node.wait_for(&id, &[ExecutionState::WaitingVerification]).await;

    node.node
        .frontend
        .result_rejected(ResultRejectedRequest {
            execution_id: id.clone(),
            justification: "hash mismatch".to_string(),
        })
        .await
        .unwrap();

    let execution = node.store().get_execution(&id).unwrap();
    assert_eq!(execution.state, ExecutionState::Failed);
    assert_eq!(execution.latest_comment, "result rejected due to: hash mismatch");
}

// ---------------------------------------------------------------------------
// CancelJob
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_created_execution_skips_backend() {
    let node = TestNode::new(MockMode::Succeed, ResourceUsage::cpu(1.0));
    let id = node.bid(mock_job("job-1", 1.0)).await;

    node.node
        .frontend
        .cancel_job(CancelJobRequest {
            execution_id: id.clone(),
            justification: "requester went away".to_string(),
        })
        .await
        .unwrap();

    let execution = node.store().get_execution(&id).unwrap();
    assert_eq!(execution.state, ExecutionState::Cancelled);
    assert_eq!(execution.latest_comment, "execution canceled due to: requester went away");
    assert!(node.executor.cancelled().is_empty());
    assert!(node.recorder.events().is_empty());
}

#[tokio::test]
async fn test_cancel_running_execution_stops_it_and_frees_capacity() {
    let node = TestNode::new(MockMode::Hang, ResourceUsage::cpu(1.0));
    let stuck = node.submit(mock_job("job-1", 1.0)).await;
    node.wait_for(&stuck, &[ExecutionState::Running]).await;
    let waiting = node.submit(mock_job("job-2", 1.0)).await;
    assert_eq!(node.node.buffer.enqueued_executions(), vec![waiting.clone()]);

    node.node
        .frontend
        .cancel_job(CancelJobRequest {
            execution_id: stuck.clone(),
            justification: "user request".to_string(),
        })
        .await
        .unwrap();

    let execution = node.store().get_execution(&stuck).unwrap();
    assert_eq!(execution.state, ExecutionState::Cancelled);
    assert_eq!(node.executor.cancelled(), vec![stuck.clone()]);
    assert_eq!(node.recorder.events_for(&stuck), vec![Recorded::CancelSuccess(stuck.clone())]);

    // the freed slot goes to the queued execution
    node.wait_for(&waiting, &[ExecutionState::Running]).await;
    assert!(
        wait_until(Duration::from_secs(5), || node.node.buffer.running_executions()
            == vec![waiting.clone()])
        .await
    );
}

#[tokio::test]
async fn test_cancel_queued_execution_is_never_dispatched() {
    let node = TestNode::new(MockMode::Gated, ResourceUsage::cpu(1.0));
    let first = node.submit(mock_job("job-1", 1.0)).await;
    let queued = node.submit(mock_job("job-2", 1.0)).await;
    node.wait_for(&first, &[ExecutionState::Running]).await;
    assert_eq!(node.node.buffer.enqueued_executions(), vec![queued.clone()]);

    node.node
        .frontend
        .cancel_job(CancelJobRequest {
            execution_id: queued.clone(),
            justification: "no longer needed".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        node.store().get_execution(&queued).unwrap().state,
        ExecutionState::Cancelled
    );
    assert!(node.node.buffer.enqueued_executions().is_empty());

    node.executor.release(1);
    node.wait_for(&first, &[ExecutionState::WaitingVerification]).await;
    assert!(
        wait_until(Duration::from_secs(5), || node.node.buffer.running_executions().is_empty())
            .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(node.executor.started(), vec![first]);
    assert_eq!(node.recorder.events_for(&queued), vec![Recorded::CancelSuccess(queued.clone())]);
    assert_eq!(node.node.metrics.get(NodeMetric::JobsFailed), 0);
}

#[tokio::test]
async fn test_cancel_terminal_execution_is_refused() {
    let node = TestNode::new(MockMode::Succeed, ResourceUsage::cpu(1.0));
    let id = node.bid(mock_job("job-1", 1.0)).await;
    node.node
        .frontend
        .bid_rejected(BidRejectedRequest {
            execution_id: id.clone(),
            justification: "no".to_string(),
        })
        .await
        .unwrap();

    let err = node
        .node
        .frontend
        .cancel_job(CancelJobRequest {
            execution_id: id.clone(),
            justification: "again".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ComputeError::CannotCancel { state: ExecutionState::Cancelled, .. }
    ));
    assert_eq!(node.store().get_execution(&id).unwrap().version, 2);
}
