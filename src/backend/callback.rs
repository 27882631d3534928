use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use super::{Callback, CancelResult, PublishResult, RunCommandResult, RunResult};
use crate::error::BackendError;
use crate::metrics::{MetricsSink, NodeMetric};
use crate::models::ExecutionState;
use crate::store::{ExecutionStore, UpdateExecutionStateRequest};

/// Fans every event out to its listeners in registration order.
///
/// Listeners have no way to fail the chain; each one logs its own problems.
#[derive(Default, Clone)]
pub struct ChainedCallback {
    callbacks: Vec<Arc<dyn Callback>>,
}

impl ChainedCallback {
    pub fn new(callbacks: Vec<Arc<dyn Callback>>) -> Self {
        Self { callbacks }
    }

    pub fn push(&mut self, callback: Arc<dyn Callback>) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl Callback for ChainedCallback {
    fn on_run_success(&self, execution_id: &str, result: &RunResult) {
        for callback in &self.callbacks {
            callback.on_run_success(execution_id, result);
        }
    }

    fn on_run_failure(&self, execution_id: &str, err: &BackendError) {
        for callback in &self.callbacks {
            callback.on_run_failure(execution_id, err);
        }
    }

    fn on_publish_success(&self, execution_id: &str, result: &PublishResult) {
        for callback in &self.callbacks {
            callback.on_publish_success(execution_id, result);
        }
    }

    fn on_publish_failure(&self, execution_id: &str, err: &BackendError) {
        for callback in &self.callbacks {
            callback.on_publish_failure(execution_id, err);
        }
    }

    fn on_cancel_success(&self, execution_id: &str, result: &CancelResult) {
        for callback in &self.callbacks {
            callback.on_cancel_success(execution_id, result);
        }
    }

    fn on_cancel_failure(&self, execution_id: &str, err: &BackendError) {
        for callback in &self.callbacks {
            callback.on_cancel_failure(execution_id, err);
        }
    }
}

/// Persists the state each outcome implies.
pub struct StateUpdateCallback {
    store: Arc<dyn ExecutionStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl StateUpdateCallback {
    pub fn new(store: Arc<dyn ExecutionStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { store, metrics }
    }

    fn apply(&self, request: UpdateExecutionStateRequest) {
        let execution_id = request.execution_id.clone();
        let new_state = request.new_state;
        if let Err(e) = self.store.update_execution_state(request) {
            tracing::error!(
                execution_id = %execution_id,
                new_state = %new_state,
                error = %e,
                "Failed to persist execution outcome"
            );
        }
    }
}

impl Callback for StateUpdateCallback {
    fn on_run_success(&self, execution_id: &str, _result: &RunResult) {
        self.apply(
            UpdateExecutionStateRequest::new(execution_id, ExecutionState::WaitingVerification)
                .expect_state(ExecutionState::Running),
        );
    }

    fn on_run_failure(&self, execution_id: &str, err: &BackendError) {
        self.metrics.increment(NodeMetric::JobsFailed);
        self.apply(
            UpdateExecutionStateRequest::new(execution_id, ExecutionState::Failed)
                .with_comment(err.to_string()),
        );
    }

    fn on_publish_success(&self, execution_id: &str, _result: &PublishResult) {
        self.metrics.increment(NodeMetric::JobsCompleted);
        self.apply(
            UpdateExecutionStateRequest::new(execution_id, ExecutionState::Completed)
                .expect_state(ExecutionState::Publishing),
        );
    }

    fn on_publish_failure(&self, execution_id: &str, err: &BackendError) {
        self.metrics.increment(NodeMetric::JobsFailed);
        self.apply(
            UpdateExecutionStateRequest::new(execution_id, ExecutionState::Failed)
                .with_comment(err.to_string()),
        );
    }

    fn on_cancel_success(&self, execution_id: &str, _result: &CancelResult) {
        self.metrics.increment(NodeMetric::JobsCancelled);
        tracing::info!(execution_id = %execution_id, "Execution cancelled");
    }

    fn on_cancel_failure(&self, execution_id: &str, err: &BackendError) {
        tracing::warn!(execution_id = %execution_id, error = %err, "Failed to cancel execution");
    }
}

/// Outbound notifications for the network layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComputeEvent {
    RunCompleted {
        node_id: String,
        execution_id: String,
        result_proposal: Vec<u8>,
        run_command_result: RunCommandResult,
    },
    RunFailed {
        node_id: String,
        execution_id: String,
        error: String,
    },
    PublishCompleted {
        node_id: String,
        execution_id: String,
        published_location: String,
    },
    PublishFailed {
        node_id: String,
        execution_id: String,
        error: String,
    },
    CancelCompleted {
        node_id: String,
        execution_id: String,
    },
    CancelFailed {
        node_id: String,
        execution_id: String,
        error: String,
    },
}

impl ComputeEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ComputeEvent::RunCompleted { execution_id, .. }
            | ComputeEvent::RunFailed { execution_id, .. }
            | ComputeEvent::PublishCompleted { execution_id, .. }
            | ComputeEvent::PublishFailed { execution_id, .. }
            | ComputeEvent::CancelCompleted { execution_id, .. }
            | ComputeEvent::CancelFailed { execution_id, .. } => execution_id,
        }
    }
}

/// Turns outcomes into [`ComputeEvent`]s on a bounded channel.
///
/// A full channel drops the event with a warning; the backend never waits
/// on the consumer.
pub struct EventEmitterCallback {
    node_id: String,
    sender: mpsc::Sender<ComputeEvent>,
}

impl EventEmitterCallback {
    pub fn new(node_id: impl Into<String>, sender: mpsc::Sender<ComputeEvent>) -> Self {
        Self {
            node_id: node_id.into(),
            sender,
        }
    }

    fn emit(&self, event: ComputeEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    execution_id = %event.execution_id(),
                    "Event channel full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::debug!(
                    execution_id = %event.execution_id(),
                    "Event channel closed, dropping event"
                );
            }
        }
    }
}

impl Callback for EventEmitterCallback {
    fn on_run_success(&self, execution_id: &str, result: &RunResult) {
        self.emit(ComputeEvent::RunCompleted {
            node_id: self.node_id.clone(),
            execution_id: execution_id.to_string(),
            result_proposal: result.result_proposal.clone(),
            run_command_result: result.run_command_result.clone(),
        });
    }

    fn on_run_failure(&self, execution_id: &str, err: &BackendError) {
        self.emit(ComputeEvent::RunFailed {
            node_id: self.node_id.clone(),
            execution_id: execution_id.to_string(),
            error: err.to_string(),
        });
    }

    fn on_publish_success(&self, execution_id: &str, result: &PublishResult) {
        self.emit(ComputeEvent::PublishCompleted {
            node_id: self.node_id.clone(),
            execution_id: execution_id.to_string(),
            published_location: result.published_location.clone(),
        });
    }

    fn on_publish_failure(&self, execution_id: &str, err: &BackendError) {
        self.emit(ComputeEvent::PublishFailed {
            node_id: self.node_id.clone(),
            execution_id: execution_id.to_string(),
            error: err.to_string(),
        });
    }

    fn on_cancel_success(&self, execution_id: &str, _result: &CancelResult) {
        self.emit(ComputeEvent::CancelCompleted {
            node_id: self.node_id.clone(),
            execution_id: execution_id.to_string(),
        });
    }

    fn on_cancel_failure(&self, execution_id: &str, err: &BackendError) {
        self.emit(ComputeEvent::CancelFailed {
            node_id: self.node_id.clone(),
            execution_id: execution_id.to_string(),
            error: err.to_string(),
        });
    }
}
