use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::providers::{Executor, ProviderRegistry, Publisher, Verifier};
use super::{Callback, CancelResult, PublishResult, RunResult, Service};
use crate::error::BackendError;
use crate::models::{Execution, ExecutionState};
use crate::store::{ExecutionStore, UpdateExecutionStateRequest};

pub struct BaseServiceParams {
    pub node_id: String,
    pub store: Arc<dyn ExecutionStore>,
    pub callback: Arc<dyn Callback>,
    pub executors: Arc<ProviderRegistry<dyn Executor>>,
    pub verifiers: Arc<ProviderRegistry<dyn Verifier>>,
    pub publishers: Arc<ProviderRegistry<dyn Publisher>>,
    /// Used when a job carries no timeout of its own
    pub default_job_timeout: Duration,
}

/// Drives providers for one execution at a time and reports every outcome
/// through the callback.
///
/// The only store writes made here are the `BidAccepted -> Running` and
/// `ResultAccepted -> Publishing` moves; outcome states are the callback's
/// business.
pub struct BaseService {
    node_id: String,
    store: Arc<dyn ExecutionStore>,
    callback: Arc<dyn Callback>,
    executors: Arc<ProviderRegistry<dyn Executor>>,
    verifiers: Arc<ProviderRegistry<dyn Verifier>>,
    publishers: Arc<ProviderRegistry<dyn Publisher>>,
    default_job_timeout: Duration,
}

impl BaseService {
    pub fn new(params: BaseServiceParams) -> Self {
        Self {
            node_id: params.node_id,
            store: params.store,
            callback: params.callback,
            executors: params.executors,
            verifiers: params.verifiers,
            publishers: params.publishers,
            default_job_timeout: params.default_job_timeout,
        }
    }

    pub fn job_timeout(&self, execution: &Execution) -> Duration {
        execution
            .shard
            .job
            .spec
            .timeout()
            .unwrap_or(self.default_job_timeout)
    }

    async fn execute(&self, execution: &Execution) -> Result<RunResult, BackendError> {
        let spec = &execution.shard.job.spec;
        let verifier = self.verifiers.get(&spec.verifier)?;
        let executor = self.executors.get(&spec.engine)?;

        self.store.update_execution_state(
            UpdateExecutionStateRequest::new(&execution.id, ExecutionState::Running)
                .expect_state(ExecutionState::BidAccepted),
        )?;

        let results_dir = verifier
            .get_result_path(&execution.id, &execution.shard)
            .await?;

        let timeout = self.job_timeout(execution);
        tracing::debug!(
            execution_id = %execution.id,
            engine = %spec.engine,
            timeout = ?timeout,
            "Running shard"
        );

        let result = match tokio::time::timeout(
            timeout,
            executor.run_shard(&execution.id, &execution.shard, &results_dir),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                tracing::info!(execution_id = %execution.id, "Execution timeout exceeded, cancelling shard");
                if let Err(e) = executor.cancel_shard(&execution.id, &execution.shard).await {
                    tracing::warn!(execution_id = %execution.id, error = %e, "Failed to cancel timed out shard");
                }
                return Err(BackendError::ExecutionTimeout(timeout));
            }
        };

        if !result.error_msg.is_empty() {
            return Err(BackendError::Executor(result.error_msg));
        }

        let result_proposal = verifier
            .get_proposal(&execution.id, &execution.shard, &results_dir)
            .await?;

        Ok(RunResult {
            result_proposal,
            run_command_result: result,
        })
    }

    async fn publish_results(&self, execution: &Execution) -> Result<PublishResult, BackendError> {
        let spec = &execution.shard.job.spec;
        let verifier = self.verifiers.get(&spec.verifier)?;
        let publisher = self.publishers.get(&spec.publisher)?;

        self.store.update_execution_state(
            UpdateExecutionStateRequest::new(&execution.id, ExecutionState::Publishing)
                .expect_state(ExecutionState::ResultAccepted),
        )?;

        let results_dir = verifier
            .get_result_path(&execution.id, &execution.shard)
            .await?;
        let published_location = publisher
            .publish_shard_result(&execution.id, &execution.shard, &results_dir)
            .await?;

        Ok(PublishResult { published_location })
    }

    async fn cancel_shard(&self, execution: &Execution) -> Result<CancelResult, BackendError> {
        let executor = self.executors.get(&execution.shard.job.spec.engine)?;
        executor
            .cancel_shard(&execution.id, &execution.shard)
            .await?;
        Ok(CancelResult)
    }
}

#[async_trait]
impl Service for BaseService {
    async fn run(&self, execution: Execution) -> Result<(), BackendError> {
        match self.execute(&execution).await {
            Ok(result) => {
                tracing::info!(node_id = %self.node_id, execution_id = %execution.id, "Execution completed");
                self.callback.on_run_success(&execution.id, &result);
            }
            Err(e) => {
                tracing::warn!(node_id = %self.node_id, execution_id = %execution.id, error = %e, "Execution failed");
                self.callback.on_run_failure(&execution.id, &e);
            }
        }
        Ok(())
    }

    async fn publish(&self, execution: Execution) -> Result<(), BackendError> {
        match self.publish_results(&execution).await {
            Ok(result) => {
                tracing::info!(
                    execution_id = %execution.id,
                    location = %result.published_location,
                    "Published results"
                );
                self.callback.on_publish_success(&execution.id, &result);
            }
            Err(e) => {
                tracing::warn!(execution_id = %execution.id, error = %e, "Publishing failed");
                self.callback.on_publish_failure(&execution.id, &e);
            }
        }
        Ok(())
    }

    async fn cancel(&self, execution: Execution) -> Result<(), BackendError> {
        match self.cancel_shard(&execution).await {
            Ok(result) => {
                tracing::info!(execution_id = %execution.id, "Cancelled shard");
                self.callback.on_cancel_success(&execution.id, &result);
            }
            Err(e) => {
                tracing::warn!(execution_id = %execution.id, error = %e, "Cancelling shard failed");
                self.callback.on_cancel_failure(&execution.id, &e);
            }
        }
        Ok(())
    }
}
