use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::bidstrategy::{BidStrategy, BidStrategyRequest, BidStrategyResponse};
use super::{
    AskForBidRequest, AskForBidResponse, AskForBidShardResponse, BidAcceptedRequest,
    BidRejectedRequest, CancelJobRequest, Endpoint, ExecutionMetadata, ResultAcceptedRequest,
    ResultRejectedRequest,
};
use crate::backend::Service;
use crate::capacity::UsageCalculator;
use crate::error::{ComputeError, Result, StoreError};
use crate::metrics::{MetricsSink, NodeMetric};
use crate::models::{Execution, ExecutionShard, ExecutionState, Job, ResourceUsage};
use crate::store::{ExecutionStore, UpdateExecutionStateRequest};

pub struct FrontendServiceParams {
    pub node_id: String,
    pub store: Arc<dyn ExecutionStore>,
    pub usage_calculator: Arc<dyn UsageCalculator>,
    pub bid_strategy: Arc<dyn BidStrategy>,
    /// Normally the admission buffer
    pub backend: Arc<dyn Service>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Stateless handlers over the execution store and the backend.
///
/// Every transition is guarded by the expected current state; a rejected
/// precondition is returned to the caller, never retried.
pub struct FrontendService {
    node_id: String,
    store: Arc<dyn ExecutionStore>,
    usage_calculator: Arc<dyn UsageCalculator>,
    bid_strategy: Arc<dyn BidStrategy>,
    backend: Arc<dyn Service>,
    metrics: Arc<dyn MetricsSink>,
}

impl FrontendService {
    pub fn new(params: FrontendServiceParams) -> Self {
        Self {
            node_id: params.node_id,
            store: params.store,
            usage_calculator: params.usage_calculator,
            bid_strategy: params.bid_strategy,
            backend: params.backend,
            metrics: params.metrics,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn get_execution(&self, execution_id: &str) -> Result<Execution> {
        Ok(self.store.get_execution(execution_id)?)
    }

    async fn decide(&self, job: &Job) -> Result<(BidStrategyResponse, ResourceUsage)> {
        let request = BidStrategyRequest {
            node_id: self.node_id.clone(),
            job: job.clone(),
        };

        let response = self.bid_strategy.should_bid(&request).await?;
        if !response.should_bid {
            return Ok((response, ResourceUsage::default()));
        }

        let usage = self.usage_calculator.calculate(job).await?;
        let response = self
            .bid_strategy
            .should_bid_based_on_usage(&request, &usage)
            .await?;
        Ok((response, usage))
    }

    /// Record a bid for one shard. A store failure rejects only this shard.
    fn bid_on_shard(
        &self,
        job: &Job,
        shard_index: u32,
        usage: ResourceUsage,
    ) -> std::result::Result<AskForBidShardResponse, (AskForBidShardResponse, StoreError)> {
        let execution = Execution::new(
            format!("e-{}", Uuid::new_v4()),
            ExecutionShard::new(job.clone(), shard_index),
            usage,
        );
        let execution_id = execution.id.clone();
        let shard = execution.shard_id();

        match self.store.create_execution(execution) {
            Ok(()) => {
                tracing::debug!(shard = %shard, execution_id = %execution_id, "Bidding for shard");
                Ok(AskForBidShardResponse {
                    shard_index,
                    accepted: true,
                    reason: String::new(),
                    execution_id: Some(execution_id),
                })
            }
            Err(e) => {
                tracing::error!(shard = %shard, error = %e, "Error adding shard to backlog");
                Err((
                    AskForBidShardResponse {
                        shard_index,
                        accepted: false,
                        reason: format!("error adding shard to backlog: {}", e),
                        execution_id: None,
                    },
                    e,
                ))
            }
        }
    }

    fn transition(
        &self,
        execution_id: &str,
        expected: ExecutionState,
        new_state: ExecutionState,
        comment: String,
    ) -> Result<Execution> {
        self.store.update_execution_state(
            UpdateExecutionStateRequest::new(execution_id, new_state)
                .expect_state(expected)
                .with_comment(comment),
        )?;
        Ok(self.store.get_execution(execution_id)?)
    }
}

#[async_trait]
impl Endpoint for FrontendService {
    async fn ask_for_bid(&self, request: AskForBidRequest) -> Result<AskForBidResponse> {
        let job = request.job;
        tracing::debug!(node_id = %self.node_id, job_id = %job.id, "Asked to bid");
        self.metrics.increment(NodeMetric::JobsReceived);

        let shard_indexes = if request.shard_indexes.is_empty() {
            (0..job.spec.shard_count.max(1)).collect()
        } else {
            request.shard_indexes
        };

        let (decision, usage) = self.decide(&job).await?;
        if !decision.should_bid {
            tracing::info!(job_id = %job.id, reason = %decision.reason, "Not bidding on job");
            return Ok(AskForBidResponse {
                job_id: job.id,
                shard_responses: shard_indexes
                    .into_iter()
                    .map(|shard_index| AskForBidShardResponse {
                        shard_index,
                        accepted: false,
                        reason: decision.reason.clone(),
                        execution_id: None,
                    })
                    .collect(),
            });
        }

        let mut shard_responses = Vec::with_capacity(shard_indexes.len());
        let mut last_error = None;
        for shard_index in shard_indexes {
            match self.bid_on_shard(&job, shard_index, usage) {
                Ok(response) => shard_responses.push(response),
                Err((response, e)) => {
                    shard_responses.push(response);
                    last_error = Some(e);
                }
            }
        }

        let accepted = shard_responses.iter().filter(|r| r.accepted).count();
        if accepted == 0 {
            if let Some(e) = last_error {
                return Err(ComputeError::NoShardsAccepted {
                    job_id: job.id,
                    reason: e.to_string(),
                });
            }
        }

        Ok(AskForBidResponse {
            job_id: job.id,
            shard_responses,
        })
    }

    async fn bid_accepted(&self, request: BidAcceptedRequest) -> Result<ExecutionMetadata> {
        tracing::debug!(execution_id = %request.execution_id, "Bid accepted");
        let execution = self.transition(
            &request.execution_id,
            ExecutionState::Created,
            ExecutionState::BidAccepted,
            String::new(),
        )?;
        self.metrics.increment(NodeMetric::JobsAccepted);

        let metadata = ExecutionMetadata::from(&execution);
        self.backend.run(execution).await?;
        Ok(metadata)
    }

    async fn bid_rejected(&self, request: BidRejectedRequest) -> Result<ExecutionMetadata> {
        tracing::debug!(execution_id = %request.execution_id, "Bid rejected");
        let execution = self.transition(
            &request.execution_id,
            ExecutionState::Created,
            ExecutionState::Cancelled,
            format!("bid rejected due to: {}", request.justification),
        )?;
        Ok(ExecutionMetadata::from(&execution))
    }

    async fn result_accepted(&self, request: ResultAcceptedRequest) -> Result<ExecutionMetadata> {
        tracing::debug!(execution_id = %request.execution_id, "Result accepted");
        let execution = self.transition(
            &request.execution_id,
            ExecutionState::WaitingVerification,
            ExecutionState::ResultAccepted,
            String::new(),
        )?;

        let metadata = ExecutionMetadata::from(&execution);
        self.backend.publish(execution).await?;
        Ok(metadata)
    }

    async fn result_rejected(&self, request: ResultRejectedRequest) -> Result<ExecutionMetadata> {
        tracing::debug!(execution_id = %request.execution_id, "Result rejected");
        let execution = self.transition(
            &request.execution_id,
            ExecutionState::WaitingVerification,
            ExecutionState::Failed,
            format!("result rejected due to: {}", request.justification),
        )?;
        Ok(ExecutionMetadata::from(&execution))
    }

    async fn cancel_job(&self, request: CancelJobRequest) -> Result<ExecutionMetadata> {
        tracing::debug!(
            execution_id = %request.execution_id,
            justification = %request.justification,
            "Cancelling execution"
        );
        let execution = self.store.get_execution(&request.execution_id)?;
        if execution.state.is_terminal() {
            return Err(ComputeError::CannotCancel {
                id: execution.id,
                state: execution.state,
            });
        }

        // a BidAccepted execution may still sit in the admission queue or be
        // about to start, so the backend hears about it too
        let metadata = ExecutionMetadata::from(&execution);
        if execution.state.is_executing() || execution.state == ExecutionState::BidAccepted {
            self.backend.cancel(execution).await?;
        }

        self.store.update_execution_state(
            UpdateExecutionStateRequest::new(&request.execution_id, ExecutionState::Cancelled)
                .with_comment(format!("execution canceled due to: {}", request.justification)),
        )?;
        Ok(metadata)
    }
}
