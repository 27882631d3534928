//! The protocol surface: bids, acceptances, rejections and cancellations.

pub mod bidstrategy;
mod service;

pub use bidstrategy::{
    AcceptAllStrategy, BidStrategy, BidStrategyRequest, BidStrategyResponse, ChainedBidStrategy,
    MaxCapacityStrategy, ProvidersInstalledStrategy,
};
pub use service::{FrontendService, FrontendServiceParams};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Execution, Job};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskForBidRequest {
    pub job: Job,
    /// Shards to bid on; empty means every shard of the job
    pub shard_indexes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskForBidShardResponse {
    pub shard_index: u32,
    pub accepted: bool,
    pub reason: String,
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskForBidResponse {
    pub job_id: String,
    pub shard_responses: Vec<AskForBidShardResponse>,
}

impl AskForBidResponse {
    pub fn accepted(&self) -> impl Iterator<Item = &AskForBidShardResponse> {
        self.shard_responses.iter().filter(|r| r.accepted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidAcceptedRequest {
    pub execution_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidRejectedRequest {
    pub execution_id: String,
    pub justification: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultAcceptedRequest {
    pub execution_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRejectedRequest {
    pub execution_id: String,
    pub justification: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelJobRequest {
    pub execution_id: String,
    pub justification: String,
}

/// Identifies the execution a request acted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub execution_id: String,
    pub job_id: String,
    pub shard_index: u32,
}

impl From<&Execution> for ExecutionMetadata {
    fn from(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id.clone(),
            job_id: execution.shard.job.id.clone(),
            shard_index: execution.shard.index,
        }
    }
}

/// Handlers for the messages a requester sends this node.
///
/// Dropping a returned future abandons the request; a transition already
/// committed to the store stays committed.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn ask_for_bid(&self, request: AskForBidRequest) -> Result<AskForBidResponse>;

    async fn bid_accepted(&self, request: BidAcceptedRequest) -> Result<ExecutionMetadata>;

    async fn bid_rejected(&self, request: BidRejectedRequest) -> Result<ExecutionMetadata>;

    async fn result_accepted(&self, request: ResultAcceptedRequest) -> Result<ExecutionMetadata>;

    async fn result_rejected(&self, request: ResultRejectedRequest) -> Result<ExecutionMetadata>;

    async fn cancel_job(&self, request: CancelJobRequest) -> Result<ExecutionMetadata>;
}
