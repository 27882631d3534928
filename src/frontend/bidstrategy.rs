use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{Executor, ProviderRegistry, Publisher, Verifier};
use crate::error::Result;
use crate::models::{Job, ResourceUsage};

#[derive(Debug, Clone)]
pub struct BidStrategyRequest {
    pub node_id: String,
    pub job: Job,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidStrategyResponse {
    pub should_bid: bool,
    pub reason: String,
}

impl BidStrategyResponse {
    pub fn bid() -> Self {
        Self {
            should_bid: true,
            reason: String::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            should_bid: false,
            reason: reason.into(),
        }
    }
}

/// Decides whether this node bids on a job.
///
/// `should_bid` sees only the job; `should_bid_based_on_usage` is asked
/// afterwards with the computed resource requirements.
#[async_trait]
pub trait BidStrategy: Send + Sync {
    async fn should_bid(&self, request: &BidStrategyRequest) -> Result<BidStrategyResponse>;

    async fn should_bid_based_on_usage(
        &self,
        request: &BidStrategyRequest,
        usage: &ResourceUsage,
    ) -> Result<BidStrategyResponse>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllStrategy;

#[async_trait]
impl BidStrategy for AcceptAllStrategy {
    async fn should_bid(&self, _request: &BidStrategyRequest) -> Result<BidStrategyResponse> {
        Ok(BidStrategyResponse::bid())
    }

    async fn should_bid_based_on_usage(
        &self,
        _request: &BidStrategyRequest,
        _usage: &ResourceUsage,
    ) -> Result<BidStrategyResponse> {
        Ok(BidStrategyResponse::bid())
    }
}

/// Rejects jobs whose per-shard usage could never fit on this node.
#[derive(Debug, Clone)]
pub struct MaxCapacityStrategy {
    max: ResourceUsage,
}

impl MaxCapacityStrategy {
    pub fn new(max: ResourceUsage) -> Self {
        Self { max }
    }
}

#[async_trait]
impl BidStrategy for MaxCapacityStrategy {
    async fn should_bid(&self, _request: &BidStrategyRequest) -> Result<BidStrategyResponse> {
        Ok(BidStrategyResponse::bid())
    }

    async fn should_bid_based_on_usage(
        &self,
        _request: &BidStrategyRequest,
        usage: &ResourceUsage,
    ) -> Result<BidStrategyResponse> {
        if usage.fits_within(&self.max) {
            Ok(BidStrategyResponse::bid())
        } else {
            Ok(BidStrategyResponse::reject(format!(
                "job requires {} which exceeds node capacity {}",
                usage, self.max
            )))
        }
    }
}

/// Rejects jobs naming an engine, verifier or publisher this node lacks.
pub struct ProvidersInstalledStrategy {
    executors: Arc<ProviderRegistry<dyn Executor>>,
    verifiers: Arc<ProviderRegistry<dyn Verifier>>,
    publishers: Arc<ProviderRegistry<dyn Publisher>>,
}

impl ProvidersInstalledStrategy {
    pub fn new(
        executors: Arc<ProviderRegistry<dyn Executor>>,
        verifiers: Arc<ProviderRegistry<dyn Verifier>>,
        publishers: Arc<ProviderRegistry<dyn Publisher>>,
    ) -> Self {
        Self {
            executors,
            verifiers,
            publishers,
        }
    }
}

#[async_trait]
impl BidStrategy for ProvidersInstalledStrategy {
    async fn should_bid(&self, request: &BidStrategyRequest) -> Result<BidStrategyResponse> {
        let spec = &request.job.spec;
        let missing = [
            ("engine", &spec.engine, self.executors.has(&spec.engine)),
            ("verifier", &spec.verifier, self.verifiers.has(&spec.verifier)),
            ("publisher", &spec.publisher, self.publishers.has(&spec.publisher)),
        ]
        .into_iter()
        .find(|(_, _, installed)| !installed);

        Ok(match missing {
            Some((kind, name, _)) => {
                BidStrategyResponse::reject(format!("node does not support {} {}", kind, name))
            }
            None => BidStrategyResponse::bid(),
        })
    }

    async fn should_bid_based_on_usage(
        &self,
        _request: &BidStrategyRequest,
        _usage: &ResourceUsage,
    ) -> Result<BidStrategyResponse> {
        Ok(BidStrategyResponse::bid())
    }
}

/// Bids only if every strategy bids; the first rejection's reason wins.
#[derive(Default, Clone)]
pub struct ChainedBidStrategy {
    strategies: Vec<Arc<dyn BidStrategy>>,
}

impl ChainedBidStrategy {
    pub fn new(strategies: Vec<Arc<dyn BidStrategy>>) -> Self {
        Self { strategies }
    }
}

#[async_trait]
impl BidStrategy for ChainedBidStrategy {
    async fn should_bid(&self, request: &BidStrategyRequest) -> Result<BidStrategyResponse> {
        for strategy in &self.strategies {
            let response = strategy.should_bid(request).await?;
            if !response.should_bid {
                return Ok(response);
            }
        }
        Ok(BidStrategyResponse::bid())
    }

    async fn should_bid_based_on_usage(
        &self,
        request: &BidStrategyRequest,
        usage: &ResourceUsage,
    ) -> Result<BidStrategyResponse> {
        for strategy in &self.strategies {
            let response = strategy.should_bid_based_on_usage(request, usage).await?;
            if !response.should_bid {
                return Ok(response);
            }
        }
        Ok(BidStrategyResponse::bid())
    }
}
