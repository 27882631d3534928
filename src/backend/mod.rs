//! The execution side of the compute node.
//!
//! A [`Service`] runs, publishes and cancels executions; outcomes travel
//! through a [`Callback`] rather than return values.

mod base;
mod buffer;
pub mod callback;
mod providers;

pub use base::{BaseService, BaseServiceParams};
pub use buffer::ServiceBuffer;
pub use callback::{
    ChainedCallback, ComputeEvent, EventEmitterCallback, StateUpdateCallback,
};
pub use providers::{
    Executor, ProviderRegistry, Publisher, RunCommandResult, Verifier,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::models::Execution;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Verifier's proposal over the shard's results
    pub result_proposal: Vec<u8>,
    pub run_command_result: RunCommandResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    /// Where the publisher put the results
    pub published_location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CancelResult;

/// Receives backend outcomes.
///
/// Each method gets the execution ID, never the execution itself, so a
/// listener that needs state must read it from the store.
pub trait Callback: Send + Sync {
    fn on_run_success(&self, execution_id: &str, result: &RunResult);

    fn on_run_failure(&self, execution_id: &str, err: &BackendError);

    fn on_publish_success(&self, execution_id: &str, result: &PublishResult);

    fn on_publish_failure(&self, execution_id: &str, err: &BackendError);

    fn on_cancel_success(&self, execution_id: &str, result: &CancelResult);

    fn on_cancel_failure(&self, execution_id: &str, err: &BackendError);
}

/// Runs accepted work.
///
/// An implementation either reports an outcome through its callback and
/// returns `Ok`, or returns `Err` without having reported anything. Callers
/// that get an `Err` back decide whether to report it themselves.
#[async_trait]
pub trait Service: Send + Sync {
    async fn run(&self, execution: Execution) -> Result<(), BackendError>;

    async fn publish(&self, execution: Execution) -> Result<(), BackendError>;

    async fn cancel(&self, execution: Execution) -> Result<(), BackendError>;
}
