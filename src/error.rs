use thiserror::Error;

use crate::models::ExecutionState;

/// Failures surfaced by an [`ExecutionStore`](crate::store::ExecutionStore).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("no executions found for shard: {0}")]
    ExecutionsNotFoundForShard(String),

    #[error("execution history not found: {0}")]
    ExecutionHistoryNotFound(String),

    #[error("execution already exists: {0}")]
    ExecutionAlreadyExists(String),

    #[error("execution {id} is in state {actual}, expected {expected}")]
    InvalidExecutionState {
        id: String,
        actual: ExecutionState,
        expected: ExecutionState,
    },

    #[error("execution {id} is at version {actual}, expected {expected}")]
    InvalidExecutionVersion {
        id: String,
        actual: u64,
        expected: u64,
    },

    #[error("execution {id} is in terminal state {actual} and cannot move to {requested}")]
    ExecutionAlreadyTerminal {
        id: String,
        actual: ExecutionState,
        requested: ExecutionState,
    },

    #[error("new execution {id} must start in state created or bid_accepted, got {actual}")]
    InvalidNewExecution { id: String, actual: ExecutionState },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Failures from running, publishing or cancelling work.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("not enough capacity to run execution {0}")]
    CapacityExceeded(String),

    #[error("execution {0} already enqueued")]
    AlreadyEnqueued(String),

    #[error("execution {0} already running")]
    AlreadyRunning(String),

    #[error("{kind} provider not found: {name}")]
    ProviderNotFound { kind: &'static str, name: String },

    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(std::time::Duration),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("verifier error: {0}")]
    Verifier(String),

    #[error("publisher error: {0}")]
    Publisher(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ComputeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("bid strategy error: {0}")]
    BidStrategy(String),

    #[error("usage calculation error: {0}")]
    UsageCalculation(String),

    #[error("cannot cancel execution {id} in terminal state {state}")]
    CannotCancel { id: String, state: ExecutionState },

    #[error("no shards accepted for job {job_id}: {reason}")]
    NoShardsAccepted { job_id: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ComputeError>;
