//! Durable, versioned storage for executions and their history.
//!
//! All transition rules live in [`KvExecutionStore`]; a storage engine only
//! supplies the narrow [`KvBackend`] transaction abstraction.

mod counter;
mod kv;
pub mod memory;
pub mod sqlite;

pub use counter::StateCounter;
pub use kv::{KvBackend, KvExecutionStore, KvRead, KvTxn};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use std::path::Path;
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::models::{Execution, ExecutionHistory, ExecutionState};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Comment recorded on the history entry written at creation.
pub const NEW_EXECUTION_COMMENT: &str = "Execution created";

/// A conditional state transition.
///
/// `expected_state` and `expected_version` are optional optimistic checks;
/// `None` skips the check.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateExecutionStateRequest {
    pub execution_id: String,
    pub new_state: ExecutionState,
    pub expected_state: Option<ExecutionState>,
    pub expected_version: Option<u64>,
    pub comment: String,
}

impl UpdateExecutionStateRequest {
    pub fn new(execution_id: impl Into<String>, new_state: ExecutionState) -> Self {
        Self {
            execution_id: execution_id.into(),
            new_state,
            expected_state: None,
            expected_version: None,
            comment: String::new(),
        }
    }

    pub fn expect_state(mut self, state: ExecutionState) -> Self {
        self.expected_state = Some(state);
        self
    }

    pub fn expect_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

/// Storage contract shared by every engine.
///
/// Returned values are copies; mutating them has no effect on stored state.
pub trait ExecutionStore: Send + Sync {
    fn get_execution(&self, id: &str) -> StoreResult<Execution>;

    /// Executions of a shard, ascending by update time.
    fn get_executions(&self, shard_id: &str) -> StoreResult<Vec<Execution>>;

    /// Executions currently holding backend resources, ascending by update time.
    fn get_live_executions(&self) -> StoreResult<Vec<Execution>>;

    /// Every non-terminal execution, ascending by update time.
    fn get_active_executions(&self) -> StoreResult<Vec<Execution>>;

    fn get_execution_history(&self, id: &str) -> StoreResult<Vec<ExecutionHistory>>;

    fn create_execution(&self, execution: Execution) -> StoreResult<()>;

    fn update_execution_state(&self, request: UpdateExecutionStateRequest) -> StoreResult<()>;

    /// Removes the record, its shard index entry and its history as one unit.
    fn delete_execution(&self, id: &str) -> StoreResult<()>;

    fn get_execution_count(&self, state: ExecutionState) -> StoreResult<u64>;
}

/// Open the store described by `config`.
pub fn open(config: &StoreConfig) -> StoreResult<Arc<dyn ExecutionStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(KvExecutionStore::open(MemoryBackend::new())?)),
        StoreConfig::Sqlite { path } => open_sqlite(path),
    }
}

pub fn open_sqlite(path: &Path) -> StoreResult<Arc<dyn ExecutionStore>> {
    Ok(Arc::new(KvExecutionStore::open(SqliteBackend::open(path)?)?))
}
