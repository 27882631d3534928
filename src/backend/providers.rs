use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::models::ExecutionShard;

/// What an executor reports after a shard ran to the end.
///
/// A non-zero exit code is still a finished run; `error_msg` marks a run the
/// executor itself could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub error_msg: String,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn run_shard(
        &self,
        execution_id: &str,
        shard: &ExecutionShard,
        results_dir: &Path,
    ) -> Result<RunCommandResult, BackendError>;

    async fn cancel_shard(&self, execution_id: &str, shard: &ExecutionShard)
        -> Result<(), BackendError>;
}

#[async_trait]
pub trait Verifier: Send + Sync {
    /// Where the executor should stage this execution's results.
    async fn get_result_path(
        &self,
        execution_id: &str,
        shard: &ExecutionShard,
    ) -> Result<PathBuf, BackendError>;

    async fn get_proposal(
        &self,
        execution_id: &str,
        shard: &ExecutionShard,
        results_dir: &Path,
    ) -> Result<Vec<u8>, BackendError>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish staged results, returning where they now live.
    async fn publish_shard_result(
        &self,
        execution_id: &str,
        shard: &ExecutionShard,
        results_dir: &Path,
    ) -> Result<String, BackendError>;
}

/// Name-keyed lookup of providers of one kind.
pub struct ProviderRegistry<T: ?Sized> {
    kind: &'static str,
    providers: HashMap<String, Arc<T>>,
}

impl<T: ?Sized> ProviderRegistry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            providers: HashMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, provider: Arc<T>) -> Self {
        self.register(name, provider);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<T>) {
        let name = name.into();
        tracing::debug!(kind = self.kind, name = %name, "Registered provider");
        self.providers.insert(name, provider);
    }

    /// Unknown names are a permanent failure for the caller.
    pub fn get(&self, name: &str) -> Result<Arc<T>, BackendError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::ProviderNotFound {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    pub fn has(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
