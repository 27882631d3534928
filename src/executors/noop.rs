use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{Executor, Publisher, RunCommandResult, Verifier};
use crate::error::BackendError;
use crate::models::ExecutionShard;

/// Succeeds without running anything, optionally after a delay.
#[derive(Debug, Clone, Default)]
pub struct NoopExecutor {
    delay: Option<Duration>,
}

impl NoopExecutor {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

#[async_trait]
impl Executor for NoopExecutor {
    async fn run_shard(
        &self,
        execution_id: &str,
        shard: &ExecutionShard,
        _results_dir: &Path,
    ) -> Result<RunCommandResult, BackendError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        tracing::debug!(execution_id, shard = %shard, "Noop executor finished shard");
        Ok(RunCommandResult::default())
    }

    async fn cancel_shard(
        &self,
        _execution_id: &str,
        _shard: &ExecutionShard,
    ) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Stages results under `<root>/<execution_id>` and proposes nothing.
#[derive(Debug, Clone)]
pub struct NoopVerifier {
    root: PathBuf,
}

impl NoopVerifier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Verifier for NoopVerifier {
    async fn get_result_path(
        &self,
        execution_id: &str,
        _shard: &ExecutionShard,
    ) -> Result<PathBuf, BackendError> {
        let path = self.root.join(execution_id);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| BackendError::Verifier(format!("preparing results path: {}", e)))?;
        Ok(path)
    }

    async fn get_proposal(
        &self,
        _execution_id: &str,
        _shard: &ExecutionShard,
        _results_dir: &Path,
    ) -> Result<Vec<u8>, BackendError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish_shard_result(
        &self,
        execution_id: &str,
        _shard: &ExecutionShard,
        _results_dir: &Path,
    ) -> Result<String, BackendError> {
        Ok(format!("noop://{}", execution_id))
    }
}
