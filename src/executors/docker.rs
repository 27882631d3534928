use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::backend::{Executor, RunCommandResult};
use crate::config::SandboxConfig;
use crate::error::BackendError;
use crate::models::ExecutionShard;

/// Mount point of the results directory inside the container.
const OUTPUTS_MOUNT: &str = "/outputs";

/// Runs shards in Docker containers with security isolation.
///
/// Every container runs with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
///
/// The container is named after the execution ID so it can be killed on
/// cancel, on timeout, or when the running future is dropped.
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    config: SandboxConfig,
}

/// Kills the named container if dropped before the run finished.
struct ContainerGuard {
    name: String,
    armed: bool,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let name = std::mem::take(&mut self.name);
        tracing::debug!(container = %name, "Run abandoned, killing container");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                // awaited on the runtime so the kill process is reaped
                handle.spawn(async move {
                    if let Err(e) = kill_container(&name).await {
                        tracing::warn!(container = %name, error = %e, "Failed to kill abandoned container");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(container = %name, "No runtime to kill abandoned container");
            }
        }
    }
}

async fn kill_container(name: &str) -> Result<(), BackendError> {
    let output = Command::new("docker")
        .args(["kill", name])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| BackendError::Executor(format!("failed to run docker kill: {}", e)))?;
    kill_outcome(name, output.status.success(), &String::from_utf8_lossy(&output.stderr))
}

fn kill_outcome(name: &str, success: bool, stderr: &str) -> Result<(), BackendError> {
    // already gone counts as killed
    if success || stderr.contains("No such container") || stderr.contains("is not running") {
        return Ok(());
    }
    Err(BackendError::Executor(format!(
        "docker kill {} failed: {}",
        name,
        stderr.trim()
    )))
}

impl DockerExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn container_name(execution_id: &str) -> String {
        format!("compute-{}", execution_id)
    }

    pub fn build_args(
        &self,
        execution_id: &str,
        shard: &ExecutionShard,
        results_dir: &Path,
    ) -> Vec<String> {
        let spec = &shard.job.spec;
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            format!("--name={}", Self::container_name(execution_id)),
        ];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        // drop all capabilities, no new privileges
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        args.push(format!("--volume={}:{}", results_dir.display(), OUTPUTS_MOUNT));
        args.push(format!("--env=SHARD_INDEX={}", shard.index));

        args.push(spec.image.clone().unwrap_or_else(|| self.config.image.clone()));
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(spec.command.clone());
        args
    }

    async fn write_outputs(results_dir: &Path, result: &RunCommandResult) -> std::io::Result<()> {
        tokio::fs::create_dir_all(results_dir).await?;
        tokio::fs::write(results_dir.join("stdout"), &result.stdout).await?;
        tokio::fs::write(results_dir.join("stderr"), &result.stderr).await?;
        tokio::fs::write(results_dir.join("exitCode"), result.exit_code.to_string()).await?;
        Ok(())
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    async fn run_shard(
        &self,
        execution_id: &str,
        shard: &ExecutionShard,
        results_dir: &Path,
    ) -> Result<RunCommandResult, BackendError> {
        let args = self.build_args(execution_id, shard, results_dir);
        tracing::info!(execution_id, shard = %shard, "Starting container");

        let mut guard = ContainerGuard {
            name: Self::container_name(execution_id),
            armed: true,
        };
        let output = Command::new("docker")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;
        guard.armed = false;

        let output = output.map_err(|e| {
            tracing::error!(execution_id, error = %e, "Failed to start container");
            BackendError::Executor(format!("failed to start docker: {}", e))
        })?;

        let mut result = RunCommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            error_msg: String::new(),
        };
        if output.status.code().is_none() {
            result.error_msg = "container terminated by signal".to_string();
        }

        if let Err(e) = Self::write_outputs(results_dir, &result).await {
            result.error_msg = format!("writing outputs: {}", e);
        }

        tracing::info!(
            execution_id,
            exit_code = result.exit_code,
            "Container finished"
        );
        Ok(result)
    }

    async fn cancel_shard(
        &self,
        execution_id: &str,
        _shard: &ExecutionShard,
    ) -> Result<(), BackendError> {
        kill_container(&Self::container_name(execution_id)).await
    }
}
