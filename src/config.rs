use std::path::PathBuf;
use std::time::Duration;

use crate::models::ResourceUsage;

/// Configuration for the Docker executor.
///
/// Jobs run in sandboxed containers; the job spec's own image overrides
/// `image` when set.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Docker image used when the job names none
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

/// Which engine backs the execution store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreConfig {
    #[default]
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct CapacityConfig {
    /// Upper bound on the aggregate usage of running executions
    pub total: ResourceUsage,
    /// Filled into any dimension a job leaves at zero
    pub job_defaults: ResourceUsage,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            total: ResourceUsage::new(4.0, 8 * 1024 * 1024 * 1024, 100 * 1024 * 1024 * 1024, 0),
            job_defaults: ResourceUsage::new(0.1, 100 * 1024 * 1024, 0, 0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Applied when a job carries no timeout of its own
    pub default_job_timeout: Duration,
    /// Minimum gap between submission-triggered drains while saturated
    pub backoff: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            default_job_timeout: Duration::from_secs(10 * 60),
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub store: StoreConfig,
    pub capacity: CapacityConfig,
    pub buffer: BufferConfig,
    /// Staging root for shard results
    pub results_dir: PathBuf,
    pub sandbox: SandboxConfig,
    /// Bound of the outbound event channel
    pub event_buffer_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            store: StoreConfig::default(),
            capacity: CapacityConfig::default(),
            buffer: BufferConfig::default(),
            results_dir: std::env::temp_dir().join("compute-node").join("results"),
            sandbox: SandboxConfig::default(),
            event_buffer_size: 1024,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_total_capacity(mut self, total: ResourceUsage) -> Self {
        self.capacity.total = total;
        self
    }

    pub fn with_job_defaults(mut self, defaults: ResourceUsage) -> Self {
        self.capacity.job_defaults = defaults;
        self
    }

    pub fn with_default_job_timeout(mut self, timeout: Duration) -> Self {
        self.buffer.default_job_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.buffer.backoff = backoff;
        self
    }

    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }
}
