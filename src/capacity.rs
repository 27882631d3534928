use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ComputeError, Result};
use crate::models::{Job, ResourceUsage};

/// Tracks the aggregate usage of running executions against a fixed limit.
pub trait CapacityTracker: Send + Sync {
    /// Could `usage` ever run on this node, with nothing else running.
    fn is_within_limits(&self, usage: &ResourceUsage) -> bool;

    /// Reserve `usage` if it fits next to what is already reserved.
    fn add_if_has_capacity(&self, usage: &ResourceUsage) -> bool;

    fn remove(&self, usage: &ResourceUsage);

    fn used(&self) -> ResourceUsage;

    fn max(&self) -> ResourceUsage;
}

#[derive(Debug)]
pub struct LocalCapacityTracker {
    max: ResourceUsage,
    used: Mutex<ResourceUsage>,
}

impl LocalCapacityTracker {
    pub fn new(max: ResourceUsage) -> Self {
        Self {
            max,
            used: Mutex::new(ResourceUsage::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResourceUsage> {
        self.used.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CapacityTracker for LocalCapacityTracker {
    fn is_within_limits(&self, usage: &ResourceUsage) -> bool {
        usage.fits_within(&self.max)
    }

    fn add_if_has_capacity(&self, usage: &ResourceUsage) -> bool {
        let mut used = self.lock();
        let next = used.add(usage);
        if !next.fits_within(&self.max) {
            return false;
        }
        *used = next;
        true
    }

    fn remove(&self, usage: &ResourceUsage) {
        let mut used = self.lock();
        *used = used.sub(usage);
    }

    fn used(&self) -> ResourceUsage {
        *self.lock()
    }

    fn max(&self) -> ResourceUsage {
        self.max
    }
}

/// Computes the resources a job's shard will need on this node.
#[async_trait]
pub trait UsageCalculator: Send + Sync {
    async fn calculate(&self, job: &Job) -> Result<ResourceUsage>;
}

/// Takes the job's requested resources and fills unset dimensions from
/// node-wide defaults.
#[derive(Debug, Clone)]
pub struct DefaultsUsageCalculator {
    defaults: ResourceUsage,
}

impl DefaultsUsageCalculator {
    pub fn new(defaults: ResourceUsage) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl UsageCalculator for DefaultsUsageCalculator {
    async fn calculate(&self, job: &Job) -> Result<ResourceUsage> {
        let usage = job.spec.resources.with_defaults(&self.defaults);
        if usage.cpu < 0.0 || usage.cpu.is_nan() {
            return Err(ComputeError::UsageCalculation(format!(
                "job {} requests invalid cpu {}",
                job.id, usage.cpu
            )));
        }
        Ok(usage)
    }
}
