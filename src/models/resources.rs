use serde::{Deserialize, Serialize};

/// Resource demand of a shard, or the capacity of a node.
///
/// Zero means "unspecified" for a job and "none" for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU units (cores, may be fractional)
    pub cpu: f64,
    /// Memory in bytes
    pub memory: u64,
    /// Disk in bytes
    pub disk: u64,
    /// Number of GPUs
    pub gpu: u64,
}

impl ResourceUsage {
    pub fn new(cpu: f64, memory: u64, disk: u64, gpu: u64) -> Self {
        Self {
            cpu,
            memory,
            disk,
            gpu,
        }
    }

    pub fn cpu(cpu: f64) -> Self {
        Self {
            cpu,
            ..Self::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu <= 0.0 && self.memory == 0 && self.disk == 0 && self.gpu == 0
    }

    pub fn add(&self, other: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu: self.cpu + other.cpu,
            memory: self.memory.saturating_add(other.memory),
            disk: self.disk.saturating_add(other.disk),
            gpu: self.gpu.saturating_add(other.gpu),
        }
    }

    /// Subtract, clamping every dimension at zero.
    pub fn sub(&self, other: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: self.memory.saturating_sub(other.memory),
            disk: self.disk.saturating_sub(other.disk),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }

    /// True if every dimension of `self` fits inside `limit`.
    pub fn fits_within(&self, limit: &ResourceUsage) -> bool {
        // tolerate float drift from repeated add/sub of fractional cpu
        self.cpu <= limit.cpu + 1e-9
            && self.memory <= limit.memory
            && self.disk <= limit.disk
            && self.gpu <= limit.gpu
    }

    /// Fill every unspecified (zero) dimension from `defaults`.
    pub fn with_defaults(&self, defaults: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu: if self.cpu > 0.0 { self.cpu } else { defaults.cpu },
            memory: if self.memory > 0 {
                self.memory
            } else {
                defaults.memory
            },
            disk: if self.disk > 0 { self.disk } else { defaults.disk },
            gpu: if self.gpu > 0 { self.gpu } else { defaults.gpu },
        }
    }
}

impl std::fmt::Display for ResourceUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu={} memory={} disk={} gpu={}",
            self.cpu, self.memory, self.disk, self.gpu
        )
    }
}
