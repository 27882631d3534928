//! Node-scoped job counters.
//!
//! Nothing registers globally; a node gets whichever [`MetricsSink`] it is
//! built with.

use prometheus::{IntCounterVec, Opts, Registry};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMetric {
    JobsReceived,
    JobsAccepted,
    JobsCompleted,
    JobsFailed,
    JobsCancelled,
}

pub trait MetricsSink: Send + Sync {
    fn increment(&self, metric: NodeMetric);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _metric: NodeMetric) {}
}

pub struct PrometheusMetrics {
    node_id: String,
    jobs_received: IntCounterVec,
    jobs_accepted: IntCounterVec,
    jobs_completed: IntCounterVec,
    jobs_failed: IntCounterVec,
    jobs_cancelled: IntCounterVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), &["node_id"])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl PrometheusMetrics {
    pub fn new(registry: &Registry, node_id: impl Into<String>) -> Result<Self> {
        Ok(Self {
            node_id: node_id.into(),
            jobs_received: counter(
                registry,
                "compute_jobs_received_total",
                "Number of bid requests received",
            )?,
            jobs_accepted: counter(
                registry,
                "compute_jobs_accepted_total",
                "Number of shards bid on",
            )?,
            jobs_completed: counter(
                registry,
                "compute_jobs_completed_total",
                "Number of executions that published results",
            )?,
            jobs_failed: counter(
                registry,
                "compute_jobs_failed_total",
                "Number of executions that failed to run or publish",
            )?,
            jobs_cancelled: counter(
                registry,
                "compute_jobs_cancelled_total",
                "Number of executions cancelled",
            )?,
        })
    }

    pub fn get(&self, metric: NodeMetric) -> u64 {
        self.vec(metric).with_label_values(&[self.node_id.as_str()]).get()
    }

    fn vec(&self, metric: NodeMetric) -> &IntCounterVec {
        match metric {
            NodeMetric::JobsReceived => &self.jobs_received,
            NodeMetric::JobsAccepted => &self.jobs_accepted,
            NodeMetric::JobsCompleted => &self.jobs_completed,
            NodeMetric::JobsFailed => &self.jobs_failed,
            NodeMetric::JobsCancelled => &self.jobs_cancelled,
        }
    }
}

impl MetricsSink for PrometheusMetrics {
    fn increment(&self, metric: NodeMetric) {
        self.vec(metric).with_label_values(&[self.node_id.as_str()]).inc();
    }
}
