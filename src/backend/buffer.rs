use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Callback, Service};
use crate::capacity::CapacityTracker;
use crate::config::BufferConfig;
use crate::error::BackendError;
use crate::models::{Execution, ResourceUsage};

/// Slack given to the delegate past the job timeout before the buffer
/// abandons the run itself. The delegate enforces the timeout first.
const DEADLINE_GRACE: Duration = Duration::from_secs(2);

struct RunningSlot {
    usage: ResourceUsage,
    token: CancellationToken,
}

#[derive(Default)]
struct BufferState {
    enqueued: HashMap<String, Execution>,
    /// Submission order of `enqueued`
    queue: VecDeque<String>,
    running: HashMap<String, RunningSlot>,
    backoff_until: Option<Instant>,
}

struct Inner {
    delegate: Arc<dyn Service>,
    callback: Arc<dyn Callback>,
    capacity: Arc<dyn CapacityTracker>,
    default_job_timeout: Duration,
    backoff: Duration,
    state: Mutex<BufferState>,
}

/// Admission control in front of a [`Service`].
///
/// `run` queues work and starts it, in submission order, as soon as the
/// capacity tracker has room. Each started execution runs on its own task
/// under the job timeout; capacity is released when that task ends however
/// it ends. `publish` goes straight to the delegate, and so does `cancel`
/// once any local dispatch or queue entry for the execution is dropped.
#[derive(Clone)]
pub struct ServiceBuffer {
    inner: Arc<Inner>,
}

impl ServiceBuffer {
    pub fn new(
        delegate: Arc<dyn Service>,
        callback: Arc<dyn Callback>,
        capacity: Arc<dyn CapacityTracker>,
        config: &BufferConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                delegate,
                callback,
                capacity,
                default_job_timeout: config.default_job_timeout,
                backoff: config.backoff,
                state: Mutex::new(BufferState::default()),
            }),
        }
    }

    /// IDs of dispatched executions that have not finished yet.
    pub fn running_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().running.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// IDs waiting for capacity, in dispatch order.
    pub fn enqueued_executions(&self) -> Vec<String> {
        self.inner.lock().queue.iter().cloned().collect()
    }

    fn admit(&self, execution: Execution) -> Result<(), BackendError> {
        let mut state = self.inner.lock();
        let id = execution.id.clone();

        if !self.inner.capacity.is_within_limits(&execution.resource_usage) {
            return Err(BackendError::CapacityExceeded(id));
        }
        if state.enqueued.contains_key(&id) {
            return Err(BackendError::AlreadyEnqueued(id));
        }
        if state.running.contains_key(&id) {
            return Err(BackendError::AlreadyRunning(id));
        }

        tracing::debug!(execution_id = %id, usage = %execution.resource_usage, "Enqueued execution");
        state.queue.push_back(id.clone());
        state.enqueued.insert(id, execution);
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // every mutation below completes before the guard drops
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start queued executions while the head of the queue fits.
    ///
    /// Submission-triggered drains are skipped while work is running and a
    /// previous drain left the queue blocked less than `backoff` ago.
    /// Completion-triggered drains always run.
    fn drain(self: &Arc<Self>, after_completion: bool) {
        let mut state = self.lock();
        let now = Instant::now();

        if !after_completion && !state.running.is_empty() {
            if let Some(until) = state.backoff_until {
                if now < until {
                    tracing::trace!("Skipping drain during backoff");
                    return;
                }
            }
        }

        while let Some(id) = state.queue.front().cloned() {
            let usage = match state.enqueued.get(&id) {
                Some(execution) => execution.resource_usage,
                None => {
                    state.queue.pop_front();
                    continue;
                }
            };
            if !self.capacity.add_if_has_capacity(&usage) {
                break;
            }

            state.queue.pop_front();
            let Some(execution) = state.enqueued.remove(&id) else {
                self.capacity.remove(&usage);
                continue;
            };
            let token = CancellationToken::new();
            state.running.insert(
                id,
                RunningSlot {
                    usage,
                    token: token.clone(),
                },
            );
            self.dispatch(execution, token);
        }

        state.backoff_until = if state.queue.is_empty() {
            None
        } else {
            Some(now + self.backoff)
        };
    }

    fn dispatch(self: &Arc<Self>, execution: Execution, token: CancellationToken) {
        let inner = Arc::clone(self);
        let id = execution.id.clone();
        let timeout = execution
            .shard
            .job
            .spec
            .timeout()
            .unwrap_or(self.default_job_timeout);

        tracing::debug!(execution_id = %id, timeout = ?timeout, "Dispatching execution");

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = tokio::time::timeout(timeout + DEADLINE_GRACE, inner.delegate.run(execution)) => Some(result),
            };

            match outcome {
                None => {
                    tracing::debug!(execution_id = %id, "Dispatch cancelled");
                }
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    tracing::warn!(execution_id = %id, error = %e, "Delegate run failed");
                    inner.callback.on_run_failure(&id, &e);
                }
                Some(Err(_)) => {
                    tracing::warn!(execution_id = %id, timeout = ?timeout, "Execution timed out");
                    inner
                        .callback
                        .on_run_failure(&id, &BackendError::ExecutionTimeout(timeout));
                }
            }

            inner.release(&id);
            inner.drain(true);
        });
    }

    fn release(&self, id: &str) {
        let slot = self.lock().running.remove(id);
        if let Some(slot) = slot {
            self.capacity.remove(&slot.usage);
            tracing::debug!(execution_id = %id, "Released capacity");
        }
    }
}

#[async_trait]
impl Service for ServiceBuffer {
    /// Admission failures are returned and also reported to the callback.
    async fn run(&self, execution: Execution) -> Result<(), BackendError> {
        let id = execution.id.clone();
        if let Err(e) = self.admit(execution) {
            tracing::warn!(execution_id = %id, error = %e, "Rejected execution");
            self.inner.callback.on_run_failure(&id, &e);
            return Err(e);
        }
        self.inner.drain(false);
        Ok(())
    }

    async fn publish(&self, execution: Execution) -> Result<(), BackendError> {
        self.inner.delegate.publish(execution).await
    }

    /// Stops a running dispatch without reporting a run failure, drops a
    /// queued execution, and passes the cancel on to the delegate.
    async fn cancel(&self, execution: Execution) -> Result<(), BackendError> {
        let dequeued = {
            let mut state = self.inner.lock();
            if let Some(slot) = state.running.get(&execution.id) {
                slot.token.cancel();
            }
            let dequeued = state.enqueued.remove(&execution.id).is_some();
            if dequeued {
                state.queue.retain(|queued| queued != &execution.id);
                tracing::debug!(execution_id = %execution.id, "Dropped queued execution");
            }
            dequeued
        };
        // the dropped entry may have been the blocked head of the queue
        if dequeued {
            self.inner.drain(false);
        }
        self.inner.delegate.cancel(execution).await
    }
}
