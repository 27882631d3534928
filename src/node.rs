use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::Registry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    BaseService, BaseServiceParams, Callback, ChainedCallback, ComputeEvent,
    EventEmitterCallback, Executor, ProviderRegistry, Publisher, Service, ServiceBuffer,
    StateUpdateCallback, Verifier,
};
use crate::capacity::{DefaultsUsageCalculator, LocalCapacityTracker};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::executors::{DockerExecutor, NoopExecutor, NoopPublisher, NoopVerifier, DOCKER, NOOP};
use crate::frontend::{
    BidStrategy, ChainedBidStrategy, FrontendService, FrontendServiceParams,
    MaxCapacityStrategy, ProvidersInstalledStrategy,
};
use crate::metrics::PrometheusMetrics;
use crate::models::ExecutionState;
use crate::status::{run_status_server, StatusState};
use crate::store::{self, ExecutionStore, UpdateExecutionStateRequest};

/// Comment recorded on executions found accepted or mid-flight when the
/// node starts.
pub const INTERRUPTED_COMMENT: &str = "execution interrupted by node restart";

/// Named executors, verifiers and publishers available to a node.
#[derive(Clone)]
pub struct Providers {
    pub executors: Arc<ProviderRegistry<dyn Executor>>,
    pub verifiers: Arc<ProviderRegistry<dyn Verifier>>,
    pub publishers: Arc<ProviderRegistry<dyn Publisher>>,
}

impl Providers {
    /// `noop` for every kind plus the sandboxed `docker` engine.
    pub fn from_config(config: &NodeConfig) -> Self {
        let executors = ProviderRegistry::<dyn Executor>::new("executor")
            .with(NOOP, Arc::new(NoopExecutor::default()))
            .with(DOCKER, Arc::new(DockerExecutor::new(config.sandbox.clone())));
        let verifiers = ProviderRegistry::<dyn Verifier>::new("verifier")
            .with(NOOP, Arc::new(NoopVerifier::new(config.results_dir.clone())));
        let publishers =
            ProviderRegistry::<dyn Publisher>::new("publisher").with(NOOP, Arc::new(NoopPublisher));

        Self {
            executors: Arc::new(executors),
            verifiers: Arc::new(verifiers),
            publishers: Arc::new(publishers),
        }
    }
}

/// Assembles a [`ComputeNode`]; anything left unset is derived from the config.
pub struct ComputeNodeBuilder {
    config: NodeConfig,
    store: Option<Arc<dyn ExecutionStore>>,
    providers: Option<Providers>,
    bid_strategy: Option<Arc<dyn BidStrategy>>,
    callbacks: Vec<Arc<dyn Callback>>,
    registry: Registry,
}

impl ComputeNodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            store: None,
            providers: None,
            bid_strategy: None,
            callbacks: Vec::new(),
            registry: Registry::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_providers(mut self, providers: Providers) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn with_bid_strategy(mut self, strategy: Arc<dyn BidStrategy>) -> Self {
        self.bid_strategy = Some(strategy);
        self
    }

    /// Extra listener, called after the store has been updated.
    pub fn with_callback(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Wire the node together.
    ///
    /// 1. Opens the store (unless one was supplied) and fails any execution
    ///    left mid-flight by a previous process
    /// 2. Registers node-scoped Prometheus counters
    /// 3. Chains the callback listeners: store updates first, then the event
    ///    emitter, then any extra listeners
    /// 4. Stacks the admission buffer on the base service
    /// 5. Builds the frontend with the default bid strategy chain unless one
    ///    was supplied
    ///
    /// Returns the node and the receiving half of its outbound event channel.
    pub fn build(self) -> Result<(ComputeNode, mpsc::Receiver<ComputeEvent>)> {
        let config = self.config;
        let store = match self.store {
            Some(store) => store,
            None => store::open(&config.store)?,
        };
        fail_interrupted(store.as_ref())?;

        let metrics = Arc::new(PrometheusMetrics::new(&self.registry, config.node_id.clone())?);
        let providers = self
            .providers
            .unwrap_or_else(|| Providers::from_config(&config));

        let (events_tx, events_rx) = mpsc::channel(config.event_buffer_size.max(1));
        let mut callback = ChainedCallback::new(vec![
            Arc::new(StateUpdateCallback::new(store.clone(), metrics.clone())) as Arc<dyn Callback>,
            Arc::new(EventEmitterCallback::new(config.node_id.clone(), events_tx)),
        ]);
        for extra in self.callbacks {
            callback.push(extra);
        }
        let callback: Arc<dyn Callback> = Arc::new(callback);

        let base = Arc::new(BaseService::new(BaseServiceParams {
            node_id: config.node_id.clone(),
            store: store.clone(),
            callback: callback.clone(),
            executors: providers.executors.clone(),
            verifiers: providers.verifiers.clone(),
            publishers: providers.publishers.clone(),
            default_job_timeout: config.buffer.default_job_timeout,
        }));

        let capacity = Arc::new(LocalCapacityTracker::new(config.capacity.total));
        let buffer = ServiceBuffer::new(base, callback, capacity.clone(), &config.buffer);

        let bid_strategy: Arc<dyn BidStrategy> = match self.bid_strategy {
            Some(strategy) => strategy,
            None => Arc::new(ChainedBidStrategy::new(vec![
                Arc::new(ProvidersInstalledStrategy::new(
                    providers.executors.clone(),
                    providers.verifiers.clone(),
                    providers.publishers.clone(),
                )) as Arc<dyn BidStrategy>,
                Arc::new(MaxCapacityStrategy::new(config.capacity.total)),
            ])),
        };

        let frontend = Arc::new(FrontendService::new(FrontendServiceParams {
            node_id: config.node_id.clone(),
            store: store.clone(),
            usage_calculator: Arc::new(DefaultsUsageCalculator::new(config.capacity.job_defaults)),
            bid_strategy,
            backend: Arc::new(buffer.clone()) as Arc<dyn Service>,
            metrics: metrics.clone(),
        }));

        tracing::info!(
            node_id = %config.node_id,
            capacity = %config.capacity.total,
            executors = ?providers.executors.names(),
            "Compute node ready"
        );

        let node = ComputeNode {
            config,
            store,
            frontend,
            buffer,
            capacity,
            metrics,
            registry: self.registry,
        };
        Ok((node, events_rx))
    }
}

/// Accepted or running executions belong to a process that is gone: its
/// admission queue and dispatched tasks died with it. `Created` bids are
/// left for the requester to accept or reject.
fn fail_interrupted(store: &dyn ExecutionStore) -> Result<()> {
    let interrupted = store
        .get_active_executions()?
        .into_iter()
        .filter(|e| e.state == ExecutionState::BidAccepted || e.state.is_executing());
    for execution in interrupted {
        tracing::warn!(
            execution_id = %execution.id,
            state = %execution.state,
            "Found interrupted execution, marking failed"
        );
        store.update_execution_state(
            UpdateExecutionStateRequest::new(&execution.id, ExecutionState::Failed)
                .expect_version(execution.version)
                .with_comment(INTERRUPTED_COMMENT),
        )?;
    }
    Ok(())
}

/// A compute node: store, backend stack and protocol frontend.
pub struct ComputeNode {
    pub config: NodeConfig,
    pub store: Arc<dyn ExecutionStore>,
    pub frontend: Arc<FrontendService>,
    pub buffer: ServiceBuffer,
    pub capacity: Arc<LocalCapacityTracker>,
    pub metrics: Arc<PrometheusMetrics>,
    pub registry: Registry,
}

impl ComputeNode {
    pub fn new(config: NodeConfig) -> Result<(Self, mpsc::Receiver<ComputeEvent>)> {
        ComputeNodeBuilder::new(config).build()
    }

    pub fn builder(config: NodeConfig) -> ComputeNodeBuilder {
        ComputeNodeBuilder::new(config)
    }

    /// Run until `shutdown` fires or the event channel closes.
    ///
    /// Serves the status API when `status_addr` is set and logs every
    /// outbound event. On shutdown, reports whatever is still running or
    /// queued; dispatched tasks are left to finish on the runtime.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<ComputeEvent>,
        status_addr: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if let Some(addr) = status_addr {
            let state = StatusState {
                node_id: self.config.node_id.clone(),
                store: self.store.clone(),
                buffer: self.buffer.clone(),
                registry: self.registry.clone(),
            };
            let token = shutdown.clone();
            tokio::spawn(async move {
                run_status_server(addr, state, token).await;
            });
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => log_event(&event),
                    None => break,
                },
            }
        }

        let running = self.buffer.running_executions();
        let enqueued = self.buffer.enqueued_executions();
        if !running.is_empty() || !enqueued.is_empty() {
            tracing::warn!(
                running = running.len(),
                enqueued = enqueued.len(),
                "Shutting down with executions in flight"
            );
        }
        tracing::info!(node_id = %self.config.node_id, "Compute node stopped");
        Ok(())
    }
}

fn log_event(event: &ComputeEvent) {
    match serde_json::to_string(event) {
        Ok(json) => tracing::info!(execution_id = %event.execution_id(), event = %json, "Compute event"),
        Err(e) => tracing::warn!(error = %e, "Failed to encode compute event"),
    }
}
