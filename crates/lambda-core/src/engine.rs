//! Engine assembly and background lifecycle.
//!
//! Builds one container pool per enabled execution mode, wires them into a
//! dispatcher together with the shared metrics ledger, and runs the warm-up and
//! idle-reaper tasks. Warm-up progress is published on a watch channel so the
//! health endpoint can report it.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::LambdaConfig;
use crate::dispatcher::{Dispatcher, DispatcherSettings};
use crate::errors::SandboxError;
use crate::language::ExecutionMode;
use crate::metrics::MetricsAggregator;
use crate::pool::{ContainerPool, WarmupReport};
use crate::sandbox::{DockerSandbox, SandboxRuntime};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WarmupState {
    Pending,
    Ready { spawned: usize, failed: usize },
    Failed { message: String },
}

pub struct Engine {
    dispatcher: Arc<Dispatcher>,
    pools: BTreeMap<ExecutionMode, ContainerPool>,
    metrics: Arc<MetricsAggregator>,
    warmup_tx: watch::Sender<WarmupState>,
    idle_timeout: Duration,
    reap_interval: Duration,
}

impl Engine {
    /// Build an engine over explicit backends, one per execution mode.
    pub fn new(config: &LambdaConfig, runtimes: Vec<(ExecutionMode, Arc<dyn SandboxRuntime>)>) -> Self {
        let metrics = Arc::new(MetricsAggregator::new());
        let mut dispatcher = Dispatcher::new(DispatcherSettings::from_config(config), metrics.clone());
        let mut pools = BTreeMap::new();

        for (mode, runtime) in runtimes {
            let pool = ContainerPool::new(runtime, config.pool.max_size);
            dispatcher = dispatcher.with_pool(mode, pool.clone());
            pools.insert(mode, pool);
        }

        let (warmup_tx, _) = watch::channel(WarmupState::Pending);

        Self {
            dispatcher: Arc::new(dispatcher),
            pools,
            metrics,
            warmup_tx,
            idle_timeout: config.pool.idle_timeout(),
            reap_interval: config.pool.reap_interval(),
        }
    }

    /// Build an engine backed by the local Docker daemon, adding a gVisor pool
    /// when it is enabled in the configuration.
    pub fn from_config(config: &LambdaConfig) -> Result<Self, SandboxError> {
        let images = config.runtimes.images.clone();
        let mut runtimes: Vec<(ExecutionMode, Arc<dyn SandboxRuntime>)> = vec![(
            ExecutionMode::Docker,
            Arc::new(DockerSandbox::docker(images.clone())?),
        )];

        if config.runtimes.gvisor.enabled {
            log::info!(
                "gVisor execution enabled with runtime '{}'",
                config.runtimes.gvisor.runtime
            );
            runtimes.push((
                ExecutionMode::GVisor,
                Arc::new(DockerSandbox::gvisor(images, config.runtimes.gvisor.runtime.clone())?),
            ));
        }

        Ok(Self::new(config, runtimes))
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn pool(&self, mode: ExecutionMode) -> Option<&ContainerPool> {
        self.pools.get(&mode)
    }

    pub fn warmup_status(&self) -> watch::Receiver<WarmupState> {
        self.warmup_tx.subscribe()
    }

    pub fn warmup_state(&self) -> WarmupState {
        self.warmup_tx.borrow().clone()
    }

    /// Warm every pool and publish the outcome.
    pub async fn warm_up(&self) -> WarmupState {
        let mut total = WarmupReport::default();
        for (mode, pool) in &self.pools {
            let report = pool.warm_up().await;
            for error in &report.errors {
                log::warn!("{} warm-up spawn failed: {}", mode, error);
            }
            total.spawned += report.spawned;
            total.failed += report.failed;
            total.errors.extend(report.errors);
        }

        let state = if total.spawned == 0 && total.failed > 0 {
            WarmupState::Failed {
                message: total.errors.first().cloned().unwrap_or_default(),
            }
        } else {
            WarmupState::Ready {
                spawned: total.spawned,
                failed: total.failed,
            }
        };

        match &state {
            WarmupState::Failed { message } => log::error!("Warm-up failed: {}", message),
            _ => log::info!(
                "Warm-up finished: {} containers started, {} failed",
                total.spawned,
                total.failed
            ),
        }
        self.warmup_tx.send_replace(state.clone());
        state
    }

    /// Run `warm_up` in the background; requests are served meanwhile.
    pub fn start_warm_up(self: &Arc<Self>) -> JoinHandle<WarmupState> {
        let engine = self.clone();
        tokio::spawn(async move { engine.warm_up().await })
    }

    /// Destroy long-idle containers on an interval until the task is aborted.
    pub fn start_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.reap_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for (mode, pool) in &engine.pools {
                    let evicted = pool.evict_idle(engine.idle_timeout).await;
                    if evicted > 0 {
                        log::info!("Recycled {} idle {} containers", evicted, mode);
                    }
                }
            }
        })
    }

    /// Idle containers per mode and language.
    pub async fn pool_sizes(&self) -> BTreeMap<String, BTreeMap<String, usize>> {
        let mut sizes = BTreeMap::new();
        for (mode, pool) in &self.pools {
            sizes.insert(mode.label().to_string(), pool.snapshot().await);
        }
        sizes
    }

    /// Close every pool and destroy its idle containers.
    pub async fn shutdown(&self) {
        for (mode, pool) in &self.pools {
            let destroyed = pool.shutdown().await;
            log::info!("{} pool closed ({} containers removed)", mode, destroyed);
        }
    }
}
