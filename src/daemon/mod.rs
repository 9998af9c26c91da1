//! Process wiring.
//!
//! ```text
//! Syncer → decoupler → ValidationFilter → decoupler → Cache → Server → connections
//! ```
//!
//! [`ProxyDaemon::start`] waits for the datastore, builds that chain, starts every
//! long-running task under one cancellation token and hands back a [`RunningProxy`].


use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::async_task::spawn_task;
use crate::async_task::task_with_timeout_and_exponential_backoff;
use crate::poll_for_connection_limit;
use crate::start_health_server;
use crate::start_metrics_server;
use crate::BackendClient;
use crate::Cache;
use crate::ClusterTopology;
use crate::ConnectionLimiter;
use crate::HealthAggregator;
use crate::NetworkError;
use crate::ProxyConfig;
use crate::RebalancingMode;
use crate::Result;
use crate::SchemaValidator;
use crate::Server;
use crate::Syncer;
use crate::SyncerCallbacksDecoupler;
use crate::ValidationFilter;

pub struct ProxyDaemon {
    config: ProxyConfig,
    backend: Arc<dyn BackendClient>,
    topology: Option<Arc<dyn ClusterTopology>>,
    health: Arc<HealthAggregator>,
}

/// Handles to a started proxy
pub struct RunningProxy {
    pub server: Arc<Server>,
    pub cache: Cache,
    pub health: Arc<HealthAggregator>,
    /// Where downstream clients connect
    pub local_addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
    pub health_addr: Option<SocketAddr>,

    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    /// Kept alive for as long as the proxy runs
    _syncer: Box<dyn Syncer>,
}

impl ProxyDaemon {
    pub fn new(
        config: ProxyConfig,
        backend: Arc<dyn BackendClient>,
    ) -> Self {
        Self {
            config,
            backend,
            topology: None,
            health: Arc::new(HealthAggregator::new()),
        }
    }

    /// Source of cluster size for `rebalancing.mode = "topology"`
    pub fn with_topology(
        mut self,
        topology: Arc<dyn ClusterTopology>,
    ) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn health(&self) -> Arc<HealthAggregator> {
        self.health.clone()
    }

    /// Retries the backend's readiness check under the configured backoff policy
    pub async fn ensure_backend_ready(&self) -> Result<()> {
        info!("waiting for datastore to be initialized");
        let backend = self.backend.clone();
        task_with_timeout_and_exponential_backoff(
            || {
                let backend = backend.clone();
                async move { backend.ensure_initialized().await }
            },
            self.config.retry,
        )
        .await?;
        info!("datastore ready");
        Ok(())
    }

    /// Builds the pipeline and starts every task. Everything stops when `cancel`
    /// fires; [`RunningProxy::join`] waits for that.
    pub async fn start(
        self,
        cancel: CancellationToken,
    ) -> Result<RunningProxy> {
        self.ensure_backend_ready().await?;

        let Self {
            config,
            backend,
            topology,
            health,
        } = self;
        let mut tasks = Vec::new();

        let metrics_addr = if config.monitoring.prometheus_enabled {
            Some(start_metrics_server(
                config.monitoring.prometheus_port,
                cancel.child_token(),
            )?)
        } else {
            None
        };
        let health_addr = if config.monitoring.health_enabled {
            Some(start_health_server(
                config.monitoring.health_port,
                health.clone(),
                cancel.child_token(),
            )?)
        } else {
            None
        };

        // Cache
        let (cache, processor) = Cache::new(config.cache.clone(), health.clone());
        let token = cancel.child_token();
        spawn_task("snapshot_cache", move || processor.run(token), Some(&mut tasks));

        // Validation filter → cache
        let queue_capacity = config.pipeline.decoupler_queue_capacity;
        let to_cache = SyncerCallbacksDecoupler::new("validation_to_cache", queue_capacity);
        let filter = ValidationFilter::new(
            Arc::new(to_cache.sender()),
            Box::new(SchemaValidator::new(config.pipeline.validation.clone())),
        );
        let cache_sink = Arc::new(cache.clone());
        let token = cancel.child_token();
        spawn_task(
            "validation_to_cache",
            move || to_cache.send_to(cache_sink, token),
            Some(&mut tasks),
        );

        // Syncer → validation filter
        let to_filter = SyncerCallbacksDecoupler::new("syncer_to_validation", queue_capacity);
        let mut syncer = backend.syncer(Arc::new(to_filter.sender()));
        let filter = Arc::new(filter);
        let token = cancel.child_token();
        spawn_task(
            "syncer_to_validation",
            move || to_filter.send_to(filter, token),
            Some(&mut tasks),
        );
        syncer.start(cancel.child_token());

        // Server
        let server = Server::new(cache.clone(), Arc::new(config.server.clone()), health.clone());
        let local_addr = server.start(cancel.child_token()).await?;

        if config.rebalancing.mode == RebalancingMode::Topology {
            match topology {
                Some(topology) => {
                    let limiter: Arc<dyn ConnectionLimiter> = server.clone();
                    let rebalancing = config.rebalancing.clone();
                    let token = cancel.child_token();
                    spawn_task(
                        "connection_rebalancer",
                        move || poll_for_connection_limit(rebalancing, topology, limiter, token),
                        Some(&mut tasks),
                    );
                }
                None => warn!("topology rebalancing configured but no topology source given"),
            }
        }

        let interval = config.monitoring.health_report_interval();
        let reporter_health = health.clone();
        let token = cancel.child_token();
        spawn_task(
            "health_report",
            move || log_health(reporter_health, interval, token),
            Some(&mut tasks),
        );

        info!(%local_addr, "proxy started");
        Ok(RunningProxy {
            server,
            cache,
            health,
            local_addr,
            metrics_addr,
            health_addr,
            cancel,
            tasks,
            _syncer: syncer,
        })
    }
}

impl RunningProxy {
    /// Stops everything started by [`ProxyDaemon::start`]
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Waits until every task has stopped and every connection has closed
    pub async fn join(self) {
        self.server.join().await;
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("proxy task failed: {}", e);
            }
        }
        info!("proxy stopped");
    }
}

/// Periodically logs the aggregated health, loudly when it changes
async fn log_health(
    health: Arc<HealthAggregator>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut previous = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = tick.tick() => {}
        }

        let summary = health.summary();
        let overall = (summary.live, summary.ready);
        if previous != Some(overall) {
            info!(live = summary.live, ready = summary.ready, "health changed: {:?}", summary.reporters);
            previous = Some(overall);
        } else {
            debug!(live = summary.live, ready = summary.ready, "health");
        }
    }
}

/// Cancels `cancel` on SIGINT or SIGTERM, or returns once it was cancelled elsewhere.
pub async fn wait_for_shutdown_signal(cancel: CancellationToken) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(NetworkError::Io)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(NetworkError::Io)?;

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT detected."),
        _ = sigterm.recv() => info!("SIGTERM detected."),
        _ = cancel.cancelled() => return Ok(()),
    }

    info!("shutting down");
    cancel.cancel();
    Ok(())
}
