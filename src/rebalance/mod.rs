//! Topology-driven connection targets.
//!
//! Every proxy instance in a pool polls the same view of the cluster and computes
//! its fair share of the clients, plus headroom. The connection governor then sheds
//! connections above that share so that clients reconnect to other instances.


use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::ConnectionLimiter;
use crate::RebalancingConfig;
use crate::Result;

/// Source of cluster size information
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterTopology: Send + Sync + 'static {
    /// Proxy instances currently serving clients, this one included
    async fn num_proxies(&self) -> Result<usize>;

    /// Clients expected to connect to the pool
    async fn num_clients(&self) -> Result<usize>;
}

/// `ceil(clients / proxies * (1 + headroom%))`, clamped to the configured limits.
///
/// With one proxy or fewer there is nothing to balance against, so the upper limit
/// applies.
pub fn calculate_max_conn_limit(
    config: &RebalancingConfig,
    num_proxies: usize,
    num_clients: usize,
) -> usize {
    let lower = config.max_conns_lower_limit;
    let upper = config.max_conns_upper_limit;
    if num_proxies <= 1 {
        return upper;
    }

    let numerator = num_clients as u128 * (100 + config.headroom_percent as u128);
    let denominator = num_proxies as u128 * 100;
    let target = numerator.div_ceil(denominator);
    usize::try_from(target).unwrap_or(usize::MAX).clamp(lower, upper)
}

/// Polls `topology` every `poll_interval` (with up to 10% jitter) and pushes the
/// computed target into `limiter` until `cancel` fires.
///
/// Lookup failures keep the previous target.
pub async fn poll_for_connection_limit(
    config: RebalancingConfig,
    topology: Arc<dyn ClusterTopology>,
    limiter: Arc<dyn ConnectionLimiter>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(
        "polling cluster topology every {:?} for connection target",
        config.poll_interval()
    );
    limiter.set_max_conns(config.max_conns_upper_limit);

    loop {
        match lookup(&*topology).await {
            Ok((proxies, clients)) => {
                let target = calculate_max_conn_limit(&config, proxies, clients);
                debug!(proxies, clients, target, "computed connection target");
                limiter.set_max_conns(target);
            }
            Err(e) => warn!("topology lookup failed, keeping current target: {}", e),
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(jittered(config.poll_interval())) => {}
        }
    }
    Ok(())
}

async fn lookup(topology: &dyn ClusterTopology) -> Result<(usize, usize)> {
    let proxies = topology.num_proxies().await?;
    let clients = topology.num_clients().await?;
    Ok((proxies, clients))
}

fn jittered(interval: Duration) -> Duration {
    let max_jitter = interval / 10;
    if max_jitter.is_zero() {
        return interval;
    }
    interval + rand::thread_rng().gen_range(Duration::ZERO..max_jitter)
}
