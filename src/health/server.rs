use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::http::StatusCode;
use warp::Filter;

use super::HealthAggregator;
use crate::Result;
use crate::SystemError;

/// Serves `/liveness` and `/readiness` until `cancel` fires.
///
/// Both answer 200 when healthy and 503 otherwise, with the JSON summary as body.
pub fn start_health_server(
    port: u16,
    aggregator: Arc<HealthAggregator>,
    cancel: CancellationToken,
) -> Result<SocketAddr> {
    let live_agg = aggregator.clone();
    let liveness = warp::path!("liveness").and(warp::get()).map(move || {
        let summary = live_agg.summary();
        let status = if summary.live {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        warp::reply::with_status(warp::reply::json(&summary), status)
    });

    let readiness = warp::path!("readiness").and(warp::get()).map(move || {
        let summary = aggregator.summary();
        let status = if summary.ready {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        warp::reply::with_status(warp::reply::json(&summary), status)
    });

    let (addr, server) = warp::serve(liveness.or(readiness))
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            cancel.cancelled().await;
        })
        .map_err(|e| SystemError::ServerStartFailed(format!("health endpoint: {e}")))?;

    info!("health endpoints served on {}", addr);
    tokio::spawn(server);
    Ok(addr)
}
