
use std::net::SocketAddr;

use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::Histogram;
use prometheus::HistogramOpts;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

use crate::Result;
use crate::SystemError;

lazy_static! {
    // -
    // Validation filter
    pub static ref VALIDATION_DROPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("validation_dropped_total", "Updates dropped by the validation filter"),
        &["reason"]
    )
    .expect("metric can not be created");

    pub static ref VALIDATION_CONVERTED_TOTAL: IntCounter = IntCounter::new(
        "validation_converted_total",
        "Updates with invalid values converted to deletions"
    )
    .expect("metric can not be created");

    // -
    // Snapshot cache
    pub static ref CACHE_REVISION: IntGauge =
        IntGauge::new("cache_revision", "Revision of the last applied update")
            .expect("metric can not be created");

    pub static ref CACHE_ENTRIES: IntGauge =
        IntGauge::new("cache_entries", "Number of keys in the state table")
            .expect("metric can not be created");

    pub static ref CACHE_UPDATES_APPLIED_TOTAL: IntCounter =
        IntCounter::new("cache_updates_applied_total", "Updates applied to the state table")
            .expect("metric can not be created");

    pub static ref CACHE_UPDATES_SKIPPED_TOTAL: IntCounter = IntCounter::new(
        "cache_updates_skipped_total",
        "Malformed or out-of-order updates skipped by the cache"
    )
    .expect("metric can not be created");

    pub static ref CACHE_SUBSCRIBERS: IntGauge =
        IntGauge::new("cache_subscribers", "Consumers attached to the cache")
            .expect("metric can not be created");

    pub static ref CACHE_SNAPSHOTS_BUILT_TOTAL: IntCounter =
        IntCounter::new("cache_snapshots_built_total", "Snapshots materialized")
            .expect("metric can not be created");

    pub static ref CACHE_REPLAY_RECORDS: IntGauge =
        IntGauge::new("cache_replay_records", "Updates held in the replay buffer")
            .expect("metric can not be created");

    pub static ref CACHE_CATCH_UP_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cache_catch_up_total", "Catch-up requests by outcome"),
        &["kind"]
    )
    .expect("metric can not be created");

    // -
    // Connection server
    pub static ref CONNECTIONS_ACTIVE: IntGauge =
        IntGauge::new("connections_active", "Open downstream connections")
            .expect("metric can not be created");

    pub static ref CONNECTIONS_ACCEPTED_TOTAL: IntCounter =
        IntCounter::new("connections_accepted_total", "Downstream connections accepted")
            .expect("metric can not be created");

    pub static ref CONNECTIONS_REJECTED_TOTAL: IntCounter = IntCounter::new(
        "connections_rejected_total",
        "Connections refused because the limit was reached"
    )
    .expect("metric can not be created");

    pub static ref CONNECTIONS_DROPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("connections_dropped_total", "Connections terminated by fault"),
        &["reason"]
    )
    .expect("metric can not be created");

    pub static ref CONNECTIONS_SHED_TOTAL: IntCounter = IntCounter::new(
        "connections_shed_total",
        "Healthy connections dropped to rebalance load"
    )
    .expect("metric can not be created");

    pub static ref MAX_CONNECTIONS: IntGauge =
        IntGauge::new("max_connections", "Current connection limit")
            .expect("metric can not be created");

    pub static ref MESSAGES_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("messages_sent_total", "Protocol messages sent downstream"),
        &["kind"]
    )
    .expect("metric can not be created");

    pub static ref SNAPSHOTS_SENT_TOTAL: IntCounter =
        IntCounter::new("snapshots_sent_total", "Complete snapshots streamed to clients")
            .expect("metric can not be created");

    pub static ref UPDATES_SENT_TOTAL: IntCounter =
        IntCounter::new("updates_sent_total", "Update records sent in delta messages")
            .expect("metric can not be created");

    pub static ref BYTES_SENT_TOTAL: IntCounter =
        IntCounter::new("bytes_sent_total", "Encoded bytes written downstream")
            .expect("metric can not be created");

    pub static ref SNAPSHOT_SEND_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("snapshot_send_seconds", "Time spent streaming a snapshot")
            .buckets(exponential_buckets(0.001, 4.0, 10).expect("valid buckets"))
    )
    .expect("metric can not be created");

    pub static ref BATCH_SIZE_RECORDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("batch_size_records", "Records per flushed delta batch")
            .buckets(exponential_buckets(1.0, 2.0, 12).expect("valid buckets"))
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

/// Registers every proxy collector. Collectors already present are skipped.
pub fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(VALIDATION_DROPPED_TOTAL.clone()),
        Box::new(VALIDATION_CONVERTED_TOTAL.clone()),
        Box::new(CACHE_REVISION.clone()),
        Box::new(CACHE_ENTRIES.clone()),
        Box::new(CACHE_UPDATES_APPLIED_TOTAL.clone()),
        Box::new(CACHE_UPDATES_SKIPPED_TOTAL.clone()),
        Box::new(CACHE_SUBSCRIBERS.clone()),
        Box::new(CACHE_SNAPSHOTS_BUILT_TOTAL.clone()),
        Box::new(CACHE_REPLAY_RECORDS.clone()),
        Box::new(CACHE_CATCH_UP_TOTAL.clone()),
        Box::new(CONNECTIONS_ACTIVE.clone()),
        Box::new(CONNECTIONS_ACCEPTED_TOTAL.clone()),
        Box::new(CONNECTIONS_REJECTED_TOTAL.clone()),
        Box::new(CONNECTIONS_DROPPED_TOTAL.clone()),
        Box::new(CONNECTIONS_SHED_TOTAL.clone()),
        Box::new(MAX_CONNECTIONS.clone()),
        Box::new(MESSAGES_SENT_TOTAL.clone()),
        Box::new(SNAPSHOTS_SENT_TOTAL.clone()),
        Box::new(UPDATES_SENT_TOTAL.clone()),
        Box::new(BYTES_SENT_TOTAL.clone()),
        Box::new(SNAPSHOT_SEND_SECONDS.clone()),
        Box::new(BATCH_SIZE_RECORDS.clone()),
    ];

    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            debug!("skip metric registration: {}", e);
        }
    }
}

/// Serves `/metrics` until `cancel` fires. Returns the bound address.
pub fn start_metrics_server(
    port: u16,
    cancel: CancellationToken,
) -> Result<SocketAddr> {
    register_custom_metrics(&REGISTRY);

    let metrics_route = warp::path!("metrics").and(warp::get()).and_then(metrics_handler);

    let (addr, server) = warp::serve(metrics_route)
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            cancel.cancelled().await;
        })
        .map_err(|e| SystemError::ServerStartFailed(format!("metrics endpoint: {e}")))?;

    info!("prometheus metrics served on {}", addr);
    tokio::spawn(server);
    Ok(addr)
}

/// Text exposition of every registered collector
pub fn gather_metrics_text() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
    };
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            error!("custom metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}

async fn metrics_handler() -> std::result::Result<impl Reply, Rejection> {
    Ok(gather_metrics_text())
}
