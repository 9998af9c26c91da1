//! Liveness and readiness aggregation.
//!
//! Long-running loops register once at startup and then report on every wake-up. A
//! reporter that stops reporting for longer than its timeout counts as unhealthy.
mod server;
pub use server::*;


use std::collections::BTreeMap;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

/// One component's view of its own health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HealthReport {
    pub live: bool,
    pub ready: bool,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            live: true,
            ready: true,
        }
    }
}

/// Sink the long-running loops report into
#[cfg_attr(test, automock)]
pub trait HealthReporter: Send + Sync + 'static {
    /// Declares a reporter. `timeout` is the longest gap between reports before the
    /// reporter is treated as failed; readiness only counts when `ready_required`.
    fn register_reporter(
        &self,
        name: &str,
        timeout: Duration,
        ready_required: bool,
    );

    fn report(
        &self,
        name: &str,
        report: HealthReport,
    );
}

#[derive(Debug)]
struct ReporterState {
    timeout: Duration,
    ready_required: bool,
    latest: Option<(HealthReport, Instant)>,
}

impl ReporterState {
    fn effective(
        &self,
        now: Instant,
    ) -> HealthReport {
        match self.latest {
            Some((report, at)) if now.duration_since(at) <= self.timeout => report,
            _ => HealthReport::default(),
        }
    }
}

/// Per-reporter entry of a [`HealthSummary`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReporterSummary {
    pub live: bool,
    pub ready: bool,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub live: bool,
    pub ready: bool,
    pub reporters: BTreeMap<String, ReporterSummary>,
}

/// In-process [`HealthReporter`] that the HTTP endpoints read from
#[derive(Debug, Default)]
pub struct HealthAggregator {
    reporters: Mutex<BTreeMap<String, ReporterState>>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> HealthSummary {
        let now = Instant::now();
        let reporters = self.reporters.lock();

        let mut live = true;
        let mut ready = true;
        let mut entries = BTreeMap::new();
        for (name, state) in reporters.iter() {
            let effective = state.effective(now);
            live &= effective.live;
            if state.ready_required {
                ready &= effective.ready;
            }
            entries.insert(
                name.clone(),
                ReporterSummary {
                    live: effective.live,
                    ready: effective.ready,
                    stale: state.latest.map_or(true, |(_, at)| now.duration_since(at) > state.timeout),
                },
            );
        }

        HealthSummary {
            live,
            ready: ready && live,
            reporters: entries,
        }
    }

    pub fn is_live(&self) -> bool {
        self.summary().live
    }

    pub fn is_ready(&self) -> bool {
        self.summary().ready
    }
}

impl HealthReporter for HealthAggregator {
    fn register_reporter(
        &self,
        name: &str,
        timeout: Duration,
        ready_required: bool,
    ) {
        debug!(name, ?timeout, ready_required, "register health reporter");
        self.reporters.lock().insert(
            name.to_string(),
            ReporterState {
                timeout,
                ready_required,
                latest: None,
            },
        );
    }

    fn report(
        &self,
        name: &str,
        report: HealthReport,
    ) {
        let mut reporters = self.reporters.lock();
        match reporters.get_mut(name) {
            Some(state) => state.latest = Some((report, Instant::now())),
            None => warn!(name, "health report from unregistered reporter"),
        }
    }
}
