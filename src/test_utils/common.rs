use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::PipelineEvent;
use crate::ProxyConfig;
use crate::Result;
use crate::SyncStatus;
use crate::Syncer;
use crate::SyncerCallbacks;
use crate::Update;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    env_logger::init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}

/// Loopback config with short timers for driving the server in tests
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.server.listen_address = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.min_batching_age_in_ms = 20;
    config.server.ping_interval_in_ms = 200;
    config.server.pong_timeout_in_ms = 1_000;
    config.server.max_fall_behind_in_ms = 2_000;
    config.server.handshake_timeout_in_ms = 1_000;
    config.server.drop_interval_in_ms = 100;
    config.cache.wake_up_interval_in_ms = 100;
    config.cache.replay_buffer_capacity = 100;
    config.cache.max_catch_up_records = 50;
    config
}

pub fn put(
    key: &str,
    value: &str,
    revision: u64,
) -> Update {
    Update::put(key, value.to_string(), revision)
}

pub fn del(
    key: &str,
    revision: u64,
) -> Update {
    Update::delete(key, revision)
}

/// Sink that records every event it receives
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PipelineEvent>>,
    notify: Notify,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().clone()
    }

    pub fn updates(&self) -> Vec<Update> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Updates(u) => Some(u.clone()),
                PipelineEvent::Status(_) => None,
            })
            .flatten()
            .collect()
    }

    /// Waits until at least `n` events were recorded
    pub async fn wait_for_events(
        &self,
        n: usize,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.notify.notified();
                if self.events.lock().len() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("events did not arrive in time");
    }

    fn record(
        &self,
        event: PipelineEvent,
    ) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl SyncerCallbacks for RecordingSink {
    async fn on_status_updated(
        &self,
        status: SyncStatus,
    ) -> Result<()> {
        self.record(PipelineEvent::Status(status));
        Ok(())
    }

    async fn on_updates(
        &self,
        updates: Vec<Update>,
    ) -> Result<()> {
        self.record(PipelineEvent::Updates(updates));
        Ok(())
    }
}

/// Upstream stand-in that plays a fixed list of events once started
pub struct ScriptedSyncer {
    callbacks: Arc<dyn SyncerCallbacks>,
    script: Vec<PipelineEvent>,
}

impl ScriptedSyncer {
    pub fn new(
        callbacks: Arc<dyn SyncerCallbacks>,
        script: Vec<PipelineEvent>,
    ) -> Self {
        Self { callbacks, script }
    }
}

impl Syncer for ScriptedSyncer {
    fn start(
        &mut self,
        cancel: CancellationToken,
    ) {
        let callbacks = self.callbacks.clone();
        let script = std::mem::take(&mut self.script);
        tokio::spawn(async move {
            for event in script {
                if cancel.is_cancelled() {
                    break;
                }
                let delivered = match event {
                    PipelineEvent::Status(status) => callbacks.on_status_updated(status).await,
                    PipelineEvent::Updates(updates) => callbacks.on_updates(updates).await,
                };
                if delivered.is_err() {
                    break;
                }
            }
        });
    }
}
