use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fanout_sync::BackendClient;
use fanout_sync::BackoffPolicy;
use fanout_sync::ClientExit;
use fanout_sync::PipelineEvent;
use fanout_sync::ProxyConfig;
use fanout_sync::ProxyDaemon;
use fanout_sync::Result;
use fanout_sync::RunningProxy;
use fanout_sync::SyncClient;
use fanout_sync::SyncStatus;
use fanout_sync::Syncer;
use fanout_sync::SyncerCallbacks;
use fanout_sync::Update;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const WAIT_IN_SEC: u64 = 10;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    env_logger::init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for integration test.");
}

/// Loopback proxy config with short timers
pub fn proxy_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.server.listen_address = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.min_batching_age_in_ms = 20;
    config.server.ping_interval_in_ms = 100;
    config.server.pong_timeout_in_ms = 1_000;
    config.server.max_fall_behind_in_ms = 1_500;
    config.server.handshake_timeout_in_ms = 1_000;
    config.server.drop_interval_in_ms = 100;
    config.cache.wake_up_interval_in_ms = 100;
    config.retry = BackoffPolicy {
        max_retries: 3,
        timeout_ms: 1_000,
        base_delay_ms: 10,
        max_delay_ms: 50,
    };
    config
}

pub fn put(
    key: &str,
    value: &str,
    revision: u64,
) -> Update {
    Update::put(key, value.to_string(), revision)
}

/// Upstream whose callbacks the test drives by hand
#[derive(Default)]
pub struct ManualBackend {
    callbacks: Mutex<Option<Arc<dyn SyncerCallbacks>>>,
}

struct IdleSyncer;

impl Syncer for IdleSyncer {
    fn start(
        &mut self,
        _cancel: CancellationToken,
    ) {
    }
}

impl ManualBackend {
    pub async fn status(
        &self,
        status: SyncStatus,
    ) {
        self.upstream().on_status_updated(status).await.unwrap();
    }

    pub async fn updates(
        &self,
        updates: Vec<Update>,
    ) {
        self.upstream().on_updates(updates).await.unwrap();
    }

    fn upstream(&self) -> Arc<dyn SyncerCallbacks> {
        self.callbacks.lock().clone().expect("proxy not started")
    }
}

#[async_trait]
impl BackendClient for ManualBackend {
    fn syncer(
        &self,
        callbacks: Arc<dyn SyncerCallbacks>,
    ) -> Box<dyn Syncer> {
        *self.callbacks.lock() = Some(callbacks);
        Box::new(IdleSyncer)
    }

    async fn ensure_initialized(&self) -> Result<()> {
        Ok(())
    }
}

pub async fn start_proxy(config: ProxyConfig) -> (RunningProxy, Arc<ManualBackend>) {
    enable_logger();
    let backend = Arc::new(ManualBackend::default());
    let proxy = ProxyDaemon::new(config, backend.clone())
        .start(CancellationToken::new())
        .await
        .unwrap();
    (proxy, backend)
}

/// Client sink that records everything it is told
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<PipelineEvent>>,
    notify: Notify,
}

impl Recorder {
    pub fn update_batches(&self) -> Vec<Vec<Update>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Updates(u) => Some(u.clone()),
                PipelineEvent::Status(_) => None,
            })
            .collect()
    }

    pub fn updates(&self) -> Vec<Update> {
        self.update_batches().into_iter().flatten().collect()
    }

    /// Waits until the recorded updates satisfy `done`
    pub async fn wait_until(
        &self,
        done: impl Fn(&[Update]) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(WAIT_IN_SEC), async {
            loop {
                let notified = self.notify.notified();
                if done(&self.updates()) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("updates did not arrive in time");
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
impl SyncerCallbacks for Recorder {
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

/// A [`SyncClient`] session running in the background
pub struct ClientSession {
    pub recorder: Arc<Recorder>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<(SyncClient, Result<ClientExit>)>,
}

impl ClientSession {
    pub fn spawn(
        mut client: SyncClient,
        recorder: Arc<Recorder>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let exit = client.run(token).await;
            (client, exit)
        });
        Self {
            recorder,
            cancel,
            handle,
        }
    }

    pub async fn finish(self) -> (SyncClient, ClientExit) {
        let (client, exit) = tokio::time::timeout(Duration::from_secs(WAIT_IN_SEC), self.handle)
            .await
            .expect("client session did not end")
            .unwrap();
        (client, exit.unwrap())
    }

    pub async fn stop(self) -> (SyncClient, ClientExit) {
        self.cancel.cancel();
        self.finish().await
    }
}

pub fn client_for(
    proxy: &RunningProxy,
    recorder: Arc<Recorder>,
) -> SyncClient {
    SyncClient::builder(proxy.local_addr.to_string()).build(recorder)
}

/// Polls `check` until it holds
pub async fn eventually<F, Fut>(
    what: &str,
    check: F,
) where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(WAIT_IN_SEC), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

pub async fn wait_for_subscribers(
    proxy: &RunningProxy,
    count: usize,
) {
    eventually("cache subscribers", move || async move {
        proxy.cache.stats().await.map(|s| s.subscribers >= count).unwrap_or(false)
    })
    .await;
}

pub async fn wait_for_revision(
    proxy: &RunningProxy,
    revision: u64,
) {
    eventually("cache revision", move || async move {
        proxy.cache.stats().await.map(|s| s.revision >= revision).unwrap_or(false)
    })
    .await;
}

pub async fn stop_proxy(proxy: RunningProxy) {
    proxy.shutdown();
    tokio::time::timeout(Duration::from_secs(WAIT_IN_SEC), proxy.join())
        .await
        .expect("proxy did not stop");
}
