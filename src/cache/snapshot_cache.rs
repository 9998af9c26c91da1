use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::CacheEvent;
use super::CacheStats;
use super::DeltaBatch;
use super::ReplayBuffer;
use super::Snapshot;
use super::Subscription;
use super::SubscriptionStart;
use crate::constants::CACHE_HEALTH_NAME;
use crate::constants::CACHE_REQUEST_QUEUE;
use crate::CacheConfig;
use crate::HealthReport;
use crate::HealthReporter;
use crate::PipelineError;
use crate::PipelineEvent;
use crate::Result;
use crate::Revision;
use crate::SyncStatus;
use crate::SyncerCallbacks;
use crate::Update;
use crate::CACHE_CATCH_UP_TOTAL;
use crate::CACHE_ENTRIES;
use crate::CACHE_REPLAY_RECORDS;
use crate::CACHE_REVISION;
use crate::CACHE_SNAPSHOTS_BUILT_TOTAL;
use crate::CACHE_SUBSCRIBERS;
use crate::CACHE_UPDATES_APPLIED_TOTAL;
use crate::CACHE_UPDATES_SKIPPED_TOTAL;

pub(crate) enum CacheRequest {
    Attach {
        queue_capacity: usize,
        reply: oneshot::Sender<Subscription>,
    },
    CatchUp {
        from: Revision,
        queue_capacity: usize,
        reply: oneshot::Sender<Subscription>,
    },
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
}

/// Handle to the snapshot cache.
///
/// Upstream stages feed it through [`SyncerCallbacks`]; connections register through
/// [`Cache::attach`] and [`Cache::catch_up`]. All state lives in the [`CacheProcessor`]
/// task, so every request is serialized with update application.
#[derive(Clone, Debug)]
pub struct Cache {
    input: mpsc::Sender<PipelineEvent>,
    requests: mpsc::Sender<CacheRequest>,
}

impl std::fmt::Debug for CacheRequest {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            CacheRequest::Attach { .. } => write!(f, "Attach"),
            CacheRequest::CatchUp { from, .. } => write!(f, "CatchUp({from})"),
            CacheRequest::Stats { .. } => write!(f, "Stats"),
        }
    }
}

impl Cache {
    pub fn new(
        config: CacheConfig,
        health: Arc<dyn HealthReporter>,
    ) -> (Cache, CacheProcessor) {
        let (input_tx, input_rx) = mpsc::channel(config.input_queue_capacity.max(1));
        let (request_tx, request_rx) = mpsc::channel(CACHE_REQUEST_QUEUE);

        let processor = CacheProcessor {
            replay: ReplayBuffer::new(config.replay_buffer_capacity),
            config,
            input_rx,
            request_rx,
            health,
            table: BTreeMap::new(),
            revision: 0,
            status: SyncStatus::default(),
            subscribers: HashMap::new(),
            next_subscriber_id: 1,
            last_snapshot: None,
        };

        (
            Cache {
                input: input_tx,
                requests: request_tx,
            },
            processor,
        )
    }

    /// Registers a consumer starting from a full snapshot of the current state
    pub async fn attach(
        &self,
        queue_capacity: usize,
    ) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.request(CacheRequest::Attach { queue_capacity, reply }).await?;
        rx.await.map_err(|_| PipelineError::CacheStopped.into())
    }

    /// Registers a consumer that already holds everything up to `from`.
    ///
    /// Starts with only the missing updates when the replay buffer still has them and
    /// there are no more than `max_catch_up_records` of them, otherwise with a snapshot.
    pub async fn catch_up(
        &self,
        from: Revision,
        queue_capacity: usize,
    ) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.request(CacheRequest::CatchUp {
            from,
            queue_capacity,
            reply,
        })
        .await?;
        rx.await.map_err(|_| PipelineError::CacheStopped.into())
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let (reply, rx) = oneshot::channel();
        self.request(CacheRequest::Stats { reply }).await?;
        rx.await.map_err(|_| PipelineError::CacheStopped.into())
    }

    async fn request(
        &self,
        request: CacheRequest,
    ) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| PipelineError::CacheStopped.into())
    }
}

#[async_trait]
impl SyncerCallbacks for Cache {
    async fn on_status_updated(
        &self,
        status: SyncStatus,
    ) -> Result<()> {
        self.input
            .send(PipelineEvent::Status(status))
            .await
            .map_err(|_| PipelineError::CacheStopped.into())
    }

    async fn on_updates(
        &self,
        updates: Vec<Update>,
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        self.input
            .send(PipelineEvent::Updates(updates))
            .await
            .map_err(|_| PipelineError::CacheStopped.into())
    }
}

/// Owner of the state table, replay buffer and subscriber list
pub struct CacheProcessor {
    config: CacheConfig,
    input_rx: mpsc::Receiver<PipelineEvent>,
    request_rx: mpsc::Receiver<CacheRequest>,
    health: Arc<dyn HealthReporter>,

    table: BTreeMap<String, Bytes>,
    revision: Revision,
    status: SyncStatus,
    replay: ReplayBuffer,

    subscribers: HashMap<u64, mpsc::Sender<CacheEvent>>,
    next_subscriber_id: u64,
    /// Reused until the next change
    last_snapshot: Option<Arc<Snapshot>>,
}

impl CacheProcessor {
    /// Processing loop. Runs until `cancel` fires.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
    ) -> Result<()> {
        let wake_up_interval = self.config.wake_up_interval();
        self.health
            .register_reporter(CACHE_HEALTH_NAME, wake_up_interval * 10, true);
        self.report_health();

        let mut wake_up = tokio::time::interval(wake_up_interval);
        wake_up.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut input_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("snapshot cache stopping at revision {}", self.revision);
                    break;
                }
                Some(request) = self.request_rx.recv() => {
                    self.handle_request(request);
                }
                event = self.input_rx.recv(), if input_open => {
                    match event {
                        Some(event) => self.handle_input(event),
                        None => {
                            warn!("snapshot cache input closed, serving existing state only");
                            input_open = false;
                        }
                    }
                }
                _ = wake_up.tick() => {
                    self.on_wake_up();
                }
            }
        }

        self.subscribers.clear();
        CACHE_SUBSCRIBERS.set(0);
        Ok(())
    }

    fn handle_request(
        &mut self,
        request: CacheRequest,
    ) {
        trace!(?request, "cache request");
        self.drain_input();
        match request {
            CacheRequest::Attach { queue_capacity, reply } => {
                let subscription = self.attach(queue_capacity);
                if reply.send(subscription).is_err() {
                    debug!("attach requester went away");
                }
            }
            CacheRequest::CatchUp {
                from,
                queue_capacity,
                reply,
            } => {
                let subscription = self.catch_up(from, queue_capacity);
                if reply.send(subscription).is_err() {
                    debug!("catch-up requester went away");
                }
            }
            CacheRequest::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Applies input queued ahead of a request, so a requester sees every update its
    /// producer handed over before asking.
    fn drain_input(&mut self) {
        for _ in 0..self.config.input_queue_capacity {
            match self.input_rx.try_recv() {
                Ok(event) => self.handle_input(event),
                Err(_) => break,
            }
        }
    }

    /// Applies `first` and whatever is already queued behind it, notifying subscribers
    /// once per `max_batch_size` updates.
    pub(crate) fn handle_input(
        &mut self,
        first: PipelineEvent,
    ) {
        let max_batch_size = self.config.max_batch_size;
        let mut pending: Vec<Update> = Vec::new();
        let mut next = Some(first);
        let mut drained = 0;

        while let Some(event) = next.take() {
            match event {
                PipelineEvent::Status(status) => {
                    self.apply_in_batches(std::mem::take(&mut pending));
                    self.set_status(status);
                }
                PipelineEvent::Updates(updates) => pending.extend(updates),
            }
            drained += 1;
            if pending.len() < max_batch_size && drained < max_batch_size {
                next = self.input_rx.try_recv().ok();
            }
        }

        self.apply_in_batches(pending);
    }

    fn apply_in_batches(
        &mut self,
        updates: Vec<Update>,
    ) {
        let max_batch_size = self.config.max_batch_size;
        let mut iter = updates.into_iter().peekable();
        while iter.peek().is_some() {
            let chunk: Vec<Update> = iter.by_ref().take(max_batch_size).collect();
            self.apply_updates(chunk);
        }
    }

    /// Folds `updates` into the state table in order and fans the effective ones out
    /// as a single batch.
    ///
    /// Updates with an empty key, or a revision not above the current one, are
    /// skipped. Updates that leave the table unchanged are not forwarded.
    pub(crate) fn apply_updates(
        &mut self,
        updates: Vec<Update>,
    ) {
        let mut applied = Vec::with_capacity(updates.len());
        let applied_at = Instant::now();

        for update in updates {
            if update.key.is_empty() {
                warn!("skipping update with empty key at revision {}", update.revision);
                CACHE_UPDATES_SKIPPED_TOTAL.inc();
                continue;
            }
            if update.revision <= self.revision {
                warn!(
                    key = %update.key,
                    "skipping out-of-order update: revision {} not above {}",
                    update.revision, self.revision
                );
                CACHE_UPDATES_SKIPPED_TOTAL.inc();
                continue;
            }

            let changed = match &update.value {
                Some(value) => self.table.insert(update.key.clone(), value.clone()).as_ref() != Some(value),
                None => self.table.remove(&update.key).is_some(),
            };
            if !changed {
                trace!(key = %update.key, "no-op update");
                continue;
            }

            self.revision = update.revision;
            self.replay.push(update.clone(), applied_at);
            applied.push(update);
        }

        if applied.is_empty() {
            return;
        }

        CACHE_UPDATES_APPLIED_TOTAL.inc_by(applied.len() as u64);
        CACHE_REVISION.set(self.revision as i64);
        CACHE_ENTRIES.set(self.table.len() as i64);
        CACHE_REPLAY_RECORDS.set(self.replay.len() as i64);
        self.last_snapshot = None;

        let batch = Arc::new(DeltaBatch {
            updates: applied,
            revision: self.revision,
            applied_at,
        });
        self.broadcast(CacheEvent::Deltas(batch));
        self.report_health();
    }

    pub(crate) fn set_status(
        &mut self,
        status: SyncStatus,
    ) {
        if status == self.status {
            return;
        }
        info!("datastore sync status {:?} -> {:?}", self.status, status);
        self.status = status;
        self.last_snapshot = None;
        self.broadcast(CacheEvent::Status(status));
        self.report_health();
    }

    /// Sends `event` to every subscriber without waiting. A subscriber whose queue is
    /// full or closed is detached.
    fn broadcast(
        &mut self,
        event: CacheEvent,
    ) {
        self.subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = id, "subscriber queue full, detaching");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = id, "subscriber gone");
                false
            }
        });
        CACHE_SUBSCRIBERS.set(self.subscribers.len() as i64);
    }

    fn snapshot(&mut self) -> Arc<Snapshot> {
        if let Some(snapshot) = &self.last_snapshot {
            return snapshot.clone();
        }
        let snapshot = Arc::new(Snapshot {
            revision: self.revision,
            status: self.status,
            entries: self.table.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            taken_at: Instant::now(),
        });
        CACHE_SNAPSHOTS_BUILT_TOTAL.inc();
        self.last_snapshot = Some(snapshot.clone());
        snapshot
    }

    fn subscribe(
        &mut self,
        start: SubscriptionStart,
        queue_capacity: usize,
    ) -> Subscription {
        let (tx, events) = mpsc::channel(queue_capacity.max(1));
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        self.subscribers.insert(id, tx);
        CACHE_SUBSCRIBERS.set(self.subscribers.len() as i64);
        debug!(subscriber = id, revision = start.revision(), "subscriber attached");

        Subscription { id, start, events }
    }

    pub(crate) fn attach(
        &mut self,
        queue_capacity: usize,
    ) -> Subscription {
        let snapshot = self.snapshot();
        self.subscribe(SubscriptionStart::Snapshot(snapshot), queue_capacity)
    }

    pub(crate) fn catch_up(
        &mut self,
        from: Revision,
        queue_capacity: usize,
    ) -> Subscription {
        match self.replay.since(from, self.config.max_catch_up_records) {
            Some(updates) => {
                CACHE_CATCH_UP_TOTAL.with_label_values(&["replay"]).inc();
                debug!("catching up from {} with {} updates", from, updates.len());
                let start = SubscriptionStart::Replay {
                    from,
                    oldest_applied_at: self.replay.applied_after(from).unwrap_or_else(Instant::now),
                    updates,
                    revision: self.revision,
                    status: self.status,
                };
                self.subscribe(start, queue_capacity)
            }
            None => {
                CACHE_CATCH_UP_TOTAL.with_label_values(&["snapshot"]).inc();
                debug!(
                    "revision {} not recoverable from replay buffer (base {}, head {}), sending snapshot",
                    from,
                    self.replay.base_revision(),
                    self.revision
                );
                self.attach(queue_capacity)
            }
        }
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            revision: self.revision,
            status: self.status,
            entries: self.table.len(),
            subscribers: self.subscribers.len(),
            replay_len: self.replay.len(),
            replay_base: self.replay.base_revision(),
        }
    }

    fn on_wake_up(&mut self) {
        self.subscribers.retain(|_, tx| !tx.is_closed());
        CACHE_SUBSCRIBERS.set(self.subscribers.len() as i64);
        self.report_health();
    }

    fn report_health(&self) {
        self.health.report(
            CACHE_HEALTH_NAME,
            HealthReport {
                live: true,
                ready: self.status == SyncStatus::InSync,
            },
        );
    }
}
