use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::FramedRead;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::split_into_messages;
use super::BatchBuffer;
use super::ClientHello;
use super::ClientMessage;
use super::CloseReason;
use super::ConnectionState;
use super::FrameCodec;
use super::ServerMessage;
use crate::constants::CLIENT_MESSAGE_QUEUE;
use crate::constants::DRAIN_TIMEOUT_MS;
use crate::constants::MAX_OUTBOUND_FRAME_BYTES;
use crate::constants::MIN_PROTOCOL_VERSION;
use crate::constants::PROTOCOL_VERSION;
use crate::constants::RECORD_OVERHEAD_BYTES;
use crate::constants::REJECT_WRITE_TIMEOUT_MS;
use crate::utils::time::now_millis;
use crate::Cache;
use crate::CacheEvent;
use crate::ConnectionError;
use crate::ProtocolError;
use crate::Revision;
use crate::ServerConfig;
use crate::Snapshot;
use crate::Subscription;
use crate::SubscriptionStart;
use crate::Update;
use crate::BATCH_SIZE_RECORDS;
use crate::BYTES_SENT_TOTAL;
use crate::CONNECTIONS_DROPPED_TOTAL;
use crate::MESSAGES_SENT_TOTAL;
use crate::SNAPSHOTS_SENT_TOTAL;
use crate::SNAPSHOT_SEND_SECONDS;
use crate::UPDATES_SENT_TOTAL;

type ServerCodec = FrameCodec<ClientMessage, ServerMessage>;

/// Everything a connection shares with the server that spawned it
#[derive(Clone)]
pub struct ConnectionContext {
    pub cache: Cache,
    pub config: Arc<ServerConfig>,
    pub server_id: Arc<str>,
}

/// Shared slot the server fills in before cancelling a connection
pub type CloseReasonSlot = Arc<Mutex<Option<CloseReason>>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub snapshots_sent: u64,
    pub updates_sent: u64,
    pub pings_sent: u64,
}

/// When the client last answered a ping. Written by the read half as pongs arrive.
type LastPong = Arc<Mutex<Instant>>;

/// Sent data the client has not acknowledged yet
#[derive(Debug)]
struct PendingAck {
    revision: Revision,
    /// When the oldest data in the message became available
    since: Instant,
}

/// Per-connection send loop.
///
/// The read half is drained by a helper task into `client_rx` so that pongs and acks
/// are seen while a write is in progress.
pub struct Connection<W> {
    id: u64,
    peer: String,
    ctx: ConnectionContext,
    writer: FramedWrite<W, ServerCodec>,
    client_rx: mpsc::Receiver<Result<ClientMessage, ProtocolError>>,
    reader_task: JoinHandle<()>,
    state_tx: watch::Sender<ConnectionState>,
    close_reason: CloseReasonSlot,
    cancel: CancellationToken,

    last_pong: LastPong,
    next_ping: Instant,
    pending_acks: VecDeque<PendingAck>,
    sent_revision: Revision,
    acked_revision: Revision,
    subscription_id: Option<u64>,
    stats: ConnectionStats,
}

impl<W> Connection<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new<R>(
        id: u64,
        peer: String,
        reader: R,
        writer: W,
        ctx: ConnectionContext,
        state_tx: watch::Sender<ConnectionState>,
        close_reason: CloseReasonSlot,
        cancel: CancellationToken,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let now = Instant::now();
        let last_pong: LastPong = Arc::new(Mutex::new(now));
        let (client_tx, client_rx) = mpsc::channel(CLIENT_MESSAGE_QUEUE);
        let reader = FramedRead::new(reader, ServerCodec::new(ctx.config.max_client_message_bytes));
        let reader_task = tokio::spawn(read_client_messages(id, reader, client_tx, last_pong.clone()));

        let ping_interval = ctx.config.ping_interval();
        Self {
            id,
            peer,
            writer: FramedWrite::new(writer, ServerCodec::new(MAX_OUTBOUND_FRAME_BYTES)),
            ctx,
            client_rx,
            reader_task,
            state_tx,
            close_reason,
            cancel,
            last_pong,
            next_ping: now + ping_interval,
            pending_acks: VecDeque::new(),
            sent_revision: 0,
            acked_revision: 0,
            subscription_id: None,
            stats: ConnectionStats::default(),
        }
    }

    /// Drives the connection to a terminal state and returns it.
    pub async fn run(mut self) -> ConnectionState {
        let result = self.serve().await;
        self.reader_task.abort();

        let final_state = match result {
            Ok(()) => {
                info!(
                    conn = self.id,
                    peer = %self.peer,
                    "connection closed after {} messages ({} bytes), acked revision {}",
                    self.stats.messages_sent,
                    self.writer.encoder().bytes_encoded(),
                    self.acked_revision
                );
                ConnectionState::Closed
            }
            Err(e) => {
                warn!(conn = self.id, peer = %self.peer, "connection failed: {}", e);
                CONNECTIONS_DROPPED_TOTAL.with_label_values(&[e.reason()]).inc();
                if let Some(reason) = close_reason_for(&e) {
                    self.try_send_close(reason).await;
                }
                ConnectionState::Failed
            }
        };
        self.set_state(final_state);
        final_state
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        let Some(hello) = self.handshake().await? else {
            return self.drain(None).await;
        };

        let queue_capacity = self.ctx.config.subscriber_queue_capacity;
        let subscription = match hello.resume_from {
            Some(from) => self.ctx.cache.catch_up(from, queue_capacity).await,
            None => self.ctx.cache.attach(queue_capacity).await,
        }
        .map_err(|_| ConnectionError::CacheUnavailable)?;

        let events = self.send_start(subscription).await?;
        if self.cancel.is_cancelled() {
            return self.drain(None).await;
        }
        self.set_state(ConnectionState::Streaming);
        self.stream(events).await
    }

    /// Waits for the client hello. `None` means the server shut down first.
    async fn handshake(&mut self) -> Result<Option<ClientHello>, ConnectionError> {
        let timeout = self.ctx.config.handshake_timeout();

        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            received = tokio::time::timeout(timeout, self.client_rx.recv()) => received,
        };

        let message = match received {
            Err(_) => return Err(ConnectionError::HandshakeTimeout(timeout)),
            Ok(None) => return Err(ConnectionError::ClientDisconnected),
            Ok(Some(result)) => result?,
        };

        let hello = match message {
            ClientMessage::Hello(hello) => hello,
            other => {
                return Err(ConnectionError::ProtocolViolation(format!(
                    "expected hello, got {other:?}"
                )))
            }
        };

        if hello.version < MIN_PROTOCOL_VERSION || hello.version > PROTOCOL_VERSION {
            return Err(ConnectionError::VersionMismatch {
                client: hello.version,
                min: MIN_PROTOCOL_VERSION,
                max: PROTOCOL_VERSION,
            });
        }

        info!(
            conn = self.id,
            peer = %self.peer,
            hostname = %hello.hostname,
            info = %hello.info,
            version = hello.version,
            resume_from = ?hello.resume_from,
            "client hello"
        );

        self.send(ServerMessage::Hello {
            version: hello.version,
            server_id: self.ctx.server_id.to_string(),
        })
        .await?;
        Ok(Some(hello))
    }

    /// Delivers a subscription's starting point and hands back its live feed
    async fn send_start(
        &mut self,
        subscription: Subscription,
    ) -> Result<mpsc::Receiver<CacheEvent>, ConnectionError> {
        let Subscription { id, start, events } = subscription;
        self.subscription_id = Some(id);

        match start {
            SubscriptionStart::Snapshot(snapshot) => {
                self.set_state(ConnectionState::SnapshotSending);
                self.send_snapshot(&snapshot).await?;
            }
            SubscriptionStart::Replay {
                from,
                updates,
                oldest_applied_at,
                revision,
                status,
            } => {
                debug!(conn = self.id, "resuming from {} with {} updates", from, updates.len());
                self.send(ServerMessage::SyncStatus { status }).await?;
                self.send_updates(updates, oldest_applied_at).await?;
                self.sent_revision = self.sent_revision.max(revision);
            }
        }
        Ok(events)
    }

    async fn send_snapshot(
        &mut self,
        snapshot: &Snapshot,
    ) -> Result<(), ConnectionError> {
        let started = Instant::now();
        debug!(
            conn = self.id,
            "sending snapshot at revision {} with {} entries",
            snapshot.revision,
            snapshot.len()
        );

        self.send(ServerMessage::SnapshotBegin {
            revision: snapshot.revision,
            status: snapshot.status,
            total_entries: snapshot.len() as u64,
        })
        .await?;

        let chunks = split_into_messages(
            snapshot.entries.iter().collect(),
            self.ctx.config.max_message_size,
            self.ctx.config.max_message_bytes,
            |entry: &&(String, Bytes)| entry.0.len() + entry.1.len() + RECORD_OVERHEAD_BYTES,
        );
        for chunk in chunks {
            if self.cancel.is_cancelled() {
                debug!(conn = self.id, "snapshot interrupted by shutdown");
                return Ok(());
            }
            let entries = chunk.into_iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            self.send(ServerMessage::SnapshotChunk { entries }).await?;
            self.service_between_writes().await?;
        }

        self.send_tracked(ServerMessage::SnapshotEnd {
            revision: snapshot.revision,
        }, started)
        .await?;

        self.sent_revision = self.sent_revision.max(snapshot.revision);
        self.stats.snapshots_sent += 1;
        SNAPSHOTS_SENT_TOTAL.inc();
        SNAPSHOT_SEND_SECONDS.observe(started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn stream(
        &mut self,
        mut events: mpsc::Receiver<CacheEvent>,
    ) -> Result<(), ConnectionError> {
        let mut batch = BatchBuffer::new(
            self.ctx.config.max_message_size,
            self.ctx.config.min_batching_age(),
        );
        let mut health_tick = tokio::time::interval(self.ctx.config.health_check_interval());
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let batch_deadline = batch.deadline();

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return self.drain(Some((&mut batch, &mut events))).await;
                }
                message = self.client_rx.recv() => {
                    if let ControlFlow::Break(()) = self.handle_client_message(message)? {
                        info!(conn = self.id, "client said goodbye");
                        self.flush(&mut batch).await?;
                        return Ok(());
                    }
                }
                _ = health_tick.tick() => {
                    self.check_health(Instant::now())?;
                }
                _ = tokio::time::sleep_until(self.next_ping) => {
                    self.send_ping().await?;
                }
                _ = tokio::time::sleep_until(batch_deadline.unwrap_or_else(Instant::now)), if batch_deadline.is_some() => {
                    self.flush(&mut batch).await?;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            self.on_cache_event(event, &mut batch).await?;
                            while !batch.is_full() {
                                let Ok(event) = events.try_recv() else { break };
                                self.on_cache_event(event, &mut batch).await?;
                            }
                            if batch.is_full() {
                                self.flush(&mut batch).await?;
                            }
                        }
                        None => {
                            self.flush(&mut batch).await?;
                            events = self.resubscribe().await?;
                            if self.cancel.is_cancelled() {
                                return self.drain(None).await;
                            }
                            self.set_state(ConnectionState::Streaming);
                        }
                    }
                }
            }
        }
    }

    async fn on_cache_event(
        &mut self,
        event: CacheEvent,
        batch: &mut BatchBuffer,
    ) -> Result<(), ConnectionError> {
        match event {
            CacheEvent::Deltas(deltas) => {
                batch.push(&deltas);
            }
            CacheEvent::Status(status) => {
                self.flush(batch).await?;
                self.send(ServerMessage::SyncStatus { status }).await?;
            }
        }
        Ok(())
    }

    /// The cache detached this connection because its queue overflowed. Pick up again
    /// from the last revision sent.
    async fn resubscribe(&mut self) -> Result<mpsc::Receiver<CacheEvent>, ConnectionError> {
        info!(
            conn = self.id,
            subscription = ?self.subscription_id,
            "detached by cache, catching up from revision {}",
            self.sent_revision
        );
        let subscription = self
            .ctx
            .cache
            .catch_up(self.sent_revision, self.ctx.config.subscriber_queue_capacity)
            .await
            .map_err(|_| ConnectionError::CacheUnavailable)?;
        self.send_start(subscription).await
    }

    async fn flush(
        &mut self,
        batch: &mut BatchBuffer,
    ) -> Result<(), ConnectionError> {
        let Some(pending) = batch.take() else {
            return Ok(());
        };
        BATCH_SIZE_RECORDS.observe(pending.updates.len() as f64);
        self.send_updates(pending.updates, pending.oldest).await
    }

    async fn send_updates(
        &mut self,
        updates: Vec<Update>,
        since: Instant,
    ) -> Result<(), ConnectionError> {
        let messages = split_into_messages(
            updates,
            self.ctx.config.max_message_size,
            self.ctx.config.max_message_bytes,
            Update::encoded_len,
        );
        for updates in messages {
            let Some(revision) = updates.last().map(|u| u.revision) else {
                continue;
            };
            self.stats.updates_sent += updates.len() as u64;
            UPDATES_SENT_TOTAL.inc_by(updates.len() as u64);
            self.send_tracked(ServerMessage::Deltas { updates, revision }, since).await?;
            self.sent_revision = self.sent_revision.max(revision);
        }
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<(), ConnectionError> {
        self.send(ServerMessage::Ping {
            timestamp_ms: now_millis(),
        })
        .await?;
        self.stats.pings_sent += 1;
        self.next_ping = Instant::now() + self.ctx.config.ping_interval();
        Ok(())
    }

    /// Handles client traffic that arrived while a long write sequence was running
    async fn service_between_writes(&mut self) -> Result<(), ConnectionError> {
        while let Ok(message) = self.client_rx.try_recv() {
            if let ControlFlow::Break(()) = self.handle_client_message(Some(message))? {
                return Err(ConnectionError::ClientDisconnected);
            }
        }
        let now = Instant::now();
        if now >= self.next_ping {
            self.send_ping().await?;
        }
        self.check_health(now)
    }

    fn handle_client_message(
        &mut self,
        message: Option<Result<ClientMessage, ProtocolError>>,
    ) -> Result<ControlFlow<()>, ConnectionError> {
        let message = match message {
            None => return Err(ConnectionError::ClientDisconnected),
            Some(result) => result?,
        };
        trace!(conn = self.id, ?message, "client message");

        match message {
            ClientMessage::Pong { ping_timestamp_ms } => {
                trace!(
                    conn = self.id,
                    "pong, round trip {}ms",
                    now_millis().saturating_sub(ping_timestamp_ms)
                );
            }
            ClientMessage::Ack { revision } => {
                if revision > self.sent_revision {
                    return Err(ConnectionError::AckBeyondSent {
                        acked: revision,
                        sent: self.sent_revision,
                    });
                }
                self.acked_revision = self.acked_revision.max(revision);
                while self.pending_acks.front().is_some_and(|p| p.revision <= revision) {
                    self.pending_acks.pop_front();
                }
            }
            ClientMessage::Goodbye => return Ok(ControlFlow::Break(())),
            ClientMessage::Hello(_) => {
                return Err(ConnectionError::ProtocolViolation("repeated hello".into()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// How long the oldest unacknowledged data has been waiting
    fn lag(
        &self,
        now: Instant,
    ) -> Duration {
        self.pending_acks
            .front()
            .map_or(Duration::ZERO, |p| now.saturating_duration_since(p.since))
    }

    fn check_health(
        &self,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        let since_pong = now.saturating_duration_since(*self.last_pong.lock());
        if since_pong > self.ctx.config.pong_timeout() {
            return Err(ConnectionError::PongTimeout(since_pong));
        }

        let lag = self.lag(now);
        let max = self.ctx.config.max_fall_behind();
        if lag > max {
            return Err(ConnectionError::FellBehind { lag, max });
        }
        Ok(())
    }

    /// Graceful shutdown: flush what is queued, tell the client why, close.
    async fn drain(
        &mut self,
        pending: Option<(&mut BatchBuffer, &mut mpsc::Receiver<CacheEvent>)>,
    ) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Draining);
        let reason = (*self.close_reason.lock()).unwrap_or(CloseReason::ServerShutdown);
        debug!(conn = self.id, ?reason, "draining connection");

        let drained = tokio::time::timeout(Duration::from_millis(DRAIN_TIMEOUT_MS), async {
            if let Some((batch, events)) = pending {
                while let Ok(event) = events.try_recv() {
                    self.on_cache_event(event, batch).await?;
                }
                self.flush(batch).await?;
            }
            self.send(ServerMessage::Close { reason }).await?;
            self.writer.close().await?;
            Ok::<(), ConnectionError>(())
        })
        .await;

        match drained {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(conn = self.id, "client gone while draining: {}", e),
            Err(_) => debug!(conn = self.id, "drain timed out"),
        }
        Ok(())
    }

    /// Best-effort close notice on a failing connection
    async fn try_send_close(
        &mut self,
        reason: CloseReason,
    ) {
        let notice = tokio::time::timeout(
            Duration::from_millis(REJECT_WRITE_TIMEOUT_MS),
            self.writer.send(ServerMessage::Close { reason }),
        )
        .await;
        if !matches!(notice, Ok(Ok(()))) {
            trace!(conn = self.id, "close notice not delivered");
        }
    }

    async fn send_tracked(
        &mut self,
        message: ServerMessage,
        since: Instant,
    ) -> Result<(), ConnectionError> {
        let revision = message.acked_revision();
        self.send(message).await?;
        if let Some(revision) = revision {
            self.pending_acks.push_back(PendingAck { revision, since });
        }
        Ok(())
    }

    /// Writes one message. A write still blocked when the client would exceed the
    /// fall-behind limit, or when its pongs have stopped for longer than the pong
    /// timeout, fails the connection.
    async fn send(
        &mut self,
        message: ServerMessage,
    ) -> Result<(), ConnectionError> {
        let kind = message.kind();
        let max = self.ctx.config.max_fall_behind();
        let pong_timeout = self.ctx.config.pong_timeout();
        let oldest_pending = self.pending_acks.front().map(|p| p.since);
        let lag_at = |now: Instant| {
            oldest_pending.map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
        };
        let now = Instant::now();
        let fall_behind_deadline = now + max.saturating_sub(lag_at(now));
        let last_pong = self.last_pong.clone();

        let before = self.writer.encoder().bytes_encoded();
        {
            let write = self.writer.send(message);
            tokio::pin!(write);
            loop {
                // pongs keep arriving on the read half while the write is blocked
                let pong_deadline = *last_pong.lock() + pong_timeout;
                tokio::select! {
                    result = &mut write => {
                        result?;
                        break;
                    }
                    _ = tokio::time::sleep_until(fall_behind_deadline.min(pong_deadline)) => {
                        let now = Instant::now();
                        let since_pong = now.saturating_duration_since(*last_pong.lock());
                        if since_pong >= pong_timeout {
                            return Err(ConnectionError::PongTimeout(since_pong));
                        }
                        if now >= fall_behind_deadline {
                            return Err(ConnectionError::FellBehind { lag: lag_at(now), max });
                        }
                    }
                }
            }
        }

        self.stats.messages_sent += 1;
        MESSAGES_SENT_TOTAL.with_label_values(&[kind]).inc();
        BYTES_SENT_TOTAL.inc_by(self.writer.encoder().bytes_encoded() - before);
        Ok(())
    }

    fn set_state(
        &self,
        next: ConnectionState,
    ) {
        let current = *self.state_tx.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(conn = self.id, "ignoring state change {:?} -> {:?}", current, next);
            return;
        }
        trace!(conn = self.id, "state {:?} -> {:?}", current, next);
        self.state_tx.send_replace(next);
    }
}

/// Close notice matching a connection fault, when the client should get one
fn close_reason_for(error: &ConnectionError) -> Option<CloseReason> {
    match error {
        ConnectionError::VersionMismatch { .. } => Some(CloseReason::VersionMismatch),
        ConnectionError::PongTimeout(_) => Some(CloseReason::PongTimeout),
        ConnectionError::FellBehind { .. } => Some(CloseReason::FellBehind),
        ConnectionError::ProtocolViolation(_)
        | ConnectionError::AckBeyondSent { .. }
        | ConnectionError::Protocol(ProtocolError::FrameTooLarge { .. })
        | ConnectionError::Protocol(ProtocolError::Codec(_)) => Some(CloseReason::ProtocolViolation),
        _ => None,
    }
}

async fn read_client_messages<R>(
    conn: u64,
    mut reader: FramedRead<R, ServerCodec>,
    tx: mpsc::Sender<Result<ClientMessage, ProtocolError>>,
    last_pong: LastPong,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    while let Some(result) = reader.next().await {
        if let Ok(ClientMessage::Pong { .. }) = &result {
            *last_pong.lock() = Instant::now();
        }
        let failed = result.is_err();
        if tx.send(result).await.is_err() || failed {
            break;
        }
    }
    trace!(conn, "client read half finished");
}
