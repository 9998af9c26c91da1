use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::SinkExt;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::CloseReason;
use super::CloseReasonSlot;
use super::Connection;
use super::ConnectionContext;
use super::ConnectionState;
use super::FrameCodec;
use super::ServerMessage;
use crate::constants::ACCEPT_RETRY_DELAY_MS;
use crate::constants::MAX_OUTBOUND_FRAME_BYTES;
use crate::constants::REJECT_WRITE_TIMEOUT_MS;
use crate::constants::SERVER_HEALTH_INTERVAL_MS;
use crate::constants::SERVER_HEALTH_NAME;
use crate::Cache;
use crate::HealthReport;
use crate::HealthReporter;
use crate::NetworkError;
use crate::Result;
use crate::ServerConfig;
use crate::CONNECTIONS_ACCEPTED_TOTAL;
use crate::CONNECTIONS_ACTIVE;
use crate::CONNECTIONS_REJECTED_TOTAL;
use crate::CONNECTIONS_SHED_TOTAL;
use crate::MAX_CONNECTIONS;

/// Anything that can have its connection target adjusted at runtime
#[cfg_attr(test, automock)]
pub trait ConnectionLimiter: Send + Sync + 'static {
    fn set_max_conns(
        &self,
        max_conns: usize,
    );
}

/// Registry entry for one live connection
#[derive(Debug)]
struct ConnectionHandle {
    peer: SocketAddr,
    started_at: Instant,
    cancel: CancellationToken,
    close_reason: CloseReasonSlot,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    fn is_closing(&self) -> bool {
        self.cancel.is_cancelled() || self.state.borrow().is_terminal()
    }
}

/// Accepts downstream connections and keeps their number near the current target.
pub struct Server {
    cache: Cache,
    config: Arc<ServerConfig>,
    health: Arc<dyn HealthReporter>,
    server_id: Arc<str>,

    connections: DashMap<u64, ConnectionHandle>,
    next_id: AtomicU64,
    max_conns: AtomicUsize,
    /// Signalled whenever the last connection leaves the registry
    all_closed: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("server_id", &self.server_id)
            .field("connections", &self.connections.len())
            .field("max_conns", &self.max_conns())
            .finish()
    }
}

impl Server {
    pub fn new(
        cache: Cache,
        config: Arc<ServerConfig>,
        health: Arc<dyn HealthReporter>,
    ) -> Arc<Self> {
        let server_id = format!("fanout-{}-{:08x}", std::process::id(), rand::random::<u32>());
        MAX_CONNECTIONS.set(config.max_conns as i64);

        Arc::new(Self {
            cache,
            max_conns: AtomicUsize::new(config.max_conns),
            config,
            health,
            server_id: server_id.into(),
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            all_closed: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Binds the listener and spawns the accept loop and the connection governor.
    ///
    /// Both stop when `cancel` fires; every connection holds a child token of it and
    /// drains on its own.
    pub async fn start(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<SocketAddr> {
        let address = self.config.listen_addr();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| NetworkError::Bind { address, source })?;
        let local_addr = listener.local_addr().map_err(NetworkError::Io)?;
        info!(%local_addr, server_id = %self.server_id, "sync server listening");

        self.health.register_reporter(
            SERVER_HEALTH_NAME,
            Duration::from_millis(SERVER_HEALTH_INTERVAL_MS * 10),
            false,
        );

        let accept = tokio::spawn(self.clone().accept_loop(listener, cancel.clone()));
        let governor = tokio::spawn(self.clone().governor_loop(cancel));
        self.tasks.lock().extend([accept, governor]);

        Ok(local_addr)
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) {
        let mut health_tick = tokio::time::interval(Duration::from_millis(SERVER_HEALTH_INTERVAL_MS));
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("sync server stopped accepting");
                    break;
                }
                _ = health_tick.tick() => {
                    self.health.report(SERVER_HEALTH_NAME, HealthReport::healthy());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_accept(stream, peer, &cancel),
                    Err(e) => {
                        error!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(ACCEPT_RETRY_DELAY_MS)).await;
                    }
                },
            }
        }

        self.health.report(
            SERVER_HEALTH_NAME,
            HealthReport {
                live: true,
                ready: false,
            },
        );
    }

    fn on_accept(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "set_nodelay failed: {}", e);
        }

        let max_conns = self.max_conns();
        if self.connections.len() >= max_conns {
            warn!(%peer, "rejecting connection, limit of {} reached", max_conns);
            CONNECTIONS_REJECTED_TOTAL.inc();
            tokio::spawn(reject(stream, peer));
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let close_reason: CloseReasonSlot = Arc::new(Mutex::new(None));
        let conn_cancel = cancel.child_token();

        self.connections.insert(
            id,
            ConnectionHandle {
                peer,
                started_at: Instant::now(),
                cancel: conn_cancel.clone(),
                close_reason: close_reason.clone(),
                state: state_rx,
            },
        );
        CONNECTIONS_ACCEPTED_TOTAL.inc();
        CONNECTIONS_ACTIVE.set(self.connections.len() as i64);
        debug!(conn = id, %peer, "accepted connection");

        let ctx = ConnectionContext {
            cache: self.cache.clone(),
            config: self.config.clone(),
            server_id: self.server_id.clone(),
        };
        let (reader, writer) = stream.into_split();
        let connection = Connection::new(
            id,
            peer.to_string(),
            reader,
            writer,
            ctx,
            state_tx,
            close_reason,
            conn_cancel,
        );

        let server = self.clone();
        tokio::spawn(async move {
            let state = connection.run().await;
            server.remove_connection(id, state);
        });
    }

    fn remove_connection(
        &self,
        id: u64,
        state: ConnectionState,
    ) {
        if let Some((_, handle)) = self.connections.remove(&id) {
            debug!(
                conn = id,
                peer = %handle.peer,
                "connection finished as {} after {:?}",
                state.as_str(),
                handle.started_at.elapsed()
            );
        }
        let remaining = self.connections.len();
        CONNECTIONS_ACTIVE.set(remaining as i64);
        if remaining == 0 {
            self.all_closed.notify_waiters();
        }
    }

    /// Sheds at most one connection per `drop_interval` while above the target
    async fn governor_loop(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(self.config.drop_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Some(id) = self.pick_connection_to_shed() {
                        info!(
                            conn = id,
                            "shedding connection: {} open, target {}",
                            self.connections.len(),
                            self.max_conns()
                        );
                        if self.drop_connection(id, CloseReason::Rebalance) {
                            CONNECTIONS_SHED_TOTAL.inc();
                        }
                    }
                }
            }
        }
        trace!("connection governor stopped");
    }

    fn pick_connection_to_shed(&self) -> Option<u64> {
        let open: Vec<u64> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_closing())
            .map(|entry| *entry.key())
            .collect();
        if open.len() <= self.max_conns() {
            return None;
        }
        open.choose(&mut rand::thread_rng()).copied()
    }

    /// Asks one connection to drain and close. Returns false if it is unknown or
    /// already closing.
    pub fn drop_connection(
        &self,
        id: u64,
        reason: CloseReason,
    ) -> bool {
        let Some(handle) = self.connections.get(&id) else {
            return false;
        };
        if handle.is_closing() {
            return false;
        }
        *handle.close_reason.lock() = Some(reason);
        handle.cancel.cancel();
        true
    }

    pub fn max_conns(&self) -> usize {
        self.max_conns.load(Ordering::Relaxed)
    }

    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn connection_state(
        &self,
        id: u64,
    ) -> Option<ConnectionState> {
        self.connections.get(&id).map(|handle| *handle.state.borrow())
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Waits for the background loops to stop and every connection to finish.
    pub async fn join(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("sync server task failed: {}", e);
            }
        }

        loop {
            let notified = self.all_closed.notified();
            if self.connections.is_empty() {
                break;
            }
            notified.await;
        }
    }
}

impl ConnectionLimiter for Server {
    /// Clamped to `[1, server.max_conns]`
    fn set_max_conns(
        &self,
        max_conns: usize,
    ) {
        let clamped = max_conns.clamp(1, self.config.max_conns);
        let previous = self.max_conns.swap(clamped, Ordering::Relaxed);
        if previous != clamped {
            info!("connection target {} -> {}", previous, clamped);
        }
        MAX_CONNECTIONS.set(clamped as i64);
    }
}

/// Tells a client over the limit to go elsewhere, then hangs up.
async fn reject(
    stream: TcpStream,
    peer: SocketAddr,
) {
    let mut writer = FramedWrite::new(
        stream,
        FrameCodec::<(), ServerMessage>::new(MAX_OUTBOUND_FRAME_BYTES),
    );
    let notice = async {
        writer
            .send(ServerMessage::Close {
                reason: CloseReason::TooManyConnections,
            })
            .await?;
        writer.close().await
    };
    match tokio::time::timeout(Duration::from_millis(REJECT_WRITE_TIMEOUT_MS), notice).await {
        Ok(Ok(())) => trace!(%peer, "rejection delivered"),
        Ok(Err(e)) => debug!(%peer, "rejection not delivered: {}", e),
        Err(_) => debug!(%peer, "rejection timed out"),
    }
}
