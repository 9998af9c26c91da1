use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::SyncClientBuilder;
use super::SyncClientConfig;
use crate::ClientHello;
use crate::ClientMessage;
use crate::CloseReason;
use crate::ConnectionError;
use crate::Error;
use crate::FrameCodec;
use crate::NetworkError;
use crate::Result;
use crate::Revision;
use crate::ServerMessage;
use crate::SyncStatus;
use crate::SyncerCallbacks;
use crate::Update;

type ClientFramed = Framed<TcpStream, FrameCodec<ServerMessage, ClientMessage>>;

/// Why [`SyncClient::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// The caller's token fired; the server was sent a goodbye
    Cancelled,
    /// The server ended the session
    ServerClosed(CloseReason),
    /// The connection dropped without a close notice
    Disconnected,
}

/// Snapshot being received
struct PendingSnapshot {
    revision: Revision,
    status: SyncStatus,
    entries: BTreeMap<String, Bytes>,
}

/// Reference consumer of the downstream protocol.
///
/// Keeps a local copy of the server's table and reports every change to a
/// [`SyncerCallbacks`] sink. The copy and the last revision survive across
/// [`run`](SyncClient::run) calls, so a reconnect resumes where the previous session
/// ended and a fresh snapshot is reported as the difference to the local copy.
pub struct SyncClient {
    address: String,
    config: SyncClientConfig,
    sink: Arc<dyn SyncerCallbacks>,

    table: BTreeMap<String, Bytes>,
    last_revision: Option<Revision>,
    status: SyncStatus,
    server_id: Option<String>,
}

impl SyncClient {
    pub fn builder(address: impl Into<String>) -> SyncClientBuilder {
        SyncClientBuilder::new(address)
    }

    pub fn new(
        address: impl Into<String>,
        config: SyncClientConfig,
        sink: Arc<dyn SyncerCallbacks>,
    ) -> Self {
        Self {
            address: address.into(),
            config,
            sink,
            table: BTreeMap::new(),
            last_revision: None,
            status: SyncStatus::default(),
            server_id: None,
        }
    }

    pub fn last_revision(&self) -> Option<Revision> {
        self.last_revision
    }

    pub fn state(&self) -> &BTreeMap<String, Bytes> {
        &self.table
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Id of the server of the latest session
    pub fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref()
    }

    /// One session: connect, handshake, then apply until the server closes, the
    /// connection drops or `cancel` fires.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<ClientExit> {
        let mut framed = match self.connect().await? {
            Ok(framed) => framed,
            Err(exit) => return Ok(exit),
        };

        let mut snapshot: Option<PendingSnapshot> = None;
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("sync client cancelled, saying goodbye");
                    if let Err(e) = framed.send(ClientMessage::Goodbye).await {
                        debug!("goodbye not delivered: {}", e);
                    }
                    return Ok(ClientExit::Cancelled);
                }
                message = framed.next() => message,
            };

            let message = match message {
                None => {
                    info!("server connection dropped at revision {:?}", self.last_revision);
                    return Ok(ClientExit::Disconnected);
                }
                Some(result) => result?,
            };
            trace!(kind = message.kind(), "server message");

            match message {
                ServerMessage::SnapshotBegin {
                    revision,
                    status,
                    total_entries,
                } => {
                    debug!("receiving snapshot at revision {} ({} entries)", revision, total_entries);
                    snapshot = Some(PendingSnapshot {
                        revision,
                        status,
                        entries: BTreeMap::new(),
                    });
                }
                ServerMessage::SnapshotChunk { entries } => {
                    let Some(pending) = snapshot.as_mut() else {
                        return Err(violation("snapshot chunk outside a snapshot"));
                    };
                    pending.entries.extend(entries);
                }
                ServerMessage::SnapshotEnd { revision } => {
                    let Some(pending) = snapshot.take() else {
                        return Err(violation("snapshot end outside a snapshot"));
                    };
                    if pending.revision != revision {
                        return Err(violation("snapshot end revision does not match its begin"));
                    }
                    self.apply_snapshot(pending).await?;
                    self.ack(&mut framed, revision).await?;
                }
                ServerMessage::Deltas { updates, revision } => {
                    self.apply_deltas(updates, revision).await?;
                    self.ack(&mut framed, revision).await?;
                }
                ServerMessage::SyncStatus { status } => {
                    self.set_status(status).await?;
                }
                ServerMessage::Ping { timestamp_ms } => {
                    if self.config.respond_to_pings {
                        framed
                            .send(ClientMessage::Pong {
                                ping_timestamp_ms: timestamp_ms,
                            })
                            .await?;
                    }
                }
                ServerMessage::Close { reason } => {
                    info!(?reason, "server closed the session");
                    return Ok(ClientExit::ServerClosed(reason));
                }
                ServerMessage::Hello { .. } => return Err(violation("repeated server hello")),
            }
        }
    }

    /// Connects and completes the handshake. The inner `Err` is a server that
    /// refused the session.
    async fn connect(&mut self) -> Result<std::result::Result<ClientFramed, ClientExit>> {
        let timeout = self.config.handshake_timeout;
        match tokio::time::timeout(timeout, self.handshake()).await {
            Err(_) => Err(ConnectionError::HandshakeTimeout(timeout).into()),
            Ok(Err(e)) => Err(e),
            Ok(Ok(Err(exit))) => Ok(Err(exit)),
            Ok(Ok(Ok((framed, server_id)))) => {
                self.server_id = Some(server_id);
                Ok(Ok(framed))
            }
        }
    }

    async fn handshake(&self) -> Result<std::result::Result<(ClientFramed, String), ClientExit>> {
        let stream = TcpStream::connect(&self.address).await.map_err(NetworkError::Io)?;
        stream.set_nodelay(true).map_err(NetworkError::Io)?;
        let mut framed = Framed::new(stream, FrameCodec::new(self.config.max_frame_bytes));

        framed
            .send(ClientMessage::Hello(ClientHello {
                hostname: self.config.hostname.clone(),
                info: self.config.info.clone(),
                version: self.config.version,
                resume_from: self.last_revision,
            }))
            .await?;

        match framed.next().await {
            Some(Ok(ServerMessage::Hello { version, server_id })) => {
                info!(%server_id, version, resume_from = ?self.last_revision, "connected to {}", self.address);
                Ok(Ok((framed, server_id)))
            }
            Some(Ok(ServerMessage::Close { reason })) => {
                warn!(?reason, "server refused the session");
                Ok(Err(ClientExit::ServerClosed(reason)))
            }
            Some(Ok(other)) => Err(violation(&format!("expected server hello, got {}", other.kind()))),
            Some(Err(e)) => Err(e.into()),
            None => Ok(Err(ClientExit::Disconnected)),
        }
    }

    /// Replaces the local copy with `pending`, reporting only the difference
    async fn apply_snapshot(
        &mut self,
        pending: PendingSnapshot,
    ) -> Result<()> {
        let PendingSnapshot {
            revision,
            status,
            entries,
        } = pending;

        let mut changes = Vec::new();
        for key in self.table.keys() {
            if !entries.contains_key(key) {
                changes.push(Update::delete(key.clone(), revision));
            }
        }
        for (key, value) in &entries {
            if self.table.get(key) != Some(value) {
                changes.push(Update::put(key.clone(), value.clone(), revision));
            }
        }

        info!(
            "applied snapshot at revision {}: {} entries, {} changes",
            revision,
            entries.len(),
            changes.len()
        );
        self.table = entries;
        self.last_revision = Some(revision);
        self.set_status(status).await?;
        if changes.is_empty() {
            return Ok(());
        }
        self.sink.on_updates(changes).await
    }

    async fn apply_deltas(
        &mut self,
        updates: Vec<Update>,
        revision: Revision,
    ) -> Result<()> {
        for update in &updates {
            match &update.value {
                Some(value) => {
                    self.table.insert(update.key.clone(), value.clone());
                }
                None => {
                    self.table.remove(&update.key);
                }
            }
        }
        self.last_revision = Some(revision);
        self.sink.on_updates(updates).await
    }

    async fn set_status(
        &mut self,
        status: SyncStatus,
    ) -> Result<()> {
        if status == self.status {
            return Ok(());
        }
        self.status = status;
        self.sink.on_status_updated(status).await
    }

    async fn ack(
        &self,
        framed: &mut ClientFramed,
        revision: Revision,
    ) -> Result<()> {
        if self.config.send_acks {
            framed.send(ClientMessage::Ack { revision }).await?;
        }
        Ok(())
    }
}

fn violation(what: &str) -> Error {
    ConnectionError::ProtocolViolation(what.to_string()).into()
}
