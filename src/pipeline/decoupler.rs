use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::PipelineEvent;
use super::SyncStatus;
use super::SyncerCallbacks;
use super::Update;
use crate::PipelineError;
use crate::Result;

/// Turns callback calls from a producer into an ordered queue drained by one
/// consumer task.
///
/// The queue is bounded: a producer calling into a full decoupler waits until the
/// consumer catches up. Nothing is ever dropped.
pub struct SyncerCallbacksDecoupler {
    name: &'static str,
    tx: mpsc::Sender<PipelineEvent>,
    rx: mpsc::Receiver<PipelineEvent>,
}

impl SyncerCallbacksDecoupler {
    pub fn new(
        name: &'static str,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self { name, tx, rx }
    }

    /// Producer-facing handle. Clones share the same queue.
    pub fn sender(&self) -> DecouplerSender {
        DecouplerSender {
            name: self.name,
            tx: self.tx.clone(),
        }
    }

    /// Delivers queued events to `sink` in arrival order until cancelled or until
    /// every sender has been dropped.
    ///
    /// An event taken off the queue is always handed to the sink in full before
    /// cancellation is observed again.
    pub async fn send_to(
        self,
        sink: Arc<dyn SyncerCallbacks>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let Self { name, tx, mut rx } = self;
        drop(tx);

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(decoupler = name, pending = rx.len(), "decoupler cancelled");
                    return Ok(());
                }
                event = rx.recv() => event,
            };

            let Some(event) = event else {
                info!(decoupler = name, "all producers gone, decoupler exiting");
                return Ok(());
            };

            let delivered = match event {
                PipelineEvent::Status(status) => sink.on_status_updated(status).await,
                PipelineEvent::Updates(updates) => sink.on_updates(updates).await,
            };

            if let Err(e) = delivered {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                warn!(decoupler = name, "downstream stage failed: {:?}", e);
                return Err(e);
            }
        }
    }
}

/// Producer side of a [`SyncerCallbacksDecoupler`]
#[derive(Clone, Debug)]
pub struct DecouplerSender {
    name: &'static str,
    tx: mpsc::Sender<PipelineEvent>,
}

impl DecouplerSender {
    async fn enqueue(
        &self,
        event: PipelineEvent,
    ) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| PipelineError::QueueClosed(self.name).into())
    }
}

#[async_trait]
impl SyncerCallbacks for DecouplerSender {
    async fn on_status_updated(
        &self,
        status: SyncStatus,
    ) -> Result<()> {
        self.enqueue(PipelineEvent::Status(status)).await
    }

    async fn on_updates(
        &self,
        updates: Vec<Update>,
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        self.enqueue(PipelineEvent::Updates(updates)).await
    }
}
