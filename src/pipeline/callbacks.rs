use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;

use super::SyncStatus;
use super::Update;
use crate::Result;

/// Callback surface every pipeline stage exposes to the stage in front of it.
///
/// Calls for one sink arrive in order from a single producer. An `Err` means the
/// receiving stage has stopped and the producer should stop too.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SyncerCallbacks: Send + Sync + 'static {
    async fn on_status_updated(
        &self,
        status: SyncStatus,
    ) -> Result<()>;

    async fn on_updates(
        &self,
        updates: Vec<Update>,
    ) -> Result<()>;
}

/// The upstream watch: once started it reports a full resync followed by every
/// later change, in revision order, to the callbacks it was built with.
pub trait Syncer: Send {
    /// Starts the watch in the background. It runs until `cancel` fires.
    fn start(
        &mut self,
        cancel: CancellationToken,
    );
}

/// Datastore client the daemon is built around
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    /// Builds an unstarted watch that feeds `callbacks`
    fn syncer(
        &self,
        callbacks: Arc<dyn SyncerCallbacks>,
    ) -> Box<dyn Syncer>;

    /// Succeeds once the datastore is initialized and can be watched
    async fn ensure_initialized(&self) -> Result<()>;
}
