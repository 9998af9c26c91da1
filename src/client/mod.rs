//! Downstream sync client.
//!
//! A reference consumer of the proxy's wire protocol. It mirrors the server's table
//! locally and reports every change to a [`SyncerCallbacks`](crate::SyncerCallbacks)
//! sink, so it can itself feed another pipeline.
//!
//! # Basic Usage
//! ```no_run
//! use std::sync::Arc;
//! use fanout_sync::SyncClient;
//! # use fanout_sync::SyncerCallbacks;
//! # async fn run(sink: Arc<dyn SyncerCallbacks>) -> fanout_sync::Result<()> {
//! let mut client = SyncClient::builder("127.0.0.1:5473")
//!     .hostname("node-1")
//!     .build(sink);
//! let exit = client
//!     .run(tokio_util::sync::CancellationToken::new())
//!     .await?;
//! println!("session ended: {:?} at {:?}", exit, client.last_revision());
//! # Ok(())
//! # }
//! ```

mod builder;
mod client;
mod config;

pub use builder::*;
pub use client::*;
pub use config::*;

#[cfg(test)]
mod client_test;
