//! Fan-out synchronization proxy.
//!
//! A single upstream watch on an authoritative datastore is validated, folded into an
//! in-memory snapshot cache and streamed to many downstream consumers as one snapshot
//! followed by incremental deltas.

mod cache;
mod client;
mod config;
mod daemon;
mod errors;
mod health;
mod metrics;
mod network;
mod pipeline;
mod rebalance;
pub mod constants;
pub mod utils;

pub use cache::*;
pub use client::*;
pub use config::*;
pub use daemon::*;
pub use errors::*;
pub use health::*;
pub use metrics::*;
pub use network::*;
pub use pipeline::*;
pub use rebalance::*;
pub use utils::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
