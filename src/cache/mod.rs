//! Snapshot cache: the authoritative in-memory copy of upstream state.
//!
//! A single [`CacheProcessor`] task owns the state table and replay buffer. Applying
//! updates, building snapshots and registering subscribers all happen on that task,
//! which makes attach atomic with respect to update application.
mod replay_buffer;
mod snapshot_cache;
mod types;

pub use replay_buffer::*;
pub use snapshot_cache::*;
pub use types::*;
