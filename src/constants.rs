// -
// Wire protocol

/// Highest protocol version this server speaks
pub const PROTOCOL_VERSION: u32 = 1;
/// Oldest client protocol version still accepted
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Every frame starts with a big-endian u32 payload length
pub(crate) const FRAME_HEADER_LEN: usize = 4;

/// Hard ceiling for a single outbound frame; record batching keeps frames far below it
pub(crate) const MAX_OUTBOUND_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Per-record framing overhead used when estimating message sizes
pub(crate) const RECORD_OVERHEAD_BYTES: usize = 24;

// -
// Health reporter names

pub(crate) const CACHE_HEALTH_NAME: &str = "snapshot_cache";
pub(crate) const SERVER_HEALTH_NAME: &str = "sync_server";

// -
// Connection plumbing

/// Queue between a connection's read half and its send loop
pub(crate) const CLIENT_MESSAGE_QUEUE: usize = 64;

/// Pause after a failed accept before retrying
pub(crate) const ACCEPT_RETRY_DELAY_MS: u64 = 100;

/// Bound on sending a rejection notice to a connection over the limit
pub(crate) const REJECT_WRITE_TIMEOUT_MS: u64 = 1_000;

/// Queue of attach, catch-up and stats requests into the cache task
pub(crate) const CACHE_REQUEST_QUEUE: usize = 1024;

/// Bound on flushing queued data and the close notice when a connection drains
pub(crate) const DRAIN_TIMEOUT_MS: u64 = 2_000;

/// Period of the accept loop's health report
pub(crate) const SERVER_HEALTH_INTERVAL_MS: u64 = 1_000;
