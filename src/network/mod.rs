//! Downstream side of the proxy: the wire protocol, the per-connection send loop and
//! the server that accepts and governs connections.
//!
//! Each accepted socket gets its own [`Connection`] task. The task owns a subscription
//! to the snapshot cache, so a slow client only ever delays itself; the cache detaches
//! it when its queue overflows and the connection catches up on its own.

mod batch;
mod codec;
mod connection;
mod protocol;
mod server;
mod state;

pub use batch::*;
pub use codec::*;
pub use connection::*;
pub use protocol::*;
pub use server::*;
pub use state::*;
