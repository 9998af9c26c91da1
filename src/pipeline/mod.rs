//! Upstream half of the proxy: watch callbacks, decoupling queues and validation.
//!
//! The stages are chained through [`SyncerCallbacks`]:
//! syncer → decoupler → validation filter → decoupler → snapshot cache.
mod callbacks;
mod decoupler;
mod types;
mod validation;

pub use callbacks::*;
pub use decoupler::*;
pub use types::*;
pub use validation::*;

#[cfg(test)]
mod decoupler_test;
