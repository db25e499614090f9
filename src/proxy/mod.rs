//! Offline cache proxy: network-first request interception with a versioned,
//! persistent cache fallback.
//!
//! This module is the service-worker equivalent of the original viewer:
//! - Precaches the app shell into a versioned cache generation at install
//! - Keeps exactly one generation alive after activation
//! - Answers intercepted GETs network-first, falling back to the cache only
//!   on outright transport failure (never on slowness)
//! - Passes non-GET traffic through untouched

mod store;
mod traits;
mod worker;

pub use store::{CacheStore, SqliteStore};
pub use traits::{Fetch, PageRequest, RequestDescriptor, ResponseSnapshot, ResponseSource, ServedResponse};
pub use worker::OfflineCacheProxy;
