//! Bounded-lifetime caching of collection snapshots.
//!
//! This module provides a network-free cache that:
//! - Scopes every entry to the owner that wrote it
//! - Uses a short ttl while online and a long one while offline
//! - Sweeps old entries in the background regardless of access

mod store;
mod traits;

pub use store::{CacheEntry, CacheStats, CacheStore, CacheTtl};
pub use traits::{CacheKey, CacheResult, CacheSource, CollectionKey};
