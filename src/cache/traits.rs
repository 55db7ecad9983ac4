//! Cache keys and result metadata.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Something that can be turned into a stable cache key.
pub trait CacheKey {
  /// Fixed-length key used for storage.
  fn cache_hash(&self) -> String;

  /// Human readable description, for logs.
  fn description(&self) -> String;
}

/// Key of an owner's collection snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
  pub collection: String,
  pub owner_id: String,
}

impl CollectionKey {
  pub fn new(collection: impl Into<String>, owner_id: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      owner_id: owner_id.into(),
    }
  }
}

impl CacheKey for CollectionKey {
  fn cache_hash(&self) -> String {
    let input = format!(
      "collection:{}:{}",
      self.collection.trim().to_lowercase(),
      self.owner_id
    );

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    format!("{} of {}", self.collection, self.owner_id)
  }
}

/// Result of a read, including data and metadata about the source.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the remote store.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Cached data within its ttl.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Offline mode - network unavailable, serving cached data of any age.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Remote fetch failed, serving the last known-good data.
  pub fn stale(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheStale,
      cached_at: Some(cached_at),
    }
  }

  /// Whether the data may lag behind the server.
  pub fn is_cached(&self) -> bool {
    self.source != CacheSource::Network
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache after the network fetch failed
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}
