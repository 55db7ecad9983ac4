//! In-memory, owner-scoped cache of collection snapshots.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::connectivity::ConnectivityState;

/// How long entries stay valid, depending on connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtl {
  /// Short, to force freshness.
  pub online: Duration,
  /// Long, to keep serving something.
  pub offline: Duration,
}

impl Default for CacheTtl {
  fn default() -> Self {
    Self {
      online: Duration::from_secs(5 * 60),
      offline: Duration::from_secs(30 * 60),
    }
  }
}

impl CacheTtl {
  /// `reconnecting` has not confirmed the network yet, so it gets the offline ttl.
  pub fn for_state(&self, state: ConnectivityState) -> Duration {
    match state {
      ConnectivityState::Online => self.online,
      ConnectivityState::Offline | ConnectivityState::Reconnecting => self.offline,
    }
  }

  pub fn max(&self) -> Duration {
    self.online.max(self.offline)
  }
}

/// A cached value and who wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub key: String,
  pub data: T,
  pub owner_id: String,
  pub version: u64,
  /// Wall-clock write time, for display.
  pub cached_at: DateTime<Utc>,
  stored_at: Instant,
}

impl<T> CacheEntry<T> {
  pub fn age(&self) -> Duration {
    self.stored_at.elapsed()
  }
}

/// Summary of the cache contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
  pub size: usize,
  pub keys: Vec<String>,
}

/// Keyed cache with a single mutation surface.
///
/// Every read and write is one step under the map lock, so a sweep never observes or
/// produces a half-written entry. An entry is only ever returned to the owner that wrote it.
pub struct CacheStore<T> {
  entries: Mutex<HashMap<String, CacheEntry<T>>>,
  ttl: CacheTtl,
  connectivity: watch::Receiver<ConnectivityState>,
  version: AtomicU64,
}

impl<T: Clone> CacheStore<T> {
  pub fn new(ttl: CacheTtl, connectivity: watch::Receiver<ConnectivityState>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      ttl,
      connectivity,
      version: AtomicU64::new(0),
    }
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<T>>> {
    // Entries are replaced whole, so a poisoned map is still consistent.
    self
      .entries
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn current_ttl(&self) -> Duration {
    self.ttl.for_state(*self.connectivity.borrow())
  }

  /// Store `data` for `owner_id`, replacing any previous entry. Returns the new version.
  pub fn set(&self, key: &str, data: T, owner_id: &str) -> u64 {
    let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
    let entry = CacheEntry {
      key: key.to_string(),
      data,
      owner_id: owner_id.to_string(),
      version,
      cached_at: Utc::now(),
      stored_at: Instant::now(),
    };
    self.entries().insert(key.to_string(), entry);
    debug!("cache set {} (v{})", key, version);
    version
  }

  /// Data for `key` if it belongs to `owner_id` and is within the current ttl.
  pub fn get(&self, key: &str, owner_id: &str) -> Option<T> {
    self.get_entry(key, owner_id).map(|e| e.data)
  }

  /// Like [`get`](Self::get) but with entry metadata.
  ///
  /// Expired entries are removed. Entries of another owner are left alone and reported absent.
  pub fn get_entry(&self, key: &str, owner_id: &str) -> Option<CacheEntry<T>> {
    let ttl = self.current_ttl();
    let mut entries = self.entries();
    let entry = entries.get(key)?;
    if entry.owner_id != owner_id {
      debug!("cache miss {} (owner mismatch)", key);
      return None;
    }
    if entry.age() > ttl {
      debug!("cache miss {} (expired)", key);
      entries.remove(key);
      return None;
    }
    Some(entry.clone())
  }

  /// Entry for `owner_id` regardless of age.
  pub fn peek(&self, key: &str, owner_id: &str) -> Option<CacheEntry<T>> {
    self
      .entries()
      .get(key)
      .filter(|e| e.owner_id == owner_id)
      .cloned()
  }

  pub fn invalidate(&self, key: &str) {
    self.entries().remove(key);
  }

  /// Remove every entry written by `owner_id`. Returns how many were removed.
  pub fn invalidate_owner(&self, owner_id: &str) -> usize {
    let mut entries = self.entries();
    let before = entries.len();
    entries.retain(|_, e| e.owner_id != owner_id);
    before - entries.len()
  }

  pub fn clear(&self) {
    self.entries().clear();
  }

  /// Drop entries older than the longest possible ttl. Returns how many were removed.
  pub fn sweep(&self) -> usize {
    let max_age = self.ttl.max();
    let mut entries = self.entries();
    let before = entries.len();
    entries.retain(|_, e| e.age() <= max_age);
    let removed = before - entries.len();
    if removed > 0 {
      debug!("cache sweep removed {} entries", removed);
    }
    removed
  }

  pub fn stats(&self) -> CacheStats {
    let entries = self.entries();
    let mut keys: Vec<String> = entries.keys().cloned().collect();
    keys.sort();
    CacheStats {
      size: entries.len(),
      keys,
    }
  }
}

impl<T: Clone + Send + Sync + 'static> CacheStore<T> {
  /// Sweep on an interval, whether or not anything reads the cache.
  pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
    let cache = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // The first tick completes immediately; nothing can be stale yet.
      ticker.tick().await;
      loop {
        ticker.tick().await;
        cache.sweep();
      }
    })
  }
}
