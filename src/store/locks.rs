//! Per-record mutation locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
struct LockTable {
  locks: HashMap<String, Arc<AsyncMutex<()>>>,
  /// temporary id -> server id
  aliases: HashMap<String, String>,
}

impl LockTable {
  fn resolve(&self, id: &str) -> String {
    self
      .aliases
      .get(id)
      .cloned()
      .unwrap_or_else(|| id.to_string())
  }
}

/// One FIFO lock per record, so mutations on the same record apply in issue order while
/// different records proceed independently.
///
/// Once a temporary id is confirmed, it resolves to the server id and shares its lock.
#[derive(Default)]
pub(crate) struct RecordLocks {
  table: Mutex<LockTable>,
}

impl RecordLocks {
  fn table(&self) -> MutexGuard<'_, LockTable> {
    self
      .table
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Wait until every earlier mutation of `id` has settled.
  pub(crate) async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
    let lock = {
      let mut table = self.table();
      let key = table.resolve(id);
      Arc::clone(table.locks.entry(key).or_default())
    };
    lock.lock_owned().await
  }

  /// The id `id` currently stands for.
  pub(crate) fn resolve(&self, id: &str) -> String {
    self.table().resolve(id)
  }

  /// Record that `temp_id` became `server_id`. Waiters on the temporary id keep their place.
  pub(crate) fn confirm(&self, temp_id: &str, server_id: &str) {
    let mut table = self.table();
    if let Some(lock) = table.locks.remove(temp_id) {
      table.locks.entry(server_id.to_string()).or_insert(lock);
    }
    table
      .aliases
      .insert(temp_id.to_string(), server_id.to_string());
  }

  /// Drop locks nobody holds or waits for, and aliases pointing at them.
  pub(crate) fn prune(&self) {
    let mut table = self.table();
    table.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    let LockTable { locks, aliases } = &mut *table;
    aliases.retain(|_, server_id| locks.contains_key(server_id));
  }

  /// Forget every temporary id. Held locks stay until released.
  pub(crate) fn clear_aliases(&self) {
    self.table().aliases.clear();
  }

  #[cfg(test)]
  pub(crate) fn len(&self) -> usize {
    self.table().locks.len()
  }

  #[cfg(test)]
  pub(crate) fn alias_count(&self) -> usize {
    self.table().aliases.len()
  }
}
