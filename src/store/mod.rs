//! The synchronized collection the presentation layer talks to.
//!
//! [`SyncedCollectionStore`] holds the working set of one owner's records. Mutations are applied
//! locally first and confirmed through the [`RemoteGateway`]; a rejected mutation is reversed
//! for that record alone, from a snapshot taken just before it was applied. Reads go through the
//! [`CacheStore`] and degrade to cached data when the network is gone.

mod locks;
mod options;
mod search;

use std::collections::{HashMap, HashSet, VecDeque};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheResult, CacheStore, CollectionKey};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{ErrorCode, SyncError};
use crate::gateway::{RemoteGateway, Statistics};
use crate::record::{is_temporary_id, Payload, Record, RecordStatus, TempIds};
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::session::SessionProvider;

use locks::RecordLocks;
pub use options::{Capabilities, PendingCreatesInSearch, StoreOptions};

/// Records returned by [`SyncedCollectionStore::load`], with where they came from.
pub type LoadOutcome = CacheResult<Vec<Record>>;

/// Most recent errors kept by [`SyncedCollectionStore::error_log`].
const ERROR_LOG_LIMIT: usize = 100;

/// Result of [`SyncedCollectionStore::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
  pub records: Vec<Record>,
  /// Matched against a local snapshot, which may not hold every record.
  pub partial: bool,
}

/// An entry of [`SyncedCollectionStore::error_log`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedError {
  /// Store operation that failed, e.g. `"update"`.
  pub operation: &'static str,
  pub at: DateTime<Utc>,
  pub error: SyncError,
}

/// A change to one record of the working set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
  Changed { id: String, status: RecordStatus },
  Removed { id: String },
}

/// Which local pending records survive a new snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeepPending {
  /// The snapshot came from the cache, which never holds unconfirmed writes, or fills a set
  /// that was never loaded.
  All,
  /// The snapshot came from the server and is authoritative, except for writes still in flight.
  InFlight,
}

#[derive(Default)]
struct WorkingSet {
  /// Owner the records belong to.
  owner: Option<String>,
  /// Pending deletes stay in place, hidden, until they settle.
  records: Vec<Record>,
  /// Last confirmed version of records with a pending update or delete.
  snapshots: HashMap<String, Record>,
  in_flight: HashSet<String>,
  /// Holds a full snapshot, not just records created this session.
  loaded: bool,
  /// Set by a session invalidation until the provider reports a valid session again.
  blocked: bool,
}

impl WorkingSet {
  fn position(&self, id: &str) -> Option<usize> {
    self.records.iter().position(|r| r.id == id)
  }

  /// Records the user should see.
  fn visible(&self) -> Vec<Record> {
    self
      .records
      .iter()
      .filter(|r| r.status != RecordStatus::PendingDelete)
      .cloned()
      .collect()
  }

  /// Last known-good server state: confirmed records, and the snapshot of records with a
  /// pending change. Unconfirmed creates are left out.
  fn confirmed_view(&self) -> Vec<Record> {
    self
      .records
      .iter()
      .filter_map(|r| match r.status {
        RecordStatus::Confirmed => Some(r.clone()),
        RecordStatus::PendingUpdate | RecordStatus::PendingDelete => self.snapshots.get(&r.id).cloned(),
        RecordStatus::PendingCreate | RecordStatus::Reverted => None,
      })
      .collect()
  }

  /// Put `confirmed` where the temporary record was, dropping any copy of it a snapshot brought
  /// in meanwhile. False if the temporary record is gone.
  fn settle_create(&mut self, temp_id: &str, confirmed: Record) -> bool {
    let Some(mut i) = self.position(temp_id) else {
      return false;
    };
    if let Some(j) = self.position(&confirmed.id) {
      self.records.remove(j);
      self.snapshots.remove(&confirmed.id);
      if j < i {
        i -= 1;
      }
    }
    self.records[i] = confirmed;
    true
  }

  fn reset(&mut self) {
    self.records.clear();
    self.snapshots.clear();
    self.in_flight.clear();
    self.loaded = false;
  }
}

/// Owner-scoped working set with optimistic mutations and offline fallback.
pub struct SyncedCollectionStore {
  gateway: Arc<dyn RemoteGateway>,
  session: Arc<dyn SessionProvider>,
  monitor: Arc<ConnectivityMonitor>,
  cache: Arc<CacheStore<Vec<Record>>>,
  retry: RetryCoordinator,
  options: StoreOptions,
  working: Mutex<WorkingSet>,
  locks: RecordLocks,
  temp_ids: TempIds,
  error_log: Mutex<VecDeque<LoggedError>>,
  records_tx: watch::Sender<Vec<Record>>,
  loading_tx: watch::Sender<bool>,
  error_tx: watch::Sender<Option<SyncError>>,
  changes_tx: broadcast::Sender<RecordEvent>,
}

impl SyncedCollectionStore {
  pub fn new(
    gateway: Arc<dyn RemoteGateway>,
    session: Arc<dyn SessionProvider>,
    monitor: Arc<ConnectivityMonitor>,
    cache: Arc<CacheStore<Vec<Record>>>,
    retry_policy: RetryPolicy,
    options: StoreOptions,
  ) -> Self {
    let retry = RetryCoordinator::new(retry_policy, Arc::clone(&monitor));
    let (records_tx, _) = watch::channel(Vec::new());
    let (loading_tx, _) = watch::channel(false);
    let (error_tx, _) = watch::channel(None);
    let (changes_tx, _) = broadcast::channel(64);
    Self {
      gateway,
      session,
      monitor,
      cache,
      retry,
      options,
      working: Mutex::new(WorkingSet::default()),
      locks: RecordLocks::default(),
      temp_ids: TempIds::default(),
      error_log: Mutex::new(VecDeque::new()),
      records_tx,
      loading_tx,
      error_tx,
      changes_tx,
    }
  }

  // ==========================================================================
  // Observables
  // ==========================================================================

  /// Visible records, updated on every change.
  pub fn records(&self) -> watch::Receiver<Vec<Record>> {
    self.records_tx.subscribe()
  }

  pub fn current_records(&self) -> Vec<Record> {
    self.records_tx.borrow().clone()
  }

  /// Working-set entry for `id`, including hidden pending deletes.
  pub fn record(&self, id: &str) -> Option<Record> {
    let id = self.locks.resolve(id);
    let ws = self.working();
    ws.position(&id).map(|i| ws.records[i].clone())
  }

  pub fn loading(&self) -> watch::Receiver<bool> {
    self.loading_tx.subscribe()
  }

  pub fn is_loading(&self) -> bool {
    *self.loading_tx.borrow()
  }

  pub fn errors(&self) -> watch::Receiver<Option<SyncError>> {
    self.error_tx.subscribe()
  }

  pub fn last_error(&self) -> Option<SyncError> {
    self.error_tx.borrow().clone()
  }

  pub fn clear_error(&self) {
    self.error_tx.send_replace(None);
  }

  /// Most recent errors, newest first.
  pub fn error_log(&self) -> Vec<LoggedError> {
    self.error_entries().iter().cloned().collect()
  }

  /// Logged errors of one operation, newest first.
  pub fn errors_for(&self, operation: &str) -> Vec<LoggedError> {
    self
      .error_entries()
      .iter()
      .filter(|e| e.operation == operation)
      .cloned()
      .collect()
  }

  pub fn clear_error_log(&self) {
    self.error_entries().clear();
  }

  pub fn is_offline(&self) -> bool {
    self.monitor.is_offline()
  }

  /// Whether operations are blocked after a session invalidation.
  pub fn is_blocked(&self) -> bool {
    self.working().blocked
  }

  pub fn changes(&self) -> broadcast::Receiver<RecordEvent> {
    self.changes_tx.subscribe()
  }

  // ==========================================================================
  // Operations
  // ==========================================================================

  /// Load the owner's collection.
  ///
  /// 1. Unless forced, a cache entry within its ttl is returned immediately
  /// 2. Offline, any cached entry is served regardless of age, or [`SyncError::CacheMiss`]
  /// 3. Otherwise the gateway is called; on failure the last cached data is served as stale
  pub async fn load(&self, force_refresh: bool) -> Result<LoadOutcome, SyncError> {
    let owner = self.ensure_session("load")?;
    let key = self.cache_key(&owner);

    if !force_refresh {
      if let Some(entry) = self.cache.get_entry(&key, &owner) {
        debug!("load served from cache (v{})", entry.version);
        let mut ws = self.working();
        self.apply_snapshot(&mut ws, entry.data, KeepPending::All);
        return Ok(CacheResult::from_cache(ws.visible(), entry.cached_at));
      }
    }

    if self.monitor.is_offline() {
      let entry = self.cache.peek(&key, &owner);
      let mut ws = self.working();
      return match entry {
        Some(entry) => {
          info!("offline, serving cached snapshot from {}", entry.cached_at);
          self.apply_snapshot(&mut ws, entry.data, KeepPending::All);
          Ok(CacheResult::offline(ws.visible(), entry.cached_at))
        }
        None => Err(self.fail("load", SyncError::CacheMiss)),
      };
    }

    self.loading_tx.send_replace(true);
    let result = self
      .retry
      .run("fetch_all", || self.gateway.fetch_all(&owner))
      .await;
    self.loading_tx.send_replace(false);

    let mut ws = self.working();
    if ws.owner.as_deref() != Some(owner.as_str()) {
      debug!("discarding fetch for {}: session changed", owner);
      return Err(SyncError::SessionInvalid);
    }

    match result {
      Ok(records) => {
        info!("loaded {} record(s) for {}", records.len(), owner);
        self.apply_snapshot(&mut ws, records, KeepPending::InFlight);
        self.write_cache(&ws);
        self.error_tx.send_replace(None);
        Ok(CacheResult::from_network(ws.visible()))
      }
      Err(err) => {
        let err = self.fail("load", err);
        match self.cache.peek(&key, &owner) {
          Some(entry) => {
            warn!("fetch failed, serving cached snapshot from {}", entry.cached_at);
            self.apply_snapshot(&mut ws, entry.data, KeepPending::All);
            Ok(CacheResult::stale(ws.visible(), entry.cached_at))
          }
          None => Err(err),
        }
      }
    }
  }

  /// Create a record.
  ///
  /// A `pending-create` record with a temporary id is visible as soon as the call starts. It is
  /// replaced by the confirmed record on success and removed on failure. Offline, it stays
  /// pending and the call returns [`SyncError::Connectivity`].
  pub async fn create(&self, payload: Payload) -> Result<Record, SyncError> {
    let owner = self.ensure_session("create")?;
    self.check_capability(self.options.capabilities.can_create, "create")?;
    let outcome = self.create_locked(&owner, payload).await;
    self.locks.prune();
    if outcome.is_ok() {
      self.fill_unloaded(&owner).await;
    }
    outcome
  }

  async fn create_locked(&self, owner: &str, payload: Payload) -> Result<Record, SyncError> {
    let temp_id = self.temp_ids.next_id();
    let _guard = self.locks.lock(&temp_id).await;

    {
      let mut ws = self.working();
      let record = Record::new(&temp_id, owner, payload.clone()).with_status(RecordStatus::PendingCreate);
      ws.records.insert(0, record);
      self.changed(&temp_id, RecordStatus::PendingCreate);
      self.publish(&ws);

      if self.monitor.is_offline() {
        return Err(self.fail("create", SyncError::connectivity("offline, create kept as pending")));
      }
      ws.in_flight.insert(temp_id.clone());
    }

    let result = self
      .retry
      .run("create", || self.gateway.create(&payload, owner))
      .await;

    let mut ws = self.working();
    ws.in_flight.remove(&temp_id);
    let position = ws.position(&temp_id);
    match result {
      Ok(created) => {
        let created = created.with_status(RecordStatus::Confirmed);
        self.locks.confirm(&temp_id, &created.id);
        if ws.settle_create(&temp_id, created.clone()) {
          debug!("{} confirmed as {}", temp_id, created.id);
          self.changed(&created.id, RecordStatus::Confirmed);
          self.write_cache(&ws);
          self.publish(&ws);
        } else {
          debug!("create of {} settled after the record was discarded", temp_id);
        }
        Ok(created)
      }
      Err(err) => {
        if let Some(i) = position {
          warn!("create of {} failed, removing it", temp_id);
          ws.records.remove(i);
          self.changed(&temp_id, RecordStatus::Reverted);
          self.publish(&ws);
        }
        Err(self.fail("create", err))
      }
    }
  }

  /// Update fields of a record.
  ///
  /// Waits for earlier mutations of the same record, applies `payload` over the current fields,
  /// and restores the exact previous record if the gateway rejects it. Offline, the change stays
  /// `pending-update` and the call returns [`SyncError::Connectivity`].
  pub async fn update(&self, id: &str, payload: Payload) -> Result<Record, SyncError> {
    let owner = self.ensure_session("update")?;
    self.check_capability(self.options.capabilities.can_update, "update")?;
    let outcome = self.update_locked(&owner, id, payload).await;
    self.locks.prune();
    if outcome.is_ok() {
      self.fill_unloaded(&owner).await;
    }
    outcome
  }

  async fn update_locked(&self, owner: &str, id: &str, patch: Payload) -> Result<Record, SyncError> {
    let _guard = self.locks.lock(id).await;
    let id = self.locks.resolve(id);

    let (previous, pending, outgoing) = {
      let mut ws = self.working();
      let Some(i) = ws
        .position(&id)
        .filter(|&i| ws.records[i].status != RecordStatus::PendingDelete)
      else {
        return Err(self.fail("update", SyncError::UnknownRecord { id }));
      };

      let previous = ws.records[i].clone();
      if previous.status == RecordStatus::Confirmed {
        ws.snapshots.insert(id.clone(), previous.clone());
      }
      let record = &mut ws.records[i];
      record.merge_payload(&patch);
      // An unconfirmed create absorbs the change and is created with it.
      if !record.is_temporary() {
        record.status = RecordStatus::PendingUpdate;
      }
      let pending = record.clone();
      // A change still pending from an earlier offline update goes out with this one.
      let outgoing = match ws.snapshots.get(&id) {
        Some(base) if previous.status == RecordStatus::PendingUpdate => {
          pending.changed_fields(&base.payload)
        }
        _ => patch,
      };
      self.changed(&id, pending.status);
      self.publish(&ws);

      if self.monitor.is_offline() {
        return Err(self.fail("update", SyncError::connectivity("offline, update kept as pending")));
      }
      ws.in_flight.insert(id.clone());
      (previous, pending, outgoing)
    };

    let result = if pending.is_temporary() {
      self
        .retry
        .run("create", || self.gateway.create(&pending.payload, owner))
        .await
    } else {
      self
        .retry
        .run("update", || self.gateway.update(&id, &outgoing, owner))
        .await
    };

    let mut ws = self.working();
    ws.in_flight.remove(&id);
    let Some(i) = ws.position(&id) else {
      debug!("update of {} settled after the record was discarded", id);
      return result.map_err(|err| self.fail("update", err));
    };

    match result {
      Ok(updated) => {
        let updated = updated.with_status(RecordStatus::Confirmed);
        ws.snapshots.remove(&id);
        if updated.id == id {
          ws.records[i] = updated.clone();
        } else {
          self.locks.confirm(&id, &updated.id);
          ws.settle_create(&id, updated.clone());
        }
        self.changed(&updated.id, RecordStatus::Confirmed);
        self.write_cache(&ws);
        self.publish(&ws);
        Ok(updated)
      }
      Err(err) => {
        warn!("update of {} failed, restoring previous version", id);
        if previous.status == RecordStatus::Confirmed {
          ws.snapshots.remove(&id);
        }
        ws.records[i] = previous;
        self.changed(&id, RecordStatus::Reverted);
        self.publish(&ws);
        Err(self.fail("update", err))
      }
    }
  }

  /// Delete a record.
  ///
  /// The record is hidden at once and put back in the same place if the gateway rejects the
  /// delete. Offline, it stays hidden as `pending-delete` and the call returns
  /// [`SyncError::Connectivity`].
  pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
    let owner = self.ensure_session("delete")?;
    self.check_capability(self.options.capabilities.can_delete, "delete")?;
    let outcome = self.delete_locked(&owner, id).await;
    self.locks.prune();
    if outcome.is_ok() {
      self.fill_unloaded(&owner).await;
    }
    outcome
  }

  async fn delete_locked(&self, owner: &str, id: &str) -> Result<(), SyncError> {
    let _guard = self.locks.lock(id).await;
    let id = self.locks.resolve(id);

    let previous = {
      let mut ws = self.working();
      let Some(i) = ws
        .position(&id)
        .filter(|&i| ws.records[i].status != RecordStatus::PendingDelete)
      else {
        return Err(self.fail("delete", SyncError::UnknownRecord { id }));
      };

      let previous = ws.records[i].clone();
      if previous.is_temporary() {
        // Never reached the server; nothing to confirm.
        ws.records.remove(i);
        self.changed(&id, RecordStatus::Reverted);
        self.publish(&ws);
        return Ok(());
      }

      if previous.status == RecordStatus::Confirmed {
        ws.snapshots.insert(id.clone(), previous.clone());
      }
      ws.records[i].status = RecordStatus::PendingDelete;
      self.changed(&id, RecordStatus::PendingDelete);
      self.publish(&ws);

      if self.monitor.is_offline() {
        return Err(self.fail("delete", SyncError::connectivity("offline, delete kept as pending")));
      }
      ws.in_flight.insert(id.clone());
      previous
    };

    let result = self
      .retry
      .run("delete", || self.gateway.delete(&id, owner))
      .await;

    let mut ws = self.working();
    ws.in_flight.remove(&id);
    let position = ws.position(&id);
    match (result, position) {
      (Ok(()), Some(i)) => {
        ws.records.remove(i);
        ws.snapshots.remove(&id);
        self.removed(&id);
        self.write_cache(&ws);
        self.publish(&ws);
        Ok(())
      }
      (Ok(()), None) => Ok(()),
      (Err(err), Some(i)) => {
        warn!("delete of {} failed, restoring it", id);
        if previous.status == RecordStatus::Confirmed {
          ws.snapshots.remove(&id);
        }
        ws.records[i] = previous;
        self.changed(&id, RecordStatus::Reverted);
        self.publish(&ws);
        Err(self.fail("delete", err))
      }
      (Err(err), None) => Err(self.fail("delete", err)),
    }
  }

  /// Search the owner's records.
  ///
  /// Online this always asks the gateway, since the working set may be incomplete. Offline it
  /// matches the cached snapshot locally and flags the result as partial.
  pub async fn search(&self, term: &str) -> Result<SearchOutcome, SyncError> {
    let owner = self.ensure_session("search")?;
    if term.trim().is_empty() {
      return Ok(SearchOutcome {
        records: self.current_records(),
        partial: false,
      });
    }

    let mut records: Vec<Record> = match self.options.pending_creates_in_search {
      PendingCreatesInSearch::Include => self
        .working()
        .records
        .iter()
        .filter(|r| r.status == RecordStatus::PendingCreate)
        .filter(|r| search::matches(r, term, &self.options.search_fields))
        .cloned()
        .collect(),
      PendingCreatesInSearch::Exclude => Vec::new(),
    };

    if self.monitor.is_offline() {
      let Some(entry) = self.cache.peek(&self.cache_key(&owner), &owner) else {
        return Err(self.fail("search", SyncError::CacheMiss));
      };
      records.extend(
        entry
          .data
          .into_iter()
          .filter(|r| search::matches(r, term, &self.options.search_fields)),
      );
      return Ok(SearchOutcome {
        records,
        partial: true,
      });
    }

    let found = self
      .retry
      .run("search", || self.gateway.search(term, &owner))
      .await
      .map_err(|err| self.fail("search", err))?;
    records.extend(found);
    Ok(SearchOutcome {
      records,
      partial: false,
    })
  }

  /// Aggregate statistics. Computed by the server when online, from the cache when offline.
  pub async fn statistics(&self) -> Result<Statistics, SyncError> {
    let owner = self.ensure_session("statistics")?;

    if self.monitor.is_offline() {
      return match self.cache.peek(&self.cache_key(&owner), &owner) {
        Some(entry) => Ok(Statistics::tally(&entry.data, &self.options.stat_fields)),
        None => Err(self.fail("statistics", SyncError::CacheMiss)),
      };
    }

    self
      .retry
      .run("statistics", || self.gateway.statistics(&owner))
      .await
      .map_err(|err| self.fail("statistics", err))
  }

  /// Re-read one record from the server and make it the working-set version.
  pub async fn refresh_record(&self, id: &str) -> Result<Record, SyncError> {
    let owner = self.ensure_session("refresh")?;
    if self.monitor.is_offline() {
      return Err(self.fail("refresh", SyncError::connectivity("offline, cannot refresh")));
    }
    let outcome = self.refresh_locked(&owner, id).await;
    self.locks.prune();
    outcome
  }

  async fn refresh_locked(&self, owner: &str, id: &str) -> Result<Record, SyncError> {
    let _guard = self.locks.lock(id).await;
    let id = self.locks.resolve(id);
    if is_temporary_id(&id) {
      return Err(self.fail("refresh", SyncError::UnknownRecord { id }));
    }

    let result = self
      .retry
      .run("fetch_one", || self.gateway.fetch_one(&id))
      .await
      .and_then(|record| {
        if record.owner_id == owner {
          Ok(record)
        } else {
          Err(SyncError::forbidden(format!("record {} belongs to another owner", id)))
        }
      });

    let mut ws = self.working();
    if ws.owner.as_deref() != Some(owner) {
      return Err(SyncError::SessionInvalid);
    }
    match result {
      Ok(record) => {
        let record = record.with_status(RecordStatus::Confirmed);
        ws.snapshots.remove(&id);
        match ws.position(&id) {
          Some(i) => ws.records[i] = record.clone(),
          None => ws.records.insert(0, record.clone()),
        }
        self.changed(&id, RecordStatus::Confirmed);
        self.write_cache(&ws);
        self.publish(&ws);
        Ok(record)
      }
      Err(err) => {
        if err.code() == Some(ErrorCode::NotFound) {
          if let Some(i) = ws.position(&id) {
            info!("{} no longer exists on the server", id);
            ws.records.remove(i);
            ws.snapshots.remove(&id);
            self.removed(&id);
            self.write_cache(&ws);
            self.publish(&ws);
          }
        }
        Err(self.fail("refresh", err))
      }
    }
  }

  // ==========================================================================
  // Session
  // ==========================================================================

  /// Drop everything held for `owner_id` and block operations until a valid session exists.
  pub fn on_session_invalidated(&self, owner_id: &str) {
    let removed = self.cache.invalidate_owner(owner_id);
    let mut ws = self.working();
    if ws.owner.is_none() || ws.owner.as_deref() == Some(owner_id) {
      info!(
        "session of {} invalidated, cleared working set and {} cache entries",
        owner_id, removed
      );
      ws.reset();
      ws.owner = None;
      ws.blocked = true;
      self.locks.clear_aliases();
      self.publish(&ws);
    }
  }

  /// Follow the session provider's invalidation notices.
  pub fn spawn_session_watch(self: &Arc<Self>) -> JoinHandle<()> {
    let mut rx = self.session.subscribe_invalidated();
    let store = Arc::downgrade(self);
    tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(owner) => match store.upgrade() {
            Some(store) => store.on_session_invalidated(&owner),
            None => break,
          },
          Err(RecvError::Lagged(n)) => warn!("missed {} session notices", n),
          Err(RecvError::Closed) => break,
        }
      }
    })
  }

  /// Current owner, switching the working set over if the owner changed.
  fn ensure_session(&self, operation: &'static str) -> Result<String, SyncError> {
    let owner = match (self.session.is_session_valid(), self.session.current_owner_id()) {
      (true, Some(owner)) => owner,
      _ => return Err(self.fail(operation, SyncError::SessionInvalid)),
    };

    let mut ws = self.working();
    if ws.blocked {
      info!("session established for {}", owner);
      ws.blocked = false;
    }
    if ws.owner.as_deref() != Some(owner.as_str()) {
      if let Some(previous) = ws.owner.take() {
        info!("owner switched from {} to {}", previous, owner);
        self.cache.invalidate_owner(&previous);
      }
      ws.reset();
      ws.owner = Some(owner.clone());
      self.locks.clear_aliases();
      self.publish(&ws);
    }
    Ok(owner)
  }

  fn check_capability(&self, allowed: bool, action: &'static str) -> Result<(), SyncError> {
    if allowed {
      Ok(())
    } else {
      Err(self.fail(action, SyncError::forbidden(format!("{} is not permitted", action))))
    }
  }

  // ==========================================================================
  // Internals
  // ==========================================================================

  fn working(&self) -> MutexGuard<'_, WorkingSet> {
    self
      .working
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn error_entries(&self) -> MutexGuard<'_, VecDeque<LoggedError>> {
    self
      .error_log
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn cache_key(&self, owner: &str) -> String {
    CollectionKey::new(&self.options.collection, owner).cache_hash()
  }

  /// Replace the working set with `snapshot`, keeping local pending records as `keep` says.
  fn apply_snapshot(&self, ws: &mut WorkingSet, snapshot: Vec<Record>, keep: KeepPending) {
    let mut merged: Vec<Record> = snapshot
      .into_iter()
      .map(|r| r.with_status(RecordStatus::Confirmed))
      .collect();
    let mut creates = Vec::new();
    let mut dropped = Vec::new();

    for local in std::mem::take(&mut ws.records) {
      if !local.status.is_pending() {
        continue;
      }
      let kept = match keep {
        KeepPending::All => true,
        KeepPending::InFlight => ws.in_flight.contains(&local.id),
      };
      if !kept {
        dropped.push(local.id);
        continue;
      }
      if local.status == RecordStatus::PendingCreate {
        creates.push(local);
        continue;
      }
      match merged.iter().position(|r| r.id == local.id) {
        Some(i) => {
          let id = local.id.clone();
          let confirmed = std::mem::replace(&mut merged[i], local);
          ws.snapshots.insert(id, confirmed);
        }
        None => dropped.push(local.id),
      }
    }

    if !dropped.is_empty() {
      info!("discarded {} unconfirmed local change(s)", dropped.len());
    }
    for id in &dropped {
      ws.snapshots.remove(id);
      self.changed(id, RecordStatus::Reverted);
    }

    creates.extend(merged);
    ws.records = creates;
    let records = &ws.records;
    ws.snapshots
      .retain(|id, _| records.iter().any(|r| &r.id == id && r.status.is_pending()));
    ws.loaded = true;
    self.publish(ws);
  }

  /// After a mutation confirmed before any load, fetch the full collection so the cache holds it.
  async fn fill_unloaded(&self, owner: &str) {
    let loaded = self.working().loaded;
    if loaded || self.monitor.is_offline() {
      return;
    }
    match self
      .retry
      .run("fetch_all", || self.gateway.fetch_all(owner))
      .await
    {
      Ok(records) => {
        let mut ws = self.working();
        if ws.owner.as_deref() == Some(owner) && !ws.loaded {
          debug!("filled unloaded working set with {} record(s)", records.len());
          self.apply_snapshot(&mut ws, records, KeepPending::All);
          self.write_cache(&ws);
        }
      }
      Err(err) => warn!("could not fetch {} after a confirmed change: {}", owner, err),
    }
  }

  /// Store the confirmed view, once the working set holds a full snapshot.
  fn write_cache(&self, ws: &WorkingSet) {
    if !ws.loaded {
      return;
    }
    if let Some(owner) = &ws.owner {
      let key = CollectionKey::new(&self.options.collection, owner);
      let view = ws.confirmed_view();
      debug!("caching {} record(s) as {}", view.len(), key.description());
      self.cache.set(&key.cache_hash(), view, owner);
    }
  }

  fn publish(&self, ws: &WorkingSet) {
    self.records_tx.send_replace(ws.visible());
  }

  fn changed(&self, id: &str, status: RecordStatus) {
    let _ = self.changes_tx.send(RecordEvent::Changed {
      id: id.to_string(),
      status,
    });
  }

  fn removed(&self, id: &str) {
    let _ = self.changes_tx.send(RecordEvent::Removed { id: id.to_string() });
  }

  /// Record `err` as the latest error of `operation` and hand it back.
  fn fail(&self, operation: &'static str, err: SyncError) -> SyncError {
    let mut log = self.error_entries();
    log.push_front(LoggedError {
      operation,
      at: Utc::now(),
      error: err.clone(),
    });
    log.truncate(ERROR_LOG_LIMIT);
    drop(log);
    self.error_tx.send_replace(Some(err.clone()));
    err
  }
}

#[cfg(test)]
mod tests;
