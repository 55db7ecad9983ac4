use super::*;
use crate::cache::{CacheSource, CacheTtl};
use crate::connectivity::{ConnectivitySettings, ManualOsSignal, ProbeOutcome, StaticProbe};
use crate::error::GatewayError;
use crate::gateway::{Completeness, GatewayOp, MemoryGateway};
use crate::record::payload;
use crate::session::StaticSession;
use serde_json::{json, Value};

struct Fixture {
  gateway: Arc<MemoryGateway>,
  session: Arc<StaticSession>,
  probe: Arc<StaticProbe>,
  os: Arc<ManualOsSignal>,
  monitor: Arc<ConnectivityMonitor>,
  cache: Arc<CacheStore<Vec<Record>>>,
  store: Arc<SyncedCollectionStore>,
}

impl Fixture {
  fn new(options: StoreOptions) -> Self {
    let gateway = Arc::new(MemoryGateway::default());
    let session = Arc::new(StaticSession::signed_in("u1"));
    let probe = Arc::new(StaticProbe::new(ProbeOutcome::Reachable));
    let os = Arc::new(ManualOsSignal::default());
    let settings = ConnectivitySettings {
      endpoints: vec!["https://probe.test".into()],
      ..Default::default()
    };
    let monitor = Arc::new(ConnectivityMonitor::new(settings, probe.clone(), os.clone()));
    let cache = Arc::new(CacheStore::new(CacheTtl::default(), monitor.watch()));
    let store = Arc::new(SyncedCollectionStore::new(
      gateway.clone(),
      session.clone(),
      monitor.clone(),
      cache.clone(),
      RetryPolicy::default(),
      options,
    ));
    Self {
      gateway,
      session,
      probe,
      os,
      monitor,
      cache,
      store,
    }
  }

  fn go_offline(&self) {
    self.os.set(false);
    self.probe.set_default(ProbeOutcome::Unreachable);
    self.monitor.notify_os_offline();
  }

  async fn go_online(&self) {
    self.os.set(true);
    self.probe.set_default(ProbeOutcome::Reachable);
    assert!(self.monitor.notify_os_online().await);
  }

  fn cached(&self, owner: &str) -> Option<Vec<Record>> {
    let key = CollectionKey::new("records", owner).cache_hash();
    self.cache.peek(&key, owner).map(|entry| entry.data)
  }
}

fn fixture() -> Fixture {
  Fixture::new(StoreOptions::default())
}

fn pet(id: &str, fields: Value) -> Record {
  Record::new(id, "u1", payload(fields))
}

fn ids(records: &[Record]) -> Vec<String> {
  records.iter().map(|r| r.id.clone()).collect()
}

/// Yield to spawned tasks until `cond` holds.
async fn until(mut cond: impl FnMut() -> bool) {
  for _ in 0..1000 {
    if cond() {
      return;
    }
    tokio::task::yield_now().await;
  }
  panic!("condition never held");
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn test_create_confirms_and_updates_cache() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"name": "Max", "age": 3}))]);
  fx.store.load(false).await.unwrap();

  let created = fx.store.create(payload(json!({"name": "Rex"}))).await.unwrap();
  assert_eq!(created.id, "srv-1");

  let records = fx.store.current_records();
  assert_eq!(ids(&records), vec!["srv-1", "p1"]);
  assert!(records.iter().all(|r| r.status == RecordStatus::Confirmed));

  let cached = fx.cached("u1").unwrap();
  assert_eq!(ids(&cached), vec!["srv-1", "p1"]);
}

#[tokio::test]
async fn test_create_is_visible_while_in_flight() {
  let fx = fixture();
  fx.store.load(false).await.unwrap();
  fx.gateway.hold(GatewayOp::Create);

  let task = {
    let store = Arc::clone(&fx.store);
    tokio::spawn(async move { store.create(payload(json!({"name": "Rex"}))).await })
  };
  until(|| fx.gateway.calls(GatewayOp::Create) == 1).await;

  let records = fx.store.current_records();
  assert_eq!(records.len(), 1);
  assert!(records[0].is_temporary());
  assert_eq!(records[0].status, RecordStatus::PendingCreate);
  // Unconfirmed creates never reach the cache.
  assert_eq!(fx.cached("u1").unwrap_or_default().len(), 0);

  fx.gateway.resume(GatewayOp::Create);
  let created = task.await.unwrap().unwrap();
  assert_eq!(ids(&fx.store.current_records()), vec![created.id]);
}

#[tokio::test]
async fn test_forced_load_during_committed_create_keeps_one_copy() {
  let fx = fixture();
  fx.store.load(false).await.unwrap();
  fx.gateway.hold_reply(GatewayOp::Create);

  let task = {
    let store = Arc::clone(&fx.store);
    tokio::spawn(async move { store.create(payload(json!({"name": "Rex"}))).await })
  };
  until(|| fx.gateway.records("u1").len() == 1).await;

  // The server already has srv-1 while the temporary record is still in flight.
  fx.store.load(true).await.unwrap();
  assert_eq!(fx.store.current_records().len(), 2);

  fx.gateway.resume(GatewayOp::Create);
  let created = task.await.unwrap().unwrap();
  assert_eq!(created.id, "srv-1");

  let records = fx.store.current_records();
  assert_eq!(ids(&records), vec!["srv-1"]);
  assert_eq!(records, fx.gateway.records("u1"));
  assert_eq!(ids(&fx.cached("u1").unwrap()), vec!["srv-1"]);
}

#[tokio::test]
async fn test_create_before_any_load_fills_cache() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"name": "Max"}))]);

  let created = fx.store.create(payload(json!({"name": "Rex"}))).await.unwrap();
  assert_eq!(created.id, "srv-1");

  let key = CollectionKey::new("records", "u1").cache_hash();
  let cached = fx.cache.get(&key, "u1").unwrap();
  assert_eq!(ids(&cached), vec!["srv-1", "p1"]);
  assert_eq!(ids(&fx.store.current_records()), vec!["srv-1", "p1"]);
}

#[tokio::test]
async fn test_create_before_any_load_keeps_offline_creates() {
  let fx = fixture();
  fx.go_offline();
  fx.store.create(payload(json!({"name": "Max"}))).await.unwrap_err();
  fx.go_online().await;

  fx.store.create(payload(json!({"name": "Rex"}))).await.unwrap();
  let records = fx.store.current_records();
  assert_eq!(records.len(), 2);
  assert!(records[0].is_temporary());
  assert_eq!(records[0].status, RecordStatus::PendingCreate);
  assert_eq!(ids(&fx.cached("u1").unwrap()), vec!["srv-1"]);
}

#[tokio::test]
async fn test_create_failure_removes_temp_record() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"name": "Max"}))]);
  fx.store.load(false).await.unwrap();
  let mut changes = fx.store.changes();

  fx.gateway
    .fail_next(GatewayOp::Create, GatewayError::from_raw("23505", "duplicate"));
  let err = fx.store.create(payload(json!({"name": "Max"}))).await.unwrap_err();
  assert!(matches!(
    err,
    SyncError::TerminalRemote { code: ErrorCode::Conflict, .. }
  ));

  assert_eq!(ids(&fx.store.current_records()), vec!["p1"]);
  assert_eq!(ids(&fx.cached("u1").unwrap()), vec!["p1"]);
  assert_eq!(fx.store.last_error(), Some(err));

  let first = changes.try_recv().unwrap();
  let second = changes.try_recv().unwrap();
  assert!(matches!(first, RecordEvent::Changed { status: RecordStatus::PendingCreate, .. }));
  assert!(matches!(second, RecordEvent::Changed { status: RecordStatus::Reverted, .. }));
}

#[tokio::test]
async fn test_create_without_capability_is_forbidden() {
  let fx = Fixture::new(StoreOptions {
    capabilities: Capabilities::read_only(),
    ..Default::default()
  });
  let err = fx.store.create(payload(json!({"name": "Rex"}))).await.unwrap_err();
  assert_eq!(err.code(), Some(ErrorCode::Forbidden));
  assert_eq!(fx.gateway.calls(GatewayOp::Create), 0);
  assert!(fx.store.current_records().is_empty());
}

// ============================================================================
// Update and delete
// ============================================================================

#[tokio::test]
async fn test_update_failure_restores_previous_version() {
  let fx = fixture();
  let original = pet("p1", json!({"name": "Max", "age": 3}));
  fx.gateway.seed([original.clone()]);
  fx.store.load(false).await.unwrap();

  fx.gateway
    .fail_next(GatewayOp::Update, GatewayError::from_raw("422", "age out of range"));
  let err = fx.store.update("p1", payload(json!({"age": -1}))).await.unwrap_err();
  assert_eq!(err.code(), Some(ErrorCode::Validation));

  assert_eq!(fx.store.record("p1"), Some(original));
  assert_eq!(fx.store.error_log().len(), 1);
}

#[tokio::test]
async fn test_error_log_by_operation() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"name": "Max"}))]);
  fx.store.load(false).await.unwrap();
  let before = chrono::Utc::now();

  fx.gateway
    .fail_next(GatewayOp::Update, GatewayError::from_raw("422", "bad age"));
  fx.store.update("p1", payload(json!({"age": -1}))).await.unwrap_err();
  fx.store.delete("nope").await.unwrap_err();

  let log = fx.store.error_log();
  assert_eq!(log.len(), 2);
  assert_eq!(log[0].operation, "delete");
  assert_eq!(log[1].operation, "update");
  assert!(log.iter().all(|e| e.at >= before));

  let updates = fx.store.errors_for("update");
  assert_eq!(updates.len(), 1);
  assert_eq!(updates[0].error.code(), Some(ErrorCode::Validation));
  assert!(fx.store.errors_for("search").is_empty());

  fx.store.clear_error_log();
  assert!(fx.store.error_log().is_empty());
  // The latest error stays until cleared separately.
  assert!(fx.store.last_error().is_some());
}

#[tokio::test]
async fn test_update_merges_fields() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"name": "Max", "age": 3}))]);
  fx.store.load(false).await.unwrap();

  let updated = fx.store.update("p1", payload(json!({"age": 4}))).await.unwrap();
  assert_eq!(updated.payload["name"], "Max");
  assert_eq!(updated.payload["age"], 4);
  assert_eq!(fx.cached("u1").unwrap()[0].payload["age"], 4);
}

#[tokio::test]
async fn test_update_unknown_record() {
  let fx = fixture();
  fx.store.load(false).await.unwrap();
  let err = fx.store.update("nope", Payload::new()).await.unwrap_err();
  assert_eq!(err, SyncError::UnknownRecord { id: "nope".into() });
  assert_eq!(fx.gateway.calls(GatewayOp::Update), 0);
}

#[tokio::test]
async fn test_delete_failure_restores_position() {
  let fx = fixture();
  fx.gateway.seed([
    pet("p1", json!({"name": "Max"})),
    pet("p2", json!({"name": "Luna"})),
    pet("p3", json!({"name": "Rex"})),
  ]);
  fx.store.load(false).await.unwrap();

  fx.gateway
    .fail_next(GatewayOp::Delete, GatewayError::from_raw("403", "not yours"));
  assert!(fx.store.delete("p2").await.is_err());

  assert_eq!(ids(&fx.store.current_records()), vec!["p1", "p2", "p3"]);
  assert_eq!(fx.store.record("p2").unwrap().status, RecordStatus::Confirmed);
}

#[tokio::test]
async fn test_delete_hides_record_until_confirmed() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"name": "Max"}))]);
  fx.store.load(false).await.unwrap();
  fx.gateway.hold(GatewayOp::Delete);

  let task = {
    let store = Arc::clone(&fx.store);
    tokio::spawn(async move { store.delete("p1").await })
  };
  until(|| fx.gateway.calls(GatewayOp::Delete) == 1).await;

  assert!(fx.store.current_records().is_empty());
  assert_eq!(fx.store.record("p1").unwrap().status, RecordStatus::PendingDelete);
  // The cache still holds the confirmed version.
  assert_eq!(ids(&fx.cached("u1").unwrap()), vec!["p1"]);

  fx.gateway.resume(GatewayOp::Delete);
  task.await.unwrap().unwrap();
  assert_eq!(fx.store.record("p1"), None);
  assert!(fx.cached("u1").unwrap().is_empty());
}

#[tokio::test]
async fn test_queued_updates_apply_in_order() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"age": 3}))]);
  fx.store.load(false).await.unwrap();
  fx.gateway.hold(GatewayOp::Update);
  fx.gateway
    .fail_next(GatewayOp::Update, GatewayError::from_raw("409", "conflict"));

  let first = {
    let store = Arc::clone(&fx.store);
    tokio::spawn(async move { store.update("p1", payload(json!({"age": 4}))).await })
  };
  until(|| fx.gateway.calls(GatewayOp::Update) == 1).await;

  let second = {
    let store = Arc::clone(&fx.store);
    tokio::spawn(async move { store.update("p1", payload(json!({"age": 5}))).await })
  };
  for _ in 0..10 {
    tokio::task::yield_now().await;
  }
  // The second update waits for the first to settle.
  assert_eq!(fx.gateway.calls(GatewayOp::Update), 1);

  fx.gateway.resume(GatewayOp::Update);
  assert!(first.await.unwrap().is_err());
  let updated = second.await.unwrap().unwrap();

  assert_eq!(updated.payload["age"], 5);
  assert_eq!(fx.store.record("p1").unwrap().payload["age"], 5);
  assert_eq!(fx.gateway.records("u1")[0].payload["age"], 5);
}

#[tokio::test]
async fn test_update_on_temp_id_lands_on_server_id() {
  let fx = fixture();
  fx.store.load(false).await.unwrap();
  fx.gateway.hold(GatewayOp::Create);

  let create = {
    let store = Arc::clone(&fx.store);
    tokio::spawn(async move { store.create(payload(json!({"name": "Rex"}))).await })
  };
  until(|| fx.gateway.calls(GatewayOp::Create) == 1).await;
  let temp_id = fx.store.current_records()[0].id.clone();

  let update = {
    let store = Arc::clone(&fx.store);
    tokio::spawn(async move { store.update(&temp_id, payload(json!({"age": 2}))).await })
  };
  // Let the update queue behind the create.
  for _ in 0..10 {
    tokio::task::yield_now().await;
  }
  fx.gateway.resume(GatewayOp::Create);

  let created = create.await.unwrap().unwrap();
  let updated = update.await.unwrap().unwrap();
  assert_eq!(created.id, "srv-1");
  assert_eq!(updated.id, "srv-1");
  assert_eq!(fx.gateway.calls(GatewayOp::Update), 1);
  assert_eq!(fx.gateway.records("u1")[0].payload["age"], 2);
  assert_eq!(ids(&fx.store.current_records()), vec!["srv-1"]);
  assert_eq!(fx.store.locks.alias_count(), 0);
  assert_eq!(fx.store.locks.len(), 0);
}

#[tokio::test]
async fn test_session_reset_forgets_temp_ids() {
  let fx = fixture();
  fx.store.load(false).await.unwrap();
  fx.gateway.hold(GatewayOp::Create);

  let create = {
    let store = Arc::clone(&fx.store);
    tokio::spawn(async move { store.create(payload(json!({"name": "Rex"}))).await })
  };
  until(|| fx.gateway.calls(GatewayOp::Create) == 1).await;
  let temp_id = fx.store.current_records()[0].id.clone();

  fx.store.on_session_invalidated("u1");
  fx.gateway.resume(GatewayOp::Create);
  create.await.unwrap().unwrap();

  assert_eq!(fx.store.locks.alias_count(), 0);
  assert_eq!(fx.store.locks.resolve(&temp_id), temp_id);
  assert!(fx.store.current_records().is_empty());
}

// ============================================================================
// Offline behaviour
// ============================================================================

#[tokio::test]
async fn test_offline_update_stays_pending_until_refresh() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"name": "Max", "age": 3}))]);
  fx.store.load(false).await.unwrap();
  fx.go_offline();

  let err = fx.store.update("p1", payload(json!({"age": 5}))).await.unwrap_err();
  assert!(matches!(err, SyncError::Connectivity { .. }));
  assert_eq!(fx.gateway.calls(GatewayOp::Update), 0);

  let local = fx.store.record("p1").unwrap();
  assert_eq!(local.status, RecordStatus::PendingUpdate);
  assert_eq!(local.payload["age"], 5);
  // The cache keeps the confirmed version.
  assert_eq!(fx.cached("u1").unwrap()[0].payload["age"], 3);

  fx.go_online().await;
  fx.store.load(true).await.unwrap();
  let refreshed = fx.store.record("p1").unwrap();
  assert_eq!(refreshed.status, RecordStatus::Confirmed);
  assert_eq!(refreshed.payload["age"], 3);
}

#[tokio::test]
async fn test_online_update_carries_earlier_offline_change() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"name": "Max", "age": 3}))]);
  fx.store.load(false).await.unwrap();

  fx.go_offline();
  fx.store.update("p1", payload(json!({"age": 5}))).await.unwrap_err();
  fx.go_online().await;

  let updated = fx.store.update("p1", payload(json!({"name": "Rex"}))).await.unwrap();
  assert_eq!(updated.status, RecordStatus::Confirmed);
  assert_eq!(updated.payload["age"], 5);
  assert_eq!(updated.payload["name"], "Rex");

  let server = &fx.gateway.records("u1")[0];
  assert_eq!(server.payload["age"], 5);
  assert_eq!(server.payload["name"], "Rex");
  assert_eq!(fx.cached("u1").unwrap()[0].payload["age"], 5);
}

#[tokio::test]
async fn test_offline_load_serves_cache_without_gateway() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"name": "Max"}))]);
  fx.store.load(false).await.unwrap();
  fx.go_offline();

  let result = fx.store.load(true).await.unwrap();
  assert_eq!(result.source, CacheSource::Offline);
  assert_eq!(ids(&result.data), vec!["p1"]);
  assert!(result.cached_at.is_some());
  assert_eq!(fx.gateway.calls(GatewayOp::FetchAll), 1);
}

#[tokio::test]
async fn test_offline_load_without_cache_is_a_miss() {
  let fx = fixture();
  fx.go_offline();
  assert_eq!(fx.store.load(false).await.unwrap_err(), SyncError::CacheMiss);
  assert_eq!(fx.gateway.calls(GatewayOp::FetchAll), 0);
}

#[tokio::test]
async fn test_fresh_cache_skips_gateway() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"name": "Max"}))]);
  assert_eq!(fx.store.load(false).await.unwrap().source, CacheSource::Network);

  let again = fx.store.load(false).await.unwrap();
  assert_eq!(again.source, CacheSource::CacheFresh);
  assert_eq!(fx.gateway.calls(GatewayOp::FetchAll), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_falls_back_to_stale_cache() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"name": "Max"}))]);
  fx.store.load(false).await.unwrap();

  for _ in 0..3 {
    fx.gateway
      .fail_next(GatewayOp::FetchAll, GatewayError::from_raw("503", "unavailable"));
  }
  let result = fx.store.load(true).await.unwrap();
  assert_eq!(result.source, CacheSource::CacheStale);
  assert_eq!(ids(&result.data), vec!["p1"]);
  assert_eq!(fx.gateway.calls(GatewayOp::FetchAll), 4);
  assert!(matches!(
    fx.store.last_error(),
    Some(SyncError::TransientRemote { attempts: 3, .. })
  ));
}

#[tokio::test]
async fn test_terminal_load_error_makes_one_call() {
  let fx = fixture();
  fx.gateway
    .fail_next(GatewayOp::FetchAll, GatewayError::from_raw("401", "expired"));
  let err = fx.store.load(false).await.unwrap_err();
  assert_eq!(err.code(), Some(ErrorCode::Unauthorized));
  assert_eq!(fx.gateway.calls(GatewayOp::FetchAll), 1);
  assert!(!fx.store.is_loading());
}

#[tokio::test]
async fn test_forced_load_keeps_in_flight_mutation() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"age": 3}))]);
  fx.store.load(false).await.unwrap();
  fx.gateway.hold(GatewayOp::Update);

  let task = {
    let store = Arc::clone(&fx.store);
    tokio::spawn(async move { store.update("p1", payload(json!({"age": 9}))).await })
  };
  until(|| fx.gateway.calls(GatewayOp::Update) == 1).await;

  fx.store.load(true).await.unwrap();
  let local = fx.store.record("p1").unwrap();
  assert_eq!(local.status, RecordStatus::PendingUpdate);
  assert_eq!(local.payload["age"], 9);

  fx.gateway.resume(GatewayOp::Update);
  task.await.unwrap().unwrap();
  fx.store.load(true).await.unwrap();
  assert_eq!(fx.store.current_records(), fx.gateway.records("u1"));
}

// ============================================================================
// Search and statistics
// ============================================================================

#[tokio::test]
async fn test_search_online_asks_gateway() {
  let fx = fixture();
  fx.gateway.seed([
    pet("p1", json!({"name": "Max"})),
    pet("p2", json!({"name": "Luna"})),
  ]);
  fx.store.load(false).await.unwrap();

  let found = fx.store.search("max").await.unwrap();
  assert_eq!(ids(&found.records), vec!["p1"]);
  assert!(!found.partial);
  assert_eq!(fx.gateway.calls(GatewayOp::Search), 1);

  let all = fx.store.search("  ").await.unwrap();
  assert_eq!(all.records.len(), 2);
  assert_eq!(fx.gateway.calls(GatewayOp::Search), 1);
}

#[tokio::test]
async fn test_search_offline_is_partial() {
  let fx = fixture();
  fx.gateway.seed([
    pet("p1", json!({"name": "Max"})),
    pet("p2", json!({"name": "Luna"})),
  ]);
  fx.store.load(false).await.unwrap();
  fx.go_offline();

  let found = fx.store.search("LU").await.unwrap();
  assert_eq!(ids(&found.records), vec!["p2"]);
  assert!(found.partial);
  assert_eq!(fx.gateway.calls(GatewayOp::Search), 0);
}

#[tokio::test]
async fn test_search_pending_creates_follow_policy() {
  for (policy, expected) in [
    (PendingCreatesInSearch::Exclude, 1),
    (PendingCreatesInSearch::Include, 2),
  ] {
    let fx = Fixture::new(StoreOptions {
      pending_creates_in_search: policy,
      ..Default::default()
    });
    fx.gateway.seed([pet("p1", json!({"name": "Max"}))]);
    fx.store.load(false).await.unwrap();
    fx.go_offline();
    assert!(fx
      .store
      .create(payload(json!({"name": "Max junior"})))
      .await
      .is_err());

    let found = fx.store.search("max").await.unwrap();
    assert_eq!(found.records.len(), expected, "{:?}", policy);
  }
}

#[tokio::test]
async fn test_statistics_online_and_offline() {
  let fx = fixture();
  fx.gateway.seed([
    pet("p1", json!({"type": "dog"})),
    pet("p2", json!({"type": "cat"})),
  ]);
  fx.store.load(false).await.unwrap();

  let online = fx.store.statistics().await.unwrap();
  assert_eq!(online.completeness, Completeness::Complete);

  fx.go_offline();
  let offline = fx.store.statistics().await.unwrap();
  assert_eq!(offline.total, 2);
  assert!(offline.is_partial());
  assert_eq!(offline.recent, None);
  assert_eq!(offline.breakdown["type"]["dog"], 1);
}

#[tokio::test]
async fn test_offline_statistics_without_cache_is_a_miss() {
  let fx = fixture();
  fx.go_offline();
  assert_eq!(fx.store.statistics().await.unwrap_err(), SyncError::CacheMiss);
}

// ============================================================================
// Refresh
// ============================================================================

#[tokio::test]
async fn test_refresh_record_takes_server_version() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"age": 3}))]);
  fx.store.load(false).await.unwrap();

  fx.gateway
    .update("p1", &payload(json!({"age": 7})), "u1")
    .await
    .unwrap();
  let refreshed = fx.store.refresh_record("p1").await.unwrap();
  assert_eq!(refreshed.payload["age"], 7);
  assert_eq!(fx.store.record("p1").unwrap().payload["age"], 7);
}

#[tokio::test]
async fn test_refresh_missing_record_removes_it() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"age": 3}))]);
  fx.store.load(false).await.unwrap();
  fx.gateway.delete("p1", "u1").await.unwrap();

  let err = fx.store.refresh_record("p1").await.unwrap_err();
  assert_eq!(err.code(), Some(ErrorCode::NotFound));
  assert_eq!(fx.store.record("p1"), None);
}

// ============================================================================
// Session
// ============================================================================

#[tokio::test]
async fn test_session_invalidation_clears_and_blocks() {
  let fx = fixture();
  fx.gateway.seed([pet("p1", json!({"name": "Max"}))]);
  fx.store.load(false).await.unwrap();
  let watcher = fx.store.spawn_session_watch();

  fx.session.invalidate();
  until(|| fx.store.is_blocked()).await;

  assert!(fx.store.current_records().is_empty());
  assert_eq!(fx.cached("u1"), None);
  assert_eq!(fx.store.load(false).await.unwrap_err(), SyncError::SessionInvalid);
  assert_eq!(fx.gateway.calls(GatewayOp::FetchAll), 1);

  fx.session.sign_in("u1");
  fx.store.load(false).await.unwrap();
  assert!(!fx.store.is_blocked());
  assert_eq!(ids(&fx.store.current_records()), vec!["p1"]);
  watcher.abort();
}

#[tokio::test]
async fn test_owner_switch_drops_previous_owner_data() {
  let fx = fixture();
  fx.gateway.seed([
    pet("p1", json!({"name": "Max"})),
    Record::new("q1", "u2", payload(json!({"name": "Kitty"}))),
  ]);
  fx.store.load(false).await.unwrap();
  assert!(fx.cached("u1").is_some());

  fx.session.sign_in("u2");
  fx.store.load(false).await.unwrap();
  assert_eq!(ids(&fx.store.current_records()), vec!["q1"]);
  assert_eq!(fx.cached("u1"), None);
}

#[tokio::test]
async fn test_operations_need_a_session() {
  let fx = fixture();
  fx.session.invalidate();
  assert_eq!(
    fx.store.create(Payload::new()).await.unwrap_err(),
    SyncError::SessionInvalid
  );
  assert_eq!(fx.gateway.calls(GatewayOp::Create), 0);
}
