//! In-process gateway with scripted failures.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;

use super::{Completeness, RemoteGateway, Statistics};
use crate::error::{ErrorCode, GatewayError};
use crate::record::{Payload, Record};

/// Gateway operations, for scripting and counting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
  FetchAll,
  FetchOne,
  Search,
  Create,
  Update,
  Delete,
  Statistics,
}

#[derive(Default)]
struct MemoryState {
  /// Newest first.
  records: Vec<Record>,
  next_id: u64,
  failures: HashMap<GatewayOp, VecDeque<GatewayError>>,
  calls: HashMap<GatewayOp, u32>,
  gates: HashMap<GatewayOp, Arc<Semaphore>>,
  /// Passed after a call took effect, before it answers.
  reply_gates: HashMap<GatewayOp, Arc<Semaphore>>,
}

/// A [`RemoteGateway`] backed by a vector.
///
/// Created records get ids `srv-1`, `srv-2`, ... and a `created_at` field. Calls can be made to
/// fail ([`fail_next`](Self::fail_next)), held in flight ([`hold`](Self::hold)) or held after the
/// server applied them ([`hold_reply`](Self::hold_reply)).
pub struct MemoryGateway {
  state: Mutex<MemoryState>,
  stat_fields: Vec<String>,
}

impl Default for MemoryGateway {
  fn default() -> Self {
    Self::new(vec!["status".to_string(), "type".to_string()])
  }
}

impl MemoryGateway {
  pub fn new(stat_fields: Vec<String>) -> Self {
    Self {
      state: Mutex::new(MemoryState::default()),
      stat_fields,
    }
  }

  fn state(&self) -> MutexGuard<'_, MemoryState> {
    self
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Put records on the server as-is.
  pub fn seed(&self, records: impl IntoIterator<Item = Record>) {
    let mut state = self.state();
    for record in records {
      state.records.push(record);
    }
  }

  /// Server-side records of `owner_id`.
  pub fn records(&self, owner_id: &str) -> Vec<Record> {
    self
      .state()
      .records
      .iter()
      .filter(|r| r.owner_id == owner_id)
      .cloned()
      .collect()
  }

  /// Queue `error` as the result of the next `op` call.
  pub fn fail_next(&self, op: GatewayOp, error: GatewayError) {
    self.state().failures.entry(op).or_default().push_back(error);
  }

  pub fn calls(&self, op: GatewayOp) -> u32 {
    self.state().calls.get(&op).copied().unwrap_or(0)
  }

  /// Hold every `op` call in flight until [`release`](Self::release) lets it through.
  pub fn hold(&self, op: GatewayOp) {
    self
      .state()
      .gates
      .entry(op)
      .or_insert_with(|| Arc::new(Semaphore::new(0)));
  }

  /// Let `n` held `op` calls proceed.
  pub fn release(&self, op: GatewayOp, n: usize) {
    if let Some(gate) = self.state().gates.get(&op) {
      gate.add_permits(n);
    }
  }

  /// Apply every `op` call server-side, then hold its answer until [`resume`](Self::resume).
  pub fn hold_reply(&self, op: GatewayOp) {
    self
      .state()
      .reply_gates
      .entry(op)
      .or_insert_with(|| Arc::new(Semaphore::new(0)));
  }

  /// Stop holding `op` calls, letting everything waiting through.
  pub fn resume(&self, op: GatewayOp) {
    let mut state = self.state();
    for gate in [state.gates.remove(&op), state.reply_gates.remove(&op)]
      .into_iter()
      .flatten()
    {
      gate.close();
    }
  }

  /// Count the call, wait at the gate, then take any scripted failure.
  async fn enter(&self, op: GatewayOp) -> Result<(), GatewayError> {
    let gate = {
      let mut state = self.state();
      *state.calls.entry(op).or_insert(0) += 1;
      state.gates.get(&op).cloned()
    };
    if let Some(gate) = gate {
      // A closed gate means the hold was lifted.
      if let Ok(permit) = gate.acquire().await {
        permit.forget();
      }
    }
    match self.state().failures.get_mut(&op).and_then(VecDeque::pop_front) {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  async fn reply(&self, op: GatewayOp) {
    let gate = self.state().reply_gates.get(&op).cloned();
    if let Some(gate) = gate {
      if let Ok(permit) = gate.acquire().await {
        permit.forget();
      }
    }
  }

  fn not_found(id: &str) -> GatewayError {
    GatewayError::new(ErrorCode::NotFound, format!("record {} not found or not owned", id))
  }
}

fn matches_term(record: &Record, term: &str) -> bool {
  let needle = term.to_lowercase();
  record
    .payload
    .values()
    .filter_map(Value::as_str)
    .any(|v| v.to_lowercase().contains(&needle))
}

fn created_since(record: &Record, since: DateTime<Utc>) -> bool {
  record
    .field_str("created_at")
    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    .map(|t| t.with_timezone(&Utc) >= since)
    .unwrap_or(false)
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
  async fn fetch_all(&self, owner_id: &str) -> Result<Vec<Record>, GatewayError> {
    self.enter(GatewayOp::FetchAll).await?;
    Ok(self.records(owner_id))
  }

  async fn fetch_one(&self, id: &str) -> Result<Record, GatewayError> {
    self.enter(GatewayOp::FetchOne).await?;
    self
      .state()
      .records
      .iter()
      .find(|r| r.id == id)
      .cloned()
      .ok_or_else(|| Self::not_found(id))
  }

  async fn search(&self, term: &str, owner_id: &str) -> Result<Vec<Record>, GatewayError> {
    self.enter(GatewayOp::Search).await?;
    let term = term.trim();
    Ok(
      self
        .records(owner_id)
        .into_iter()
        .filter(|r| matches_term(r, term))
        .collect(),
    )
  }

  async fn create(&self, payload: &Payload, owner_id: &str) -> Result<Record, GatewayError> {
    self.enter(GatewayOp::Create).await?;
    let record = {
      let mut state = self.state();
      state.next_id += 1;
      let mut record = Record::new(format!("srv-{}", state.next_id), owner_id, payload.clone());
      record
        .payload
        .insert("created_at".into(), Value::String(Utc::now().to_rfc3339()));
      state.records.insert(0, record.clone());
      record
    };
    self.reply(GatewayOp::Create).await;
    Ok(record)
  }

  async fn update(
    &self,
    id: &str,
    payload: &Payload,
    owner_id: &str,
  ) -> Result<Record, GatewayError> {
    self.enter(GatewayOp::Update).await?;
    let updated = {
      let mut state = self.state();
      let record = state
        .records
        .iter_mut()
        .find(|r| r.id == id && r.owner_id == owner_id)
        .ok_or_else(|| Self::not_found(id))?;
      record.merge_payload(payload);
      record.clone()
    };
    self.reply(GatewayOp::Update).await;
    Ok(updated)
  }

  async fn delete(&self, id: &str, owner_id: &str) -> Result<(), GatewayError> {
    self.enter(GatewayOp::Delete).await?;
    let mut state = self.state();
    let before = state.records.len();
    state
      .records
      .retain(|r| !(r.id == id && r.owner_id == owner_id));
    if state.records.len() == before {
      return Err(Self::not_found(id));
    }
    Ok(())
  }

  async fn statistics(&self, owner_id: &str) -> Result<Statistics, GatewayError> {
    self.enter(GatewayOp::Statistics).await?;
    let records = self.records(owner_id);
    let week_ago = Utc::now() - ChronoDuration::days(7);
    let mut stats = Statistics::tally(&records, &self.stat_fields);
    stats.recent = Some(records.iter().filter(|r| created_since(r, week_ago)).count() as u64);
    stats.completeness = Completeness::Complete;
    Ok(stats)
  }
}
