//! Records held in the working set.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Arbitrary payload fields of a record.
pub type Payload = Map<String, Value>;

const TEMP_PREFIX: &str = "temp-";

/// Synchronization status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStatus {
  Confirmed,
  PendingCreate,
  PendingUpdate,
  PendingDelete,
  /// Reported on rollback; never stored in the working set.
  Reverted,
}

impl RecordStatus {
  pub fn is_pending(&self) -> bool {
    matches!(
      self,
      Self::PendingCreate | Self::PendingUpdate | Self::PendingDelete
    )
  }
}

/// An owned record, either confirmed by the server or a local optimistic write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: String,
  pub owner_id: String,
  #[serde(default)]
  pub payload: Payload,
  #[serde(default = "confirmed")]
  pub status: RecordStatus,
}

fn confirmed() -> RecordStatus {
  RecordStatus::Confirmed
}

impl Record {
  pub fn new(id: impl Into<String>, owner_id: impl Into<String>, payload: Payload) -> Self {
    Self {
      id: id.into(),
      owner_id: owner_id.into(),
      payload,
      status: RecordStatus::Confirmed,
    }
  }

  pub fn with_status(mut self, status: RecordStatus) -> Self {
    self.status = status;
    self
  }

  /// Whether the id was allocated locally and never confirmed.
  pub fn is_temporary(&self) -> bool {
    is_temporary_id(&self.id)
  }

  /// Overwrite the named fields, leaving the rest as they are.
  pub fn merge_payload(&mut self, patch: &Payload) {
    for (k, v) in patch {
      self.payload.insert(k.clone(), v.clone());
    }
  }

  /// Fields that are new or differ from `base`.
  pub fn changed_fields(&self, base: &Payload) -> Payload {
    self
      .payload
      .iter()
      .filter(|(k, v)| base.get(*k) != Some(*v))
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect()
  }

  /// String value of a payload field, if it is a string.
  pub fn field_str(&self, field: &str) -> Option<&str> {
    self.payload.get(field).and_then(Value::as_str)
  }
}

pub fn is_temporary_id(id: &str) -> bool {
  id.starts_with(TEMP_PREFIX)
}

/// Allocates unique temporary ids for optimistic creates.
#[derive(Debug, Default)]
pub struct TempIds {
  next: AtomicU64,
}

impl TempIds {
  pub fn next_id(&self) -> String {
    let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{}{}", TEMP_PREFIX, n)
  }
}

/// Build a payload from a JSON object literal. Non-objects produce an empty payload.
pub fn payload(value: Value) -> Payload {
  match value {
    Value::Object(map) => map,
    _ => Payload::new(),
  }
}
