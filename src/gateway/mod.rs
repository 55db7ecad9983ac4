//! Remote data gateway: the black-box CRUD and search API behind the store.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::GatewayError;
use crate::record::{Payload, Record};

pub use memory::{GatewayOp, MemoryGateway};

/// CRUD + search access to the remote store.
///
/// Implementations own the wire format and their own timeouts, and report failures as
/// classified [`GatewayError`]s (see [`ErrorCode::from_raw`](crate::error::ErrorCode::from_raw)).
#[async_trait]
pub trait RemoteGateway: Send + Sync {
  async fn fetch_all(&self, owner_id: &str) -> Result<Vec<Record>, GatewayError>;

  async fn fetch_one(&self, id: &str) -> Result<Record, GatewayError>;

  async fn search(&self, term: &str, owner_id: &str) -> Result<Vec<Record>, GatewayError>;

  async fn create(&self, payload: &Payload, owner_id: &str) -> Result<Record, GatewayError>;

  /// Apply `payload` over the stored fields and return the full record.
  async fn update(
    &self,
    id: &str,
    payload: &Payload,
    owner_id: &str,
  ) -> Result<Record, GatewayError>;

  async fn delete(&self, id: &str, owner_id: &str) -> Result<(), GatewayError>;

  async fn statistics(&self, owner_id: &str) -> Result<Statistics, GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
  Complete,
  /// Computed from a local snapshot that may not hold every record.
  PossiblyPartial,
}

/// Aggregate counts over an owner's collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
  pub total: u64,
  /// field -> value -> count
  pub breakdown: BTreeMap<String, BTreeMap<String, u64>>,
  /// Records created recently. Only the server knows this.
  pub recent: Option<u64>,
  pub completeness: Completeness,
}

impl Statistics {
  /// Count `records` grouped by each of `fields`. Missing or non-string values count as "unknown".
  pub fn tally<'a>(records: impl IntoIterator<Item = &'a Record>, fields: &[String]) -> Self {
    let mut total = 0;
    let mut breakdown: BTreeMap<String, BTreeMap<String, u64>> = fields
      .iter()
      .map(|f| (f.clone(), BTreeMap::new()))
      .collect();

    for record in records {
      total += 1;
      for field in fields {
        let value = record.field_str(field).unwrap_or("unknown").to_string();
        if let Some(counts) = breakdown.get_mut(field) {
          *counts.entry(value).or_insert(0) += 1;
        }
      }
    }

    Self {
      total,
      breakdown,
      recent: None,
      completeness: Completeness::PossiblyPartial,
    }
  }

  pub fn is_partial(&self) -> bool {
    self.completeness == Completeness::PossiblyPartial
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::payload;
  use serde_json::json;

  #[test]
  fn test_tally_groups_by_field() {
    let records = vec![
      Record::new("1", "u", payload(json!({"type": "dog", "status": "healthy"}))),
      Record::new("2", "u", payload(json!({"type": "dog", "status": "lost"}))),
      Record::new("3", "u", payload(json!({"type": "cat"}))),
    ];
    let stats = Statistics::tally(&records, &["type".to_string(), "status".to_string()]);

    assert_eq!(stats.total, 3);
    assert_eq!(stats.breakdown["type"]["dog"], 2);
    assert_eq!(stats.breakdown["status"]["unknown"], 1);
    assert!(stats.is_partial());
    assert_eq!(stats.recent, None);
  }
}
