use serde::Deserialize;

/// Which mutations the current account may issue.
///
/// Passed in explicitly by whoever knows the account's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Capabilities {
  pub can_create: bool,
  pub can_update: bool,
  pub can_delete: bool,
}

impl Default for Capabilities {
  fn default() -> Self {
    Self::all()
  }
}

impl Capabilities {
  pub fn all() -> Self {
    Self {
      can_create: true,
      can_update: true,
      can_delete: true,
    }
  }

  pub fn read_only() -> Self {
    Self {
      can_create: false,
      can_update: false,
      can_delete: false,
    }
  }
}

/// Whether unconfirmed local creates show up in search results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingCreatesInSearch {
  Include,
  #[default]
  Exclude,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
  /// Collection name, part of the cache key.
  pub collection: String,
  pub capabilities: Capabilities,
  pub pending_creates_in_search: PendingCreatesInSearch,
  /// Payload fields matched by offline search. Empty means every string field.
  pub search_fields: Vec<String>,
  /// Payload fields grouped by offline statistics.
  pub stat_fields: Vec<String>,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      collection: "records".to_string(),
      capabilities: Capabilities::all(),
      pending_creates_in_search: PendingCreatesInSearch::default(),
      search_fields: Vec::new(),
      stat_fields: vec!["status".to_string(), "type".to_string()],
    }
  }
}
