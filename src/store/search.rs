//! Local matching used when the remote search is unavailable.

use serde_json::Value;

use crate::record::Record;

/// Case-insensitive substring match over `fields` of the payload, or every string field when
/// `fields` is empty.
pub(crate) fn matches(record: &Record, term: &str, fields: &[String]) -> bool {
  let needle = term.trim().to_lowercase();
  if needle.is_empty() {
    return true;
  }
  let hit = |v: &Value| {
    v.as_str()
      .map(|s| s.to_lowercase().contains(&needle))
      .unwrap_or(false)
  };
  if fields.is_empty() {
    record.payload.values().any(hit)
  } else {
    fields
      .iter()
      .filter_map(|f| record.payload.get(f))
      .any(hit)
  }
}
