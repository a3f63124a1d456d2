//! Snapshots and changes: the append-only record of every mutation.
//!
//! A snapshot is immutable content addressed by the SHA-256 of its canonical
//! JSON form. A change points an entity at a snapshot; changes are never
//! updated. Deleting an entity records a change that points at the
//! [`NO_CONTENT_SNAPSHOT_ID`] tombstone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sentinel snapshot id referenced by tombstone changes.
pub const NO_CONTENT_SNAPSHOT_ID: &str = "no-content";

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Immutable entity content. `content` is `None` only for the tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
  pub id:      String,
  pub content: Option<serde_json::Value>,
}

impl Snapshot {
  /// Build the content-addressed snapshot for `content`.
  pub fn new(content: serde_json::Value) -> Self {
    Self { id: snapshot_id_for(&content), content: Some(content) }
  }

  pub fn tombstone() -> Self {
    Self { id: NO_CONTENT_SNAPSHOT_ID.to_owned(), content: None }
  }

  pub fn is_tombstone(&self) -> bool { self.id == NO_CONTENT_SNAPSHOT_ID }
}

/// SHA-256 hex digest over the canonical serialisation of `content`.
///
/// `serde_json::Value` objects are backed by a sorted map, so two values that
/// are equal as JSON always serialise to the same bytes.
pub fn snapshot_id_for(content: &serde_json::Value) -> String {
  let mut hasher = Sha256::new();
  hasher.update(content.to_string().as_bytes());
  hex::encode(hasher.finalize())
}

// ─── Change ──────────────────────────────────────────────────────────────────

/// An immutable record that an entity took on a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
  pub id:             String,
  pub entity_id:      String,
  pub schema_key:     String,
  pub schema_version: String,
  pub file_id:        String,
  pub plugin_key:     String,
  pub snapshot_id:    String,
  pub metadata:       Option<serde_json::Value>,
  pub created_at:     DateTime<Utc>,
}

impl Change {
  pub fn is_tombstone(&self) -> bool {
    self.snapshot_id == NO_CONTENT_SNAPSHOT_ID
  }

  /// The `(entity_id, schema_key, file_id)` triple this change writes to.
  pub fn entity_key(&self) -> EntityKey {
    EntityKey {
      entity_id:  self.entity_id.clone(),
      schema_key: self.schema_key.clone(),
      file_id:    self.file_id.clone(),
    }
  }
}

/// Identity of an entity within a version, independent of its content.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntityKey {
  pub entity_id:  String,
  pub schema_key: String,
  pub file_id:    String,
}

// ─── NewChange ───────────────────────────────────────────────────────────────

/// Input to the change store. `created_at` is always assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewChange {
  /// Caller-supplied id; generated when `None`. Reusing an existing id is an
  /// error.
  pub id:               Option<String>,
  pub entity_id:        String,
  pub schema_key:       String,
  pub schema_version:   String,
  pub file_id:          String,
  pub plugin_key:       String,
  /// `None` records a tombstone.
  pub snapshot_content: Option<serde_json::Value>,
  pub metadata:         Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn snapshot_id_ignores_key_order() {
    let a: serde_json::Value =
      serde_json::from_str(r#"{"name":"Peter","age":50}"#).unwrap();
    let b: serde_json::Value =
      serde_json::from_str(r#"{"age":50,"name":"Peter"}"#).unwrap();
    assert_eq!(snapshot_id_for(&a), snapshot_id_for(&b));
  }

  #[test]
  fn snapshot_id_differs_for_different_content() {
    assert_ne!(
      snapshot_id_for(&json!({ "age": 50 })),
      snapshot_id_for(&json!({ "age": 51 }))
    );
  }

  #[test]
  fn tombstone_snapshot_has_no_content() {
    let t = Snapshot::tombstone();
    assert!(t.is_tombstone());
    assert!(t.content.is_none());
    assert!(!Snapshot::new(json!({})).is_tombstone());
  }
}
