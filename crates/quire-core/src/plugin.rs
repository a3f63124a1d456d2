//! The file-format plugin contract.
//!
//! Files are projections: the engine stores entities, and a plugin turns a
//! batch of entity changes back into file bytes. Plugins are the only place
//! history becomes concrete bytes.

use serde::{Deserialize, Serialize};

use crate::{Result, schema::SchemaDefinition};

/// A file as handed to a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
  pub id:   String,
  pub path: String,
  /// `None` when the file has no rendered bytes yet.
  pub data: Option<Vec<u8>>,
}

/// One entity-level change produced or consumed by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginChange {
  pub entity_id:        String,
  pub schema_key:       String,
  pub schema_version:   String,
  /// `None` means the entity was removed from the file.
  pub snapshot_content: Option<serde_json::Value>,
}

pub trait Plugin: Send + Sync {
  /// Stable identifier recorded as `plugin_key` on every change.
  fn key(&self) -> &str;

  /// Whether this plugin is responsible for a file at `path`.
  fn matches(&self, path: &str) -> bool;

  /// Diff two versions of a file into entity changes.
  ///
  /// `before` is `None` for a newly inserted file. Entities present in
  /// `before` but absent from `after` must be reported with
  /// `snapshot_content: None`.
  fn detect_changes(
    &self,
    before: Option<&FileSnapshot>,
    after: &FileSnapshot,
  ) -> Result<Vec<PluginChange>>;

  /// Produce new file bytes from `file` (its prior bytes, if any) plus
  /// `changes`.
  fn apply_changes(
    &self,
    file: &FileSnapshot,
    changes: &[PluginChange],
  ) -> Result<Vec<u8>>;

  /// Schemas of the entities this plugin emits.
  fn schemas(&self) -> Vec<SchemaDefinition> { Vec::new() }
}
