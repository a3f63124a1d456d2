//! Resolved state, the current value of each entity in a version.
//!
//! State is never stored as a primary record. It is derived from the commit
//! graph and the change store, and cached per schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::change::EntityKey;

/// `file_id` used for entities that do not belong to a user file.
pub const OWN_ENTITY_FILE_ID: &str = "quire";

/// `plugin_key` used for entities written directly through the engine.
pub const OWN_ENTITY_PLUGIN_KEY: &str = "quire_own_entity";

/// One live entity as seen from `version_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRow {
  pub entity_id:                 String,
  pub schema_key:                String,
  pub file_id:                   String,
  pub version_id:                String,
  pub plugin_key:                String,
  pub snapshot_content:          serde_json::Value,
  pub schema_version:            String,
  pub created_at:                DateTime<Utc>,
  pub updated_at:                DateTime<Utc>,
  /// `None` for untracked rows and synthesized bootstrap rows.
  pub change_id:                 Option<String>,
  pub commit_id:                 Option<String>,
  /// Set when the row is visible only through version inheritance.
  pub inherited_from_version_id: Option<String>,
  pub untracked:                 bool,
}

impl StateRow {
  pub fn entity_key(&self) -> EntityKey {
    EntityKey {
      entity_id:  self.entity_id.clone(),
      schema_key: self.schema_key.clone(),
      file_id:    self.file_id.clone(),
    }
  }
}

/// Input to a state write. `entity_id` is computed from the schema's primary
/// key when `None`.
#[derive(Debug, Clone)]
pub struct NewState {
  pub entity_id:        Option<String>,
  pub schema_key:       String,
  /// Defaults to the latest registered version of `schema_key`.
  pub schema_version:   Option<String>,
  pub file_id:          String,
  pub plugin_key:       String,
  pub snapshot_content: serde_json::Value,
  /// Write to this version instead of the active one.
  pub version_id:       Option<String>,
  pub metadata:         Option<serde_json::Value>,
  /// Untracked writes never produce changes or commits.
  pub untracked:        bool,
}

impl NewState {
  /// A tracked write of an engine-owned entity into the active version.
  pub fn new(
    schema_key: impl Into<String>,
    snapshot_content: serde_json::Value,
  ) -> Self {
    Self {
      entity_id: None,
      schema_key: schema_key.into(),
      schema_version: None,
      file_id: OWN_ENTITY_FILE_ID.to_owned(),
      plugin_key: OWN_ENTITY_PLUGIN_KEY.to_owned(),
      snapshot_content,
      version_id: None,
      metadata: None,
      untracked: false,
    }
  }

  pub fn in_version(mut self, version_id: impl Into<String>) -> Self {
    self.version_id = Some(version_id.into());
    self
  }

  pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
    self.entity_id = Some(entity_id.into());
    self
  }

  pub fn untracked(mut self) -> Self {
    self.untracked = true;
    self
  }
}

/// Address of one entity in one version; the key of the state cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateAddress {
  pub entity_id:  String,
  pub schema_key: String,
  pub file_id:    String,
  pub version_id: String,
}

impl StateAddress {
  pub fn new(
    entity_id: impl Into<String>,
    schema_key: impl Into<String>,
    file_id: impl Into<String>,
    version_id: impl Into<String>,
  ) -> Self {
    Self {
      entity_id:  entity_id.into(),
      schema_key: schema_key.into(),
      file_id:    file_id.into(),
      version_id: version_id.into(),
    }
  }

  /// An engine-owned entity (`file_id` = [`OWN_ENTITY_FILE_ID`]).
  pub fn own(
    entity_id: impl Into<String>,
    schema_key: impl Into<String>,
    version_id: impl Into<String>,
  ) -> Self {
    Self::new(entity_id, schema_key, OWN_ENTITY_FILE_ID, version_id)
  }
}
