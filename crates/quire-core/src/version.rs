//! Versions: named, mutable pointers onto the commit graph.

use serde::{Deserialize, Serialize};

/// Fixed id of the version every other version inherits from by default.
pub const GLOBAL_VERSION_ID: &str = "global";

/// Name given to the working version created at bootstrap.
pub const MAIN_VERSION_NAME: &str = "main";

/// A named pointer onto a commit.
///
/// `change_set_id` is the version's latest-pointer set: one element per
/// entity written in this version, tombstones included. Commits onto the
/// version keep it current, and current-state lookups read it instead of
/// walking history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
  pub id:                       String,
  pub name:                     String,
  pub commit_id:                String,
  pub change_set_id:            String,
  pub inherits_from_version_id: Option<String>,
  pub hidden:                   bool,
}

/// Input to version creation.
#[derive(Debug, Clone, Default)]
pub struct NewVersion {
  pub id:                       Option<String>,
  pub name:                     Option<String>,
  /// The version to branch from; defaults to the active version.
  pub parent:                   Option<String>,
  /// Defaults to [`GLOBAL_VERSION_ID`].
  pub inherits_from_version_id: Option<String>,
  pub hidden:                   bool,
}

impl NewVersion {
  pub fn named(name: impl Into<String>) -> Self {
    Self { name: Some(name.into()), ..Self::default() }
  }

  pub fn from_parent(mut self, parent: impl Into<String>) -> Self {
    self.parent = Some(parent.into());
    self
  }
}
