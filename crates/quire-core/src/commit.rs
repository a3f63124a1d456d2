//! Commits, commit edges, and change sets.
//!
//! Commits form a DAG through [`CommitEdge`] rows. A commit owns a change set
//! listing the changes it introduced; both are append-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A node in the commit graph.
///
/// `change_ids` and `parent_commit_ids` are derived from the commit's change
/// set and from the edge table respectively; they are never a second source of
/// truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
  pub id:                 String,
  pub change_set_id:      String,
  pub change_ids:         Vec<String>,
  pub parent_commit_ids:  Vec<String>,
  pub author_account_ids: Vec<String>,
  pub meta_change_ids:    Vec<String>,
  pub created_at:         DateTime<Utc>,
}

#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CommitEdge {
  pub parent_id: String,
  pub child_id:  String,
}

/// A pointer from a change set to the current change for one entity.
///
/// Unique per `(change_set_id, entity_id, schema_key, file_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetElement {
  pub change_set_id: String,
  pub change_id:     String,
  pub entity_id:     String,
  pub schema_key:    String,
  pub file_id:       String,
}

/// Options for ancestor / descendant walks.
///
/// By default the walk is exclusive (the start commit is not returned) and
/// unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traversal {
  /// Maximum number of hops from the start commit.
  pub depth:        Option<usize>,
  pub include_self: bool,
}

impl Traversal {
  pub fn depth(depth: usize) -> Self {
    Self { depth: Some(depth), include_self: false }
  }

  pub fn including_self(mut self) -> Self {
    self.include_self = true;
    self
  }
}
