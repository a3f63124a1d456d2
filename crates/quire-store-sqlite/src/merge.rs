//! Version differences, three-way merges and conflict bookkeeping.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use quire_core::{
  change::{Change, EntityKey, snapshot_id_for},
  state::StateRow,
  version::Version,
};
use rusqlite::{OptionalExtension as _, params};
use serde::Serialize;

use crate::{
  Error, Result, change_store,
  encode::{decode_dt, encode_dt},
  graph,
  materialize::{self, ResolveFilter, Resolved},
  txn::WriteTxn,
  version,
};

/// Changes on one entity that two lines of history disagree about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeConflict {
  pub id:         String,
  #[serde(flatten)]
  pub entity_key: EntityKey,
  pub change_ids: Vec<String>,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOutcome {
  /// `None` when the source had nothing the target could take.
  pub commit_id: Option<String>,
  pub applied:   Vec<Change>,
  pub conflicts: Vec<ChangeConflict>,
}

type Leaves = BTreeMap<EntityKey, Resolved>;

impl WriteTxn<'_> {
  /// Changes behind `version_a`'s tracked state that `version_b` does not
  /// hold with the same content.
  pub fn version_change_in_difference(
    &self,
    version_a: &str,
    version_b: &str,
  ) -> Result<Vec<Change>> {
    let theirs: BTreeSet<(EntityKey, String)> = self
      .live(version_b)?
      .into_iter()
      .filter(|row| !row.untracked)
      .map(|row| (row.entity_key(), snapshot_id_for(&row.snapshot_content)))
      .collect();

    let mut changes = Vec::new();
    for row in self.live(version_a)? {
      let Some(change_id) = row.change_id.as_deref() else { continue };
      let key = (row.entity_key(), snapshot_id_for(&row.snapshot_content));
      if !theirs.contains(&key) {
        changes.push(change_store::require_change(self.conn, change_id)?);
      }
    }
    Ok(changes)
  }

  /// Three-way merge of `source` into `target` around their merge base.
  pub fn merge_version(
    &mut self,
    source: &str,
    target: &str,
  ) -> Result<MergeOutcome> {
    let source = version::require_version(self.conn, source)?;
    let target = version::require_version(self.conn, target)?;

    let base = match graph::merge_base(
      self.conn,
      &source.commit_id,
      &target.commit_id,
    )? {
      Some(base) => self.leaves(&base)?,
      None => Leaves::new(),
    };
    let theirs = self.pointers_of(&source)?;
    let ours = self.pointers_of(&target)?;

    let mut applied = Vec::new();
    let mut contested = Vec::new();
    for (key, incoming) in theirs {
      let from_base = snapshot_of(base.get(&key));
      let incoming_snapshot = Some(incoming.change.snapshot_id.as_str());
      if incoming_snapshot == from_base {
        continue;
      }
      let current = ours.get(&key);
      if snapshot_of(current) == incoming_snapshot {
        continue;
      }
      if snapshot_of(current) == from_base {
        applied.push(incoming.change);
      } else {
        let mut change_ids: Vec<String> =
          current.map(|r| r.change.id.clone()).into_iter().collect();
        change_ids.push(incoming.change.id);
        contested.push((key, change_ids));
      }
    }

    let commit_id = if applied.is_empty() {
      None
    } else {
      let committed = self.commit_existing(
        &target.id,
        applied.clone(),
        &[source.commit_id.clone()],
      )?;
      Some(committed.commit_id)
    };

    let mut conflicts = Vec::with_capacity(contested.len());
    for (entity_key, change_ids) in contested {
      conflicts.push(self.insert_conflict(entity_key, change_ids)?);
    }
    if !conflicts.is_empty() {
      let mut pointers = version::conflict_pointers(self.conn, &target.id)?;
      pointers.extend(conflicts.iter().map(|c| c.id.clone()));
      version::update_conflict_pointers(self.conn, &target.id, &pointers)?;
    }

    tracing::info!(
      source = %source.id,
      target = %target.id,
      applied = applied.len(),
      conflicts = conflicts.len(),
      "merged versions"
    );
    Ok(MergeOutcome { commit_id, applied, conflicts })
  }

  /// Conflicts `version_id` currently points at, oldest first.
  pub fn conflicts(&self, version_id: &str) -> Result<Vec<ChangeConflict>> {
    version::require_version(self.conn, version_id)?;
    let mut conflicts = Vec::new();
    for id in version::conflict_pointers(self.conn, version_id)? {
      if let Some(conflict) = self.conflict(&id)? {
        conflicts.push(conflict);
      }
    }
    conflicts.sort_by(|a, b| {
      (a.created_at, &a.id).cmp(&(b.created_at, &b.id))
    });
    Ok(conflicts)
  }

  /// Settle a conflict by committing `change_id` onto `version_id`.
  pub fn resolve_conflict(
    &mut self,
    version_id: &str,
    conflict_id: &str,
    change_id: &str,
  ) -> Result<String> {
    let mut pointers = version::conflict_pointers(self.conn, version_id)?;
    let not_found = || Error::ConflictNotFound(conflict_id.to_owned());
    if !pointers.iter().any(|id| id == conflict_id) {
      return Err(not_found());
    }
    let conflict = self.conflict(conflict_id)?.ok_or_else(not_found)?;

    let change = change_store::require_change(self.conn, change_id)?;
    if change.entity_key() != conflict.entity_key {
      return Err(Error::ChangeNotDirectChildOfConflict {
        change_id:   change.id,
        conflict_id: conflict.id,
      });
    }

    let committed = self.commit_existing(version_id, vec![change], &[])?;
    pointers.retain(|id| id != conflict_id);
    version::update_conflict_pointers(self.conn, version_id, &pointers)?;
    tracing::debug!(version_id, conflict_id, "resolved conflict");
    Ok(committed.commit_id)
  }

  // ── Helpers ──

  fn live(&self, version_id: &str) -> Result<Vec<StateRow>> {
    materialize::resolve_version(
      self.conn,
      version_id,
      &ResolveFilter::default(),
    )
  }

  fn pointers_of(&self, version: &Version) -> Result<Leaves> {
    materialize::resolve_pointers(
      self.conn,
      &version.change_set_id,
      &ResolveFilter::default(),
    )
  }

  fn leaves(&self, commit_id: &str) -> Result<Leaves> {
    materialize::resolve_at_commit(
      self.conn,
      commit_id,
      &ResolveFilter::default(),
    )
  }

  fn insert_conflict(
    &self,
    entity_key: EntityKey,
    change_ids: Vec<String>,
  ) -> Result<ChangeConflict> {
    let conflict = ChangeConflict {
      id: self.new_id()?,
      entity_key,
      change_ids,
      created_at: self.now()?,
    };
    self.conn.execute(
      "INSERT INTO change_conflict
         (id, entity_id, schema_key, file_id, created_at)
       VALUES (?1, ?2, ?3, ?4, ?5)",
      params![
        conflict.id,
        conflict.entity_key.entity_id,
        conflict.entity_key.schema_key,
        conflict.entity_key.file_id,
        encode_dt(conflict.created_at),
      ],
    )?;
    for change_id in &conflict.change_ids {
      self.conn.execute(
        "INSERT OR IGNORE INTO change_conflict_element (conflict_id, change_id)
         VALUES (?1, ?2)",
        params![conflict.id, change_id],
      )?;
    }
    Ok(conflict)
  }

  fn conflict(&self, id: &str) -> Result<Option<ChangeConflict>> {
    let row: Option<(String, String, String, String)> = self
      .conn
      .query_row(
        "SELECT entity_id, schema_key, file_id, created_at
         FROM change_conflict WHERE id = ?1",
        [id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
      )
      .optional()?;
    let Some((entity_id, schema_key, file_id, created_at)) = row else {
      return Ok(None);
    };

    let mut stmt = self.conn.prepare_cached(
      "SELECT change_id FROM change_conflict_element
       WHERE conflict_id = ?1 ORDER BY change_id",
    )?;
    let change_ids = stmt
      .query_map([id], |r| r.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(Some(ChangeConflict {
      id: id.to_owned(),
      entity_key: EntityKey { entity_id, schema_key, file_id },
      change_ids,
      created_at: decode_dt(&created_at)?,
    }))
  }
}

fn snapshot_of(resolved: Option<&Resolved>) -> Option<&str> {
  resolved.map(|r| r.change.snapshot_id.as_str())
}
