//! Append-only storage of snapshots and changes.

use chrono::{DateTime, Utc};
use quire_core::change::{
  Change, NO_CONTENT_SNAPSHOT_ID, NewChange, Snapshot,
};
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::{
  Error, Result,
  encode::{CHANGE_COLUMNS, RawChange, decode_json_opt, encode_dt},
};

/// Store `content` under its content address. Inserting an existing snapshot
/// is a no-op.
pub fn insert_snapshot(conn: &Connection, snapshot: &Snapshot) -> Result<()> {
  let content = snapshot.content.as_ref().map(|c| c.to_string());
  conn.execute(
    "INSERT OR IGNORE INTO snapshot (id, content) VALUES (?1, ?2)",
    params![snapshot.id, content],
  )?;
  Ok(())
}

/// Persist a snapshot (unless tombstoned) and a change referencing it.
///
/// Runs on the caller's transaction; the pair is never visible half-written.
pub fn record_change(
  conn: &Connection,
  id: String,
  new: NewChange,
  created_at: DateTime<Utc>,
) -> Result<Change> {
  if change_exists(conn, &id)? {
    return Err(Error::ChangeAlreadyExists(id));
  }

  let snapshot = match new.snapshot_content {
    Some(content) => Snapshot::new(content),
    None => Snapshot::tombstone(),
  };
  if !snapshot.is_tombstone() {
    insert_snapshot(conn, &snapshot)?;
  }

  let change = Change {
    id,
    entity_id: new.entity_id,
    schema_key: new.schema_key,
    schema_version: new.schema_version,
    file_id: new.file_id,
    plugin_key: new.plugin_key,
    snapshot_id: snapshot.id,
    metadata: new.metadata,
    created_at,
  };

  conn.execute(
    &format!(
      "INSERT INTO change ({CHANGE_COLUMNS})
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
    ),
    params![
      change.id,
      change.entity_id,
      change.schema_key,
      change.schema_version,
      change.file_id,
      change.plugin_key,
      change.snapshot_id,
      change.metadata.as_ref().map(|m| m.to_string()),
      encode_dt(change.created_at),
    ],
  )?;

  tracing::debug!(
    change_id = %change.id,
    entity_id = %change.entity_id,
    schema_key = %change.schema_key,
    tombstone = change.is_tombstone(),
    "recorded change"
  );
  Ok(change)
}

pub fn change_exists(conn: &Connection, id: &str) -> Result<bool> {
  Ok(
    conn
      .query_row("SELECT 1 FROM change WHERE id = ?1", [id], |_| Ok(()))
      .optional()?
      .is_some(),
  )
}

pub fn change(conn: &Connection, id: &str) -> Result<Option<Change>> {
  conn
    .query_row(
      &format!("SELECT {CHANGE_COLUMNS} FROM change WHERE id = ?1"),
      [id],
      |r| RawChange::from_row(r, 0),
    )
    .optional()?
    .map(RawChange::into_change)
    .transpose()
}

pub fn require_change(conn: &Connection, id: &str) -> Result<Change> {
  change(conn, id)?.ok_or_else(|| Error::ChangeNotFound(id.to_owned()))
}

/// Content of a snapshot; `None` for the tombstone or an unknown id.
pub fn snapshot_content(
  conn: &Connection,
  snapshot_id: &str,
) -> Result<Option<serde_json::Value>> {
  if snapshot_id == NO_CONTENT_SNAPSHOT_ID {
    return Ok(None);
  }
  let raw: Option<Option<String>> = conn
    .query_row(
      "SELECT content FROM snapshot WHERE id = ?1",
      [snapshot_id],
      |r| r.get(0),
    )
    .optional()?;
  decode_json_opt(raw.flatten())
}

/// Delete snapshots no change references. The tombstone is never deleted.
pub fn gc_snapshots(conn: &Connection) -> Result<usize> {
  let removed = conn.execute(
    "DELETE FROM snapshot
     WHERE id != ?1
       AND NOT EXISTS (SELECT 1 FROM change c WHERE c.snapshot_id = snapshot.id)",
    [NO_CONTENT_SNAPSHOT_ID],
  )?;
  tracing::info!(removed, "snapshot garbage collection");
  Ok(removed)
}
