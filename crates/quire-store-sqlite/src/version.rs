//! Version table access: pointers, inheritance and conflict pointers.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use quire_core::{change::Change, version::Version};
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::{
  Error, Result,
  encode::{RawVersion, VERSION_COLUMNS, encode_dt},
  graph,
};

/// Maximum length of an inheritance chain, the version itself included.
pub const INHERITANCE_DEPTH_LIMIT: usize = 64;

pub fn insert_version(
  conn: &Connection,
  version: &Version,
  created_at: DateTime<Utc>,
) -> Result<()> {
  if version_by_name(conn, &version.name)?.is_some() {
    return Err(Error::VersionExists(version.name.clone()));
  }
  conn.execute(
    &format!(
      "INSERT INTO version ({VERSION_COLUMNS}, created_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
    ),
    params![
      version.id,
      version.name,
      version.commit_id,
      version.change_set_id,
      version.inherits_from_version_id,
      version.hidden,
      encode_dt(created_at),
    ],
  )?;
  Ok(())
}

pub fn version(conn: &Connection, id: &str) -> Result<Option<Version>> {
  Ok(
    conn
      .query_row(
        &format!("SELECT {VERSION_COLUMNS} FROM version WHERE id = ?1"),
        [id],
        RawVersion::from_row,
      )
      .optional()?
      .map(RawVersion::into_version),
  )
}

pub fn require_version(conn: &Connection, id: &str) -> Result<Version> {
  version(conn, id)?.ok_or_else(|| Error::VersionNotFound(id.to_owned()))
}

pub fn version_by_name(
  conn: &Connection,
  name: &str,
) -> Result<Option<Version>> {
  Ok(
    conn
      .query_row(
        &format!("SELECT {VERSION_COLUMNS} FROM version WHERE name = ?1"),
        [name],
        RawVersion::from_row,
      )
      .optional()?
      .map(RawVersion::into_version),
  )
}

pub fn versions(conn: &Connection) -> Result<Vec<Version>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {VERSION_COLUMNS} FROM version ORDER BY created_at, id"
  ))?;
  let rows = stmt
    .query_map([], RawVersion::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows.into_iter().map(RawVersion::into_version).collect())
}

pub fn active_version_id(conn: &Connection) -> Result<String> {
  conn
    .query_row(
      "SELECT version_id FROM active_version WHERE singleton = 0",
      [],
      |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| Error::VersionNotFound("<active>".to_owned()))
}

pub fn set_active(conn: &Connection, version_id: &str) -> Result<()> {
  require_version(conn, version_id)?;
  conn.execute(
    "INSERT INTO active_version (singleton, version_id) VALUES (0, ?1)
     ON CONFLICT (singleton) DO UPDATE SET version_id = excluded.version_id",
    [version_id],
  )?;
  tracing::debug!(version_id, "switched active version");
  Ok(())
}

pub fn set_commit(
  conn: &Connection,
  version_id: &str,
  commit_id: &str,
) -> Result<()> {
  conn.execute(
    "UPDATE version SET commit_id = ?2 WHERE id = ?1",
    params![version_id, commit_id],
  )?;
  Ok(())
}

/// Upsert one latest-pointer per change into the version's pointer set.
/// Applying the same change twice leaves a single element.
pub fn update_pointers(
  conn: &Connection,
  version: &Version,
  changes: &[Change],
) -> Result<()> {
  for change in changes {
    graph::upsert_element(
      conn,
      &version.change_set_id,
      &change.id,
      &change.entity_key(),
    )?;
  }
  tracing::debug!(
    version_id = %version.id,
    count = changes.len(),
    "updated version pointers"
  );
  Ok(())
}

// ─── Inheritance ─────────────────────────────────────────────────────────────

/// `version_id` followed by the versions it inherits from, nearest first.
/// Stops at a cycle or after [`INHERITANCE_DEPTH_LIMIT`] entries.
pub fn inheritance_chain(
  conn: &Connection,
  version_id: &str,
) -> Result<Vec<Version>> {
  let mut chain = Vec::new();
  let mut seen = HashSet::new();
  let mut next = Some(version_id.to_owned());
  while let Some(id) = next.take() {
    if chain.len() >= INHERITANCE_DEPTH_LIMIT || !seen.insert(id.clone()) {
      tracing::warn!(version_id, at = %id, "inheritance chain truncated");
      break;
    }
    let Some(v) = version(conn, &id)? else { break };
    next = v.inherits_from_version_id.clone();
    chain.push(v);
  }
  if chain.is_empty() {
    return Err(Error::VersionNotFound(version_id.to_owned()));
  }
  Ok(chain)
}

/// Every version that inherits from `version_id`, directly or transitively.
pub fn inheritors(
  conn: &Connection,
  version_id: &str,
) -> Result<BTreeSet<String>> {
  let mut found = BTreeSet::new();
  let mut frontier = vec![version_id.to_owned()];
  let mut stmt = conn.prepare_cached(
    "SELECT id FROM version WHERE inherits_from_version_id = ?1",
  )?;
  while let Some(id) = frontier.pop() {
    let children = stmt
      .query_map([&id], |r| r.get::<_, String>(0))?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    for child in children {
      if child != version_id && found.insert(child.clone()) {
        frontier.push(child);
      }
    }
  }
  Ok(found)
}

// ─── Conflict pointers ───────────────────────────────────────────────────────

pub fn conflict_pointers(
  conn: &Connection,
  version_id: &str,
) -> Result<Vec<String>> {
  let mut stmt = conn.prepare_cached(
    "SELECT conflict_id FROM version_change_conflict
     WHERE version_id = ?1 ORDER BY conflict_id",
  )?;
  let ids = stmt
    .query_map([version_id], |r| r.get(0))?
    .collect::<rusqlite::Result<Vec<String>>>()?;
  Ok(ids)
}

/// Replace the version's conflict pointers, then drop conflicts no version
/// points at. Returns the number of conflicts removed.
pub fn update_conflict_pointers(
  conn: &Connection,
  version_id: &str,
  conflict_ids: &[String],
) -> Result<usize> {
  require_version(conn, version_id)?;
  conn.execute(
    "DELETE FROM version_change_conflict WHERE version_id = ?1",
    [version_id],
  )?;
  for conflict_id in conflict_ids {
    conn.execute(
      "INSERT OR IGNORE INTO version_change_conflict (version_id, conflict_id)
       VALUES (?1, ?2)",
      params![version_id, conflict_id],
    )?;
  }
  gc_conflicts(conn)
}

pub fn gc_conflicts(conn: &Connection) -> Result<usize> {
  conn.execute(
    "DELETE FROM change_conflict_element
     WHERE conflict_id NOT IN (SELECT conflict_id FROM version_change_conflict)",
    [],
  )?;
  let removed = conn.execute(
    "DELETE FROM change_conflict
     WHERE id NOT IN (SELECT conflict_id FROM version_change_conflict)",
    [],
  )?;
  if removed > 0 {
    tracing::debug!(removed, "garbage-collected conflicts");
  }
  Ok(removed)
}
