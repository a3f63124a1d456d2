//! The commit DAG: commits, edges, change sets and traversal.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use quire_core::{
  change::{Change, EntityKey},
  commit::{Commit, Traversal},
};
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::{
  Error, Result,
  encode::{CHANGE_COLUMNS, RawChange, decode_dt, decode_id_list, encode_dt},
};

// ─── Change sets ─────────────────────────────────────────────────────────────

pub fn insert_change_set(conn: &Connection, id: &str) -> Result<()> {
  conn.execute("INSERT INTO change_set (id) VALUES (?1)", [id])?;
  Ok(())
}

/// Point `change_set_id` at `change_id` for the change's entity, replacing
/// any previous pointer for the same entity.
pub fn upsert_element(
  conn: &Connection,
  change_set_id: &str,
  change_id: &str,
  key: &EntityKey,
) -> Result<()> {
  conn
    .prepare_cached(
      "INSERT INTO change_set_element
         (change_set_id, change_id, entity_id, schema_key, file_id)
       VALUES (?1, ?2, ?3, ?4, ?5)
       ON CONFLICT (change_set_id, entity_id, schema_key, file_id)
       DO UPDATE SET change_id = excluded.change_id",
    )?
    .execute(params![
      change_set_id,
      change_id,
      key.entity_id,
      key.schema_key,
      key.file_id
    ])?;
  Ok(())
}

/// Copy every element of `from` into the (empty) set `to`.
pub fn copy_change_set(conn: &Connection, from: &str, to: &str) -> Result<()> {
  conn.execute(
    "INSERT INTO change_set_element
       (change_set_id, change_id, entity_id, schema_key, file_id)
     SELECT ?2, change_id, entity_id, schema_key, file_id
     FROM change_set_element WHERE change_set_id = ?1",
    params![from, to],
  )?;
  Ok(())
}

/// All changes a change set points at.
pub fn change_set_changes(
  conn: &Connection,
  change_set_id: &str,
) -> Result<Vec<Change>> {
  let columns = prefixed_change_columns();
  let mut stmt = conn.prepare_cached(&format!(
    "SELECT {columns} FROM change_set_element e
     JOIN change c ON c.id = e.change_id
     WHERE e.change_set_id = ?1
     ORDER BY c.created_at, c.id"
  ))?;
  let raw = stmt
    .query_map([change_set_id], |r| RawChange::from_row(r, 0))?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raw.into_iter().map(RawChange::into_change).collect()
}

pub(crate) fn prefixed_change_columns() -> String {
  CHANGE_COLUMNS
    .split(',')
    .map(|c| format!("c.{}", c.trim()))
    .collect::<Vec<_>>()
    .join(", ")
}

// ─── Commits ─────────────────────────────────────────────────────────────────

pub fn insert_commit(
  conn: &Connection,
  id: &str,
  change_set_id: &str,
  parents: &[String],
  created_at: DateTime<Utc>,
) -> Result<()> {
  conn.execute(
    "INSERT INTO commits (id, change_set_id, created_at) VALUES (?1, ?2, ?3)",
    params![id, change_set_id, encode_dt(created_at)],
  )?;
  for (position, parent) in parents.iter().enumerate() {
    conn.execute(
      "INSERT OR IGNORE INTO commit_edge (parent_id, child_id, position)
       VALUES (?1, ?2, ?3)",
      params![parent, id, position as i64],
    )?;
  }
  tracing::debug!(commit_id = id, parents = ?parents, "created commit");
  Ok(())
}

pub fn commit_exists(conn: &Connection, id: &str) -> Result<bool> {
  Ok(
    conn
      .query_row("SELECT 1 FROM commits WHERE id = ?1", [id], |_| Ok(()))
      .optional()?
      .is_some(),
  )
}

pub fn require_commit_exists(conn: &Connection, id: &str) -> Result<()> {
  if commit_exists(conn, id)? {
    Ok(())
  } else {
    Err(Error::CommitNotFound(id.to_owned()))
  }
}

pub fn commit(conn: &Connection, id: &str) -> Result<Commit> {
  let raw: Option<(String, String, String, String)> = conn
    .query_row(
      "SELECT change_set_id, author_account_ids, meta_change_ids, created_at
       FROM commits WHERE id = ?1",
      [id],
      |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    )
    .optional()?;
  let Some((change_set_id, authors, meta, created_at)) = raw else {
    return Err(Error::CommitNotFound(id.to_owned()));
  };

  let change_ids = change_set_changes(conn, &change_set_id)?
    .into_iter()
    .map(|c| c.id)
    .collect();

  Ok(Commit {
    id: id.to_owned(),
    change_set_id,
    change_ids,
    parent_commit_ids: neighbours(conn, id, Direction::Parents)?,
    author_account_ids: decode_id_list(&authors)?,
    meta_change_ids: decode_id_list(&meta)?,
    created_at: decode_dt(&created_at)?,
  })
}

/// The changes introduced by `commit_id`.
pub fn commit_changes(
  conn: &Connection,
  commit_id: &str,
) -> Result<Vec<Change>> {
  let change_set_id: Option<String> = conn
    .query_row(
      "SELECT change_set_id FROM commits WHERE id = ?1",
      [commit_id],
      |r| r.get(0),
    )
    .optional()?;
  match change_set_id {
    Some(id) => change_set_changes(conn, &id),
    None => Err(Error::CommitNotFound(commit_id.to_owned())),
  }
}

// ─── Traversal ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Parents,
  Children,
}

fn neighbours(
  conn: &Connection,
  id: &str,
  direction: Direction,
) -> Result<Vec<String>> {
  let sql = match direction {
    Direction::Parents => {
      "SELECT parent_id FROM commit_edge WHERE child_id = ?1
       ORDER BY position, parent_id"
    }
    Direction::Children => {
      "SELECT child_id FROM commit_edge WHERE parent_id = ?1 ORDER BY child_id"
    }
  };
  let mut stmt = conn.prepare_cached(sql)?;
  let ids = stmt
    .query_map([id], |r| r.get(0))?
    .collect::<rusqlite::Result<Vec<String>>>()?;
  Ok(ids)
}

/// Breadth-first walk recording the minimum hop count of every reachable
/// commit, including `start` at depth 0. `max_depth` bounds the walk.
pub fn depths(
  conn: &Connection,
  start: &str,
  direction: Direction,
  max_depth: usize,
) -> Result<HashMap<String, usize>> {
  require_commit_exists(conn, start)?;

  let mut seen = HashMap::from([(start.to_owned(), 0)]);
  let mut queue = VecDeque::from([(start.to_owned(), 0)]);
  while let Some((id, depth)) = queue.pop_front() {
    if depth >= max_depth {
      continue;
    }
    for next in neighbours(conn, &id, direction)? {
      if !seen.contains_key(&next) {
        seen.insert(next.clone(), depth + 1);
        queue.push_back((next, depth + 1));
      }
    }
  }
  Ok(seen)
}

/// Minimum depth of every ancestor of `commit_id`, itself included.
pub fn ancestry_depths(
  conn: &Connection,
  commit_id: &str,
  limit: usize,
) -> Result<HashMap<String, usize>> {
  depths(conn, commit_id, Direction::Parents, limit)
}

/// Every ancestor of `start`, itself first, depth first. A commit's first
/// parent and all of its history come before the later parents.
pub fn first_parent_order(
  conn: &Connection,
  start: &str,
) -> Result<Vec<String>> {
  require_commit_exists(conn, start)?;

  let mut order = Vec::new();
  let mut seen = HashSet::new();
  let mut stack = vec![start.to_owned()];
  while let Some(id) = stack.pop() {
    if !seen.insert(id.clone()) {
      continue;
    }
    let parents = neighbours(conn, &id, Direction::Parents)?;
    stack.extend(parents.into_iter().rev());
    order.push(id);
  }
  Ok(order)
}

pub fn walk(
  conn: &Connection,
  start: &str,
  direction: Direction,
  traversal: Traversal,
  limit: usize,
) -> Result<BTreeSet<String>> {
  let max_depth = traversal.depth.map_or(limit, |d| d.min(limit));
  let mut found: BTreeSet<String> = depths(conn, start, direction, max_depth)?
    .into_keys()
    .collect();
  if !traversal.include_self {
    found.remove(start);
  }
  Ok(found)
}

/// Nearest common ancestor of `source` and `target`, measured from `source`.
/// Ties break on the distance from `target`, then on id. The whole history
/// is searched.
pub fn merge_base(
  conn: &Connection,
  source: &str,
  target: &str,
) -> Result<Option<String>> {
  let from_source = ancestry_depths(conn, source, usize::MAX)?;
  let from_target = ancestry_depths(conn, target, usize::MAX)?;
  Ok(
    from_source
      .iter()
      .filter_map(|(id, ds)| from_target.get(id).map(|dt| (*ds, *dt, id)))
      .min()
      .map(|(_, _, id)| id.clone()),
  )
}
