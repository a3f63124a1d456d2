//! Resolution of current state.
//!
//! A version's tracked state is its latest-pointer set: one change per
//! entity, upserted by every commit onto the version, so reading it never
//! walks history. Levels are visited along the inheritance chain; the first
//! level that knows an entity decides it, with untracked rows beating
//! tracked rows on the same level. A tombstone decides an entity too, which
//! is how deletions block inheritance.
//!
//! State as of an arbitrary commit has no pointer set and is folded from the
//! commit graph instead; see [`resolve_at_commit`].

use std::collections::{BTreeMap, HashMap, btree_map::Entry};

use chrono::{DateTime, Utc};
use quire_core::{
  change::{Change, EntityKey},
  schema::VERSION_DESCRIPTOR_SCHEMA_KEY,
  state::{OWN_ENTITY_FILE_ID, OWN_ENTITY_PLUGIN_KEY, StateRow},
  version::{GLOBAL_VERSION_ID, MAIN_VERSION_NAME},
};
use rusqlite::{Connection, params};
use serde_json::{Value, json};

use crate::{
  Result,
  encode::{RawChange, decode_dt, decode_json, decode_json_opt},
  graph::{self, prefixed_change_columns},
  version,
};

/// Restricts a resolution to matching entities. `None` fields match all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveFilter {
  pub schema_key: Option<String>,
  pub entity_id:  Option<String>,
  pub file_id:    Option<String>,
}

impl ResolveFilter {
  pub fn schema(schema_key: impl Into<String>) -> Self {
    Self { schema_key: Some(schema_key.into()), ..Self::default() }
  }

  pub fn matches(&self, key: &EntityKey) -> bool {
    self.schema_key.as_ref().is_none_or(|s| *s == key.schema_key)
      && self.entity_id.as_ref().is_none_or(|e| *e == key.entity_id)
      && self.file_id.as_ref().is_none_or(|f| *f == key.file_id)
  }
}

/// The winning change for one entity.
#[derive(Debug, Clone)]
pub struct Resolved {
  pub change:     Change,
  /// `None` when the winner is a tombstone.
  pub content:    Option<Value>,
  /// The commit holding the change; `None` for a pointer to a change that
  /// was never committed.
  pub commit_id:  Option<String>,
  /// `created_at` of the oldest known change for the entity.
  pub created_at: DateTime<Utc>,
}

// ─── Pointer sets ────────────────────────────────────────────────────────────

/// Every entity a latest-pointer set points at, tombstones included.
pub fn resolve_pointers(
  conn: &Connection,
  change_set_id: &str,
  filter: &ResolveFilter,
) -> Result<BTreeMap<EntityKey, Resolved>> {
  let columns = prefixed_change_columns();
  let mut stmt = conn.prepare_cached(&format!(
    "SELECT {columns}, s.content,
       (SELECT cm.id FROM change_set_element ce
        JOIN commits cm ON cm.change_set_id = ce.change_set_id
        WHERE ce.change_id = c.id
        ORDER BY cm.created_at DESC, cm.id DESC LIMIT 1),
       (SELECT MIN(o.created_at) FROM change o
        WHERE o.entity_id = c.entity_id
          AND o.schema_key = c.schema_key
          AND o.file_id = c.file_id)
     FROM change_set_element e
     JOIN change c ON c.id = e.change_id
     LEFT JOIN snapshot s ON s.id = c.snapshot_id
     WHERE e.change_set_id = ?1
       AND (?2 IS NULL OR c.schema_key = ?2)
       AND (?3 IS NULL OR c.entity_id = ?3)
       AND (?4 IS NULL OR c.file_id = ?4)"
  ))?;
  let rows = stmt
    .query_map(
      params![
        change_set_id,
        filter.schema_key,
        filter.entity_id,
        filter.file_id
      ],
      |r| {
        Ok((
          RawChange::from_row(r, 0)?,
          r.get::<_, Option<String>>(9)?,
          r.get::<_, Option<String>>(10)?,
          r.get::<_, String>(11)?,
        ))
      },
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let mut leaves = BTreeMap::new();
  for (raw, content, commit_id, first_seen) in rows {
    let change = raw.into_change()?;
    leaves.insert(change.entity_key(), Resolved {
      content: decode_json_opt(content)?,
      commit_id,
      created_at: decode_dt(&first_seen)?,
      change,
    });
  }
  Ok(leaves)
}

// ─── Commit level ────────────────────────────────────────────────────────────

/// Resolve every entity reachable from `commit_id`, tombstones included.
///
/// Commits are folded in [`graph::first_parent_order`] and the first change
/// seen for an entity wins. Along one line of history that is the newest
/// change; at a merge the first parent's line decides every entity the
/// merge commit itself does not touch, which matches how merges only commit
/// the changes they take from the source.
pub fn resolve_at_commit(
  conn: &Connection,
  commit_id: &str,
  filter: &ResolveFilter,
) -> Result<BTreeMap<EntityKey, Resolved>> {
  let order = graph::first_parent_order(conn, commit_id)?;
  let columns = prefixed_change_columns();
  let mut stmt = conn.prepare_cached(&format!(
    "SELECT {columns}, s.content
     FROM commits cm
     JOIN change_set_element e ON e.change_set_id = cm.change_set_id
     JOIN change c ON c.id = e.change_id
     LEFT JOIN snapshot s ON s.id = c.snapshot_id
     WHERE cm.id = ?1
       AND (?2 IS NULL OR c.schema_key = ?2)
       AND (?3 IS NULL OR c.entity_id = ?3)
       AND (?4 IS NULL OR c.file_id = ?4)"
  ))?;

  let mut winners: BTreeMap<EntityKey, Resolved> = BTreeMap::new();
  for commit in &order {
    let rows = stmt
      .query_map(
        params![commit, filter.schema_key, filter.entity_id, filter.file_id],
        |r| Ok((RawChange::from_row(r, 0)?, r.get::<_, Option<String>>(9)?)),
      )?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    for (raw, content) in rows {
      let change = raw.into_change()?;
      match winners.entry(change.entity_key()) {
        Entry::Vacant(slot) => {
          slot.insert(Resolved {
            content: decode_json_opt(content)?,
            commit_id: Some(commit.clone()),
            created_at: change.created_at,
            change,
          });
        }
        Entry::Occupied(mut slot) => {
          let winner = slot.get_mut();
          winner.created_at = winner.created_at.min(change.created_at);
        }
      }
    }
  }
  Ok(winners)
}

// ─── Version level ───────────────────────────────────────────────────────────

/// One level's view of an entity before inheritance is applied.
struct Candidate {
  content:        Option<Value>,
  plugin_key:     String,
  schema_version: String,
  created_at:     DateTime<Utc>,
  updated_at:     DateTime<Utc>,
  change_id:      Option<String>,
  commit_id:      Option<String>,
  untracked:      bool,
}

impl From<Resolved> for Candidate {
  fn from(r: Resolved) -> Self {
    Self {
      content:        r.content,
      plugin_key:     r.change.plugin_key,
      schema_version: r.change.schema_version,
      created_at:     r.created_at,
      updated_at:     r.change.created_at,
      change_id:      Some(r.change.id),
      commit_id:      r.commit_id,
      untracked:      false,
    }
  }
}

/// Resolve the live state of `version_id`: pointer sets, inheritance,
/// untracked overlay, with tombstoned entities removed.
pub fn resolve_version(
  conn: &Connection,
  version_id: &str,
  filter: &ResolveFilter,
) -> Result<Vec<StateRow>> {
  let chain = version::inheritance_chain(conn, version_id)?;

  let mut decided: HashMap<EntityKey, Option<StateRow>> = HashMap::new();
  for level in &chain {
    let mut tracked: HashMap<EntityKey, Candidate> =
      resolve_pointers(conn, &level.change_set_id, filter)?
        .into_iter()
        .map(|(k, r)| (k, Candidate::from(r)))
        .collect();
    if level.id == GLOBAL_VERSION_ID {
      for (key, candidate) in bootstrap_descriptors(conn, filter)? {
        tracked.entry(key).or_insert(candidate);
      }
    }
    let untracked = untracked_rows(conn, &level.id, filter)?;

    let inherited_from =
      (level.id != version_id).then(|| level.id.clone());
    for (key, candidate) in untracked.into_iter().chain(tracked) {
      if decided.contains_key(&key) {
        continue;
      }
      let row = candidate.content.map(|content| StateRow {
        entity_id:                 key.entity_id.clone(),
        schema_key:                key.schema_key.clone(),
        file_id:                   key.file_id.clone(),
        version_id:                version_id.to_owned(),
        plugin_key:                candidate.plugin_key,
        snapshot_content:          content,
        schema_version:            candidate.schema_version,
        created_at:                candidate.created_at,
        updated_at:                candidate.updated_at,
        change_id:                 candidate.change_id,
        commit_id:                 candidate.commit_id,
        inherited_from_version_id: inherited_from.clone(),
        untracked:                 candidate.untracked,
      });
      decided.insert(key, row);
    }
  }

  let mut rows: Vec<StateRow> = decided.into_values().flatten().collect();
  rows.sort_by(|a, b| {
    (&a.schema_key, &a.file_id, &a.entity_id).cmp(&(
      &b.schema_key,
      &b.file_id,
      &b.entity_id,
    ))
  });
  Ok(rows)
}

fn untracked_rows(
  conn: &Connection,
  version_id: &str,
  filter: &ResolveFilter,
) -> Result<Vec<(EntityKey, Candidate)>> {
  let mut stmt = conn.prepare_cached(
    "SELECT entity_id, schema_key, file_id, plugin_key, schema_version,
            snapshot_content, created_at, updated_at
     FROM untracked_state
     WHERE version_id = ?1
       AND (?2 IS NULL OR schema_key = ?2)
       AND (?3 IS NULL OR entity_id = ?3)
       AND (?4 IS NULL OR file_id = ?4)",
  )?;
  type Raw = (String, String, String, String, String, String, String, String);
  let raw: Vec<Raw> = stmt
    .query_map(
      params![
        version_id,
        filter.schema_key,
        filter.entity_id,
        filter.file_id
      ],
      |r| {
        Ok((
          r.get(0)?,
          r.get(1)?,
          r.get(2)?,
          r.get(3)?,
          r.get(4)?,
          r.get(5)?,
          r.get(6)?,
          r.get(7)?,
        ))
      },
    )?
    .collect::<rusqlite::Result<_>>()?;

  raw
    .into_iter()
    .map(
      |(entity_id, schema_key, file_id, plugin_key, version, content, c, u)| {
        Ok((
          EntityKey { entity_id, schema_key, file_id },
          Candidate {
            content: Some(decode_json(&content)?),
            plugin_key,
            schema_version: version,
            created_at: decode_dt(&c)?,
            updated_at: decode_dt(&u)?,
            change_id: None,
            commit_id: None,
            untracked: true,
          },
        ))
      },
    )
    .collect()
}

/// Descriptor rows for the versions created at bootstrap. They exist from the
/// first moment, before any descriptor change has been written for them.
fn bootstrap_descriptors(
  conn: &Connection,
  filter: &ResolveFilter,
) -> Result<Vec<(EntityKey, Candidate)>> {
  if filter
    .schema_key
    .as_ref()
    .is_some_and(|s| s != VERSION_DESCRIPTOR_SCHEMA_KEY)
  {
    return Ok(Vec::new());
  }

  let mut stmt = conn.prepare_cached(
    "SELECT id, name, inherits_from_version_id, hidden, created_at
     FROM version WHERE id = ?1 OR name = ?2",
  )?;
  let raw = stmt
    .query_map(params![GLOBAL_VERSION_ID, MAIN_VERSION_NAME], |r| {
      Ok((
        r.get::<_, String>(0)?,
        r.get::<_, String>(1)?,
        r.get::<_, Option<String>>(2)?,
        r.get::<_, bool>(3)?,
        r.get::<_, String>(4)?,
      ))
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let mut out = Vec::new();
  for (id, name, inherits, hidden, created_at) in raw {
    let key = EntityKey {
      entity_id:  id.clone(),
      schema_key: VERSION_DESCRIPTOR_SCHEMA_KEY.to_owned(),
      file_id:    OWN_ENTITY_FILE_ID.to_owned(),
    };
    if !filter.matches(&key) {
      continue;
    }
    let created_at = decode_dt(&created_at)?;
    out.push((key, Candidate {
      content: Some(json!({
        "id": id,
        "name": name,
        "inherits_from_version_id": inherits,
        "hidden": hidden,
      })),
      plugin_key: OWN_ENTITY_PLUGIN_KEY.to_owned(),
      schema_version: "1.0".to_owned(),
      created_at,
      updated_at: created_at,
      change_id: None,
      commit_id: None,
      untracked: false,
    }));
  }
  Ok(out)
}
