//! Per-schema state cache and staleness tracking.
//!
//! Cache rows are disposable: every row can be rebuilt from the change store
//! and the commit graph. A version listed in `cache_stale` (or the `*` scope)
//! must not be served from its cache rows until it has been repopulated.

use std::collections::{BTreeMap, BTreeSet};

use quire_core::{
  state::{StateAddress, StateRow},
  version::GLOBAL_VERSION_ID,
};
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::{
  Result,
  encode::{RawStateRow, encode_dt},
  materialize::{self, ResolveFilter},
  schema::{CACHE_COLUMNS, cache_table_ddl, cache_table_name},
  version,
};

/// Scope that marks every version stale.
pub const ALL_VERSIONS_SCOPE: &str = "*";

// ─── Tables ──────────────────────────────────────────────────────────────────

/// schema_key -> cache table name.
pub fn cache_tables(conn: &Connection) -> Result<BTreeMap<String, String>> {
  let mut stmt =
    conn.prepare_cached("SELECT schema_key, table_name FROM cache_table")?;
  let map = stmt
    .query_map([], |r| {
      Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?
    .collect::<rusqlite::Result<_>>()?;
  Ok(map)
}

fn table_for(conn: &Connection, schema_key: &str) -> Result<Option<String>> {
  Ok(
    conn
      .query_row(
        "SELECT table_name FROM cache_table WHERE schema_key = ?1",
        [schema_key],
        |r| r.get(0),
      )
      .optional()?,
  )
}

/// Create the cache table for `schema_key` if it does not exist yet.
/// Returns `true` when a table was created.
pub fn ensure_cache_table(conn: &Connection, schema_key: &str) -> Result<bool> {
  if table_for(conn, schema_key)?.is_some() {
    return Ok(false);
  }
  let table = cache_table_name(schema_key);
  conn.execute_batch(&cache_table_ddl(&table))?;
  conn.execute(
    "INSERT INTO cache_table (schema_key, table_name) VALUES (?1, ?2)",
    params![schema_key, table],
  )?;
  tracing::debug!(schema_key, %table, "created cache table");
  Ok(true)
}

// ─── Staleness ───────────────────────────────────────────────────────────────

/// Mark `version_id` and every version inheriting from it as stale.
pub fn mark_stale(conn: &Connection, version_id: &str) -> Result<()> {
  let mut scopes = BTreeSet::new();
  if version_id == GLOBAL_VERSION_ID {
    scopes.insert(ALL_VERSIONS_SCOPE.to_owned());
  } else {
    scopes.insert(version_id.to_owned());
    scopes.extend(version::inheritors(conn, version_id)?);
  }
  for scope in scopes {
    conn.execute(
      "INSERT OR IGNORE INTO cache_stale (scope) VALUES (?1)",
      [scope],
    )?;
  }
  Ok(())
}

pub fn stale_scopes(conn: &Connection) -> Result<BTreeSet<String>> {
  let mut stmt = conn.prepare_cached("SELECT scope FROM cache_stale")?;
  let scopes = stmt
    .query_map([], |r| r.get::<_, String>(0))?
    .collect::<rusqlite::Result<_>>()?;
  Ok(scopes)
}

pub fn is_stale(conn: &Connection, version_id: &str) -> Result<bool> {
  Ok(
    conn
      .query_row(
        "SELECT 1 FROM cache_stale WHERE scope IN (?1, ?2) LIMIT 1",
        params![version_id, ALL_VERSIONS_SCOPE],
        |_| Ok(()),
      )
      .optional()?
      .is_some(),
  )
}

/// Outcome of [`ensure_fresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreshReport {
  pub refreshed:      Vec<String>,
  pub tables_created: bool,
}

/// Repopulate stale versions within `hint` (all stale versions when `None`)
/// and clear their flags. Calling it again without intervening writes does
/// nothing.
pub fn ensure_fresh(
  conn: &Connection,
  hint: Option<&[String]>,
) -> Result<FreshReport> {
  let mut stale = stale_scopes(conn)?;
  if stale.is_empty() {
    return Ok(FreshReport::default());
  }

  if stale.remove(ALL_VERSIONS_SCOPE) {
    // Expand '*' so a scoped refresh leaves the other versions flagged.
    for v in version::versions(conn)? {
      conn.execute(
        "INSERT OR IGNORE INTO cache_stale (scope) VALUES (?1)",
        [&v.id],
      )?;
      stale.insert(v.id);
    }
    conn.execute("DELETE FROM cache_stale WHERE scope = ?1", [
      ALL_VERSIONS_SCOPE,
    ])?;
  }

  let mut report = FreshReport::default();
  for version_id in stale {
    if hint.is_some_and(|h| !h.contains(&version_id)) {
      continue;
    }
    if version::version(conn, &version_id)?.is_some() {
      report.tables_created |= repopulate(conn, &version_id)?;
    }
    conn.execute("DELETE FROM cache_stale WHERE scope = ?1", [&version_id])?;
    report.refreshed.push(version_id);
  }
  Ok(report)
}

/// Replace every cache row of `version_id` with freshly resolved state.
fn repopulate(conn: &Connection, version_id: &str) -> Result<bool> {
  for table in cache_tables(conn)?.values() {
    conn.execute(&format!("DELETE FROM {table} WHERE version_id = ?1"), [
      version_id,
    ])?;
  }
  let rows =
    materialize::resolve_version(conn, version_id, &ResolveFilter::default())?;
  let mut created = false;
  for row in &rows {
    created |= upsert_row(conn, row)?;
  }
  tracing::info!(version_id, rows = rows.len(), "repopulated state cache");
  Ok(created)
}

// ─── Rows ────────────────────────────────────────────────────────────────────

/// Insert or replace one cache row. Returns `true` when a cache table had to
/// be created for it.
pub fn upsert_row(conn: &Connection, row: &StateRow) -> Result<bool> {
  let created = ensure_cache_table(conn, &row.schema_key)?;
  let table = cache_table_name(&row.schema_key);
  let placeholders = (1..=CACHE_COLUMNS.len())
    .map(|i| format!("?{i}"))
    .collect::<Vec<_>>()
    .join(", ");
  conn
    .prepare_cached(&format!(
      "INSERT OR REPLACE INTO {table} ({}) VALUES ({placeholders})",
      CACHE_COLUMNS.join(", ")
    ))?
    .execute(params![
      row.entity_id,
      row.schema_key,
      row.file_id,
      row.version_id,
      row.plugin_key,
      row.snapshot_content.to_string(),
      row.schema_version,
      encode_dt(row.created_at),
      encode_dt(row.updated_at),
      row.change_id,
      row.commit_id,
      row.inherited_from_version_id,
      row.untracked,
    ])?;
  Ok(created)
}

fn delete_row(conn: &Connection, address: &StateAddress) -> Result<()> {
  if let Some(table) = table_for(conn, &address.schema_key)? {
    conn.execute(
      &format!(
        "DELETE FROM {table}
         WHERE entity_id = ?1 AND file_id = ?2 AND version_id = ?3"
      ),
      params![address.entity_id, address.file_id, address.version_id],
    )?;
  }
  Ok(())
}

/// Keyed cache lookup; `None` on a miss or when no table exists yet.
pub fn lookup(
  conn: &Connection,
  address: &StateAddress,
) -> Result<Option<StateRow>> {
  let Some(table) = table_for(conn, &address.schema_key)? else {
    return Ok(None);
  };
  conn
    .query_row(
      &format!(
        "SELECT {} FROM {table}
         WHERE entity_id = ?1 AND file_id = ?2 AND version_id = ?3",
        CACHE_COLUMNS.join(", ")
      ),
      params![address.entity_id, address.file_id, address.version_id],
      RawStateRow::from_row,
    )
    .optional()?
    .map(RawStateRow::into_state_row)
    .transpose()
}

/// Outcome of a cache-first [`read`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
  pub row:           Option<StateRow>,
  pub hit:           bool,
  pub table_created: bool,
}

/// Cache-first read of one entity.
///
/// A fresh cache hit is returned directly. Otherwise the entity is resolved
/// from history and written back to the cache. Lookup failures are logged
/// and treated as a miss.
pub fn read(conn: &Connection, address: &StateAddress) -> Result<CacheRead> {
  if !is_stale(conn, &address.version_id)? {
    match lookup(conn, address) {
      Ok(Some(row)) => {
        return Ok(CacheRead {
          row:           Some(row),
          hit:           true,
          table_created: false,
        });
      }
      Ok(None) => {}
      Err(error) => {
        tracing::warn!(%error, ?address, "cache lookup failed; resolving");
      }
    }
  }

  let filter = ResolveFilter {
    schema_key: Some(address.schema_key.clone()),
    entity_id:  Some(address.entity_id.clone()),
    file_id:    Some(address.file_id.clone()),
  };
  let row = materialize::resolve_version(conn, &address.version_id, &filter)?
    .into_iter()
    .next();

  let table_created = match &row {
    Some(row) => upsert_row(conn, row)?,
    None => {
      delete_row(conn, address)?;
      false
    }
  };
  Ok(CacheRead { row, hit: false, table_created })
}
