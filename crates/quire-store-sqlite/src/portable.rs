//! The portable unit: a whole store as one JSON document.
//!
//! Every table, cache tables included, is written as `{columns, rows}`.
//! Binary cells travel as `{"$blob": base64}`.

use std::collections::BTreeMap;

use rusqlite::{Connection, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  Error, Result,
  encode::{from_sql_value, to_sql_value},
  schema::cache_table_ddl,
};

pub const FORMAT: &str = "quire-portable";
pub const FORMAT_VERSION: u32 = 1;

const CACHE_TABLE_PREFIX: &str = "state_cache_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableStore {
  pub format:  String,
  pub version: u32,
  pub tables:  BTreeMap<String, PortableTable>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortableTable {
  pub columns: Vec<String>,
  pub rows:    Vec<Vec<Value>>,
}

// ─── Export ──────────────────────────────────────────────────────────────────

pub fn export(conn: &Connection) -> Result<Vec<u8>> {
  let mut tables = BTreeMap::new();
  for name in table_names(conn)? {
    tables.insert(name.clone(), export_table(conn, &name)?);
  }
  let store = PortableStore {
    format: FORMAT.to_owned(),
    version: FORMAT_VERSION,
    tables,
  };
  tracing::debug!(tables = store.tables.len(), "exported store");
  Ok(serde_json::to_vec(&store)?)
}

fn table_names(conn: &Connection) -> Result<Vec<String>> {
  let mut stmt = conn.prepare(
    "SELECT name FROM sqlite_master
     WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
     ORDER BY name",
  )?;
  let names = stmt
    .query_map([], |r| r.get(0))?
    .collect::<rusqlite::Result<Vec<String>>>()?;
  Ok(names)
}

fn export_table(conn: &Connection, name: &str) -> Result<PortableTable> {
  let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote(name)?))?;
  let columns: Vec<String> =
    stmt.column_names().into_iter().map(str::to_owned).collect();
  let width = columns.len();

  let mut rows = Vec::new();
  let mut cursor = stmt.query([])?;
  while let Some(row) = cursor.next()? {
    let mut cells = Vec::with_capacity(width);
    for i in 0..width {
      cells.push(from_sql_value(row.get_ref(i)?));
    }
    rows.push(cells);
  }
  Ok(PortableTable { columns, rows })
}

// ─── Open ────────────────────────────────────────────────────────────────────

pub fn decode(blob: &[u8]) -> Result<PortableStore> {
  let store: PortableStore = serde_json::from_slice(blob)
    .map_err(|e| Error::InvalidPortable(e.to_string()))?;
  if store.format != FORMAT || store.version != FORMAT_VERSION {
    return Err(Error::InvalidPortable(format!(
      "unsupported format {} version {}",
      store.format, store.version
    )));
  }
  Ok(store)
}

/// Load `store` into a connection that already carries the base schema.
pub fn import(conn: &mut Connection, store: &PortableStore) -> Result<()> {
  let tx = conn.transaction()?;
  tx.execute_batch("PRAGMA defer_foreign_keys = ON;")?;
  let existing = table_names(&tx)?;

  for (name, table) in &store.tables {
    let quoted = quote(name)?;
    if name.starts_with(CACHE_TABLE_PREFIX) {
      tx.execute_batch(&cache_table_ddl(&quoted))?;
    } else if !existing.contains(name) {
      return Err(Error::InvalidPortable(format!("unknown table {name}")));
    }
    if table.rows.is_empty() {
      continue;
    }

    let columns = table
      .columns
      .iter()
      .map(|c| quote(c))
      .collect::<Result<Vec<_>>>()?;
    let placeholders = vec!["?"; columns.len()].join(", ");
    let mut stmt = tx.prepare(&format!(
      "INSERT OR IGNORE INTO {quoted} ({}) VALUES ({placeholders})",
      columns.join(", ")
    ))?;
    for row in &table.rows {
      if row.len() != columns.len() {
        return Err(Error::InvalidPortable(format!(
          "row width {} does not match {} columns of {name}",
          row.len(),
          columns.len()
        )));
      }
      let values = row.iter().map(to_sql_value).collect::<Result<Vec<_>>>()?;
      stmt.execute(params_from_iter(values))?;
    }
  }

  tx.commit()?;
  tracing::debug!(tables = store.tables.len(), "imported store");
  Ok(())
}

/// Double-quote an identifier after checking it is a plain SQL name.
fn quote(name: &str) -> Result<String> {
  let plain = !name.is_empty()
    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
  if plain {
    Ok(format!("\"{name}\""))
  } else {
    Err(Error::InvalidPortable(format!("invalid identifier {name:?}")))
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::schema::SCHEMA;

  fn connection() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(SCHEMA).unwrap();
    conn
  }

  #[test]
  fn export_covers_every_table() {
    let conn = connection();
    conn
      .execute(
        "INSERT INTO key_value (key, value) VALUES ('k', '\"v\"')",
        [],
      )
      .unwrap();
    let store = decode(&export(&conn).unwrap()).unwrap();
    assert!(store.tables.contains_key("change"));
    assert!(store.tables.contains_key("blob"));
    assert_eq!(store.tables["key_value"].rows, vec![vec![
      json!("k"),
      json!("\"v\"")
    ]]);
  }

  #[test]
  fn blobs_survive_a_round_trip() {
    let conn = connection();
    conn
      .execute(
        "INSERT INTO blob (id, data, created_at) VALUES ('b', ?1, 'now')",
        [vec![0u8, 1, 254]],
      )
      .unwrap();
    let store = decode(&export(&conn).unwrap()).unwrap();

    let mut copy = connection();
    import(&mut copy, &store).unwrap();
    let data: Vec<u8> = copy
      .query_row("SELECT data FROM blob WHERE id = 'b'", [], |r| r.get(0))
      .unwrap();
    assert_eq!(data, vec![0, 1, 254]);
  }

  #[test]
  fn foreign_documents_are_rejected() {
    let bad = br#"{"format": "other", "version": 1, "tables": {}}"#;
    assert!(matches!(decode(bad), Err(Error::InvalidPortable(_))));
    assert!(matches!(decode(b"not json"), Err(Error::InvalidPortable(_))));
  }

  #[test]
  fn unknown_tables_are_rejected() {
    let store = PortableStore {
      format:  FORMAT.to_owned(),
      version: FORMAT_VERSION,
      tables:  BTreeMap::from([(
        "mystery".to_owned(),
        PortableTable::default(),
      )]),
    };
    let mut conn = connection();
    assert!(matches!(
      import(&mut conn, &store),
      Err(Error::InvalidPortable(_))
    ));
  }
}
