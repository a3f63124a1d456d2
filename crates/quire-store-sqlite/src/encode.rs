//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! All timestamps are stored as RFC 3339 strings. JSON documents (snapshot
//! content, metadata, id lists) are stored as compact JSON text.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, SecondsFormat, Utc};
use quire_core::{change::Change, state::StateRow, version::Version};
use rusqlite::{
  Row,
  types::{Value as SqlValue, ValueRef},
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

/// Fixed-width millisecond form, so text order matches time order.
pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── JSON ────────────────────────────────────────────────────────────────────

pub fn encode_json(value: &serde_json::Value) -> String { value.to_string() }

pub fn decode_json(s: &str) -> Result<serde_json::Value> {
  Ok(serde_json::from_str(s)?)
}

pub fn decode_json_opt(s: Option<String>) -> Result<Option<serde_json::Value>> {
  s.as_deref().map(decode_json).transpose()
}

pub fn decode_id_list(s: &str) -> Result<Vec<String>> {
  Ok(serde_json::from_str(s)?)
}

// ─── Change ──────────────────────────────────────────────────────────────────

pub const CHANGE_COLUMNS: &str = "id, entity_id, schema_key, schema_version, \
                                  file_id, plugin_key, snapshot_id, metadata, \
                                  created_at";

/// Raw `change` row as read from SQLite.
pub struct RawChange {
  pub id:             String,
  pub entity_id:      String,
  pub schema_key:     String,
  pub schema_version: String,
  pub file_id:        String,
  pub plugin_key:     String,
  pub snapshot_id:    String,
  pub metadata:       Option<String>,
  pub created_at:     String,
}

impl RawChange {
  /// Read the [`CHANGE_COLUMNS`] starting at column `offset`.
  pub fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
    Ok(Self {
      id:             row.get(offset)?,
      entity_id:      row.get(offset + 1)?,
      schema_key:     row.get(offset + 2)?,
      schema_version: row.get(offset + 3)?,
      file_id:        row.get(offset + 4)?,
      plugin_key:     row.get(offset + 5)?,
      snapshot_id:    row.get(offset + 6)?,
      metadata:       row.get(offset + 7)?,
      created_at:     row.get(offset + 8)?,
    })
  }

  pub fn into_change(self) -> Result<Change> {
    Ok(Change {
      id:             self.id,
      entity_id:      self.entity_id,
      schema_key:     self.schema_key,
      schema_version: self.schema_version,
      file_id:        self.file_id,
      plugin_key:     self.plugin_key,
      snapshot_id:    self.snapshot_id,
      metadata:       decode_json_opt(self.metadata)?,
      created_at:     decode_dt(&self.created_at)?,
    })
  }
}

// ─── Version ─────────────────────────────────────────────────────────────────

pub const VERSION_COLUMNS: &str =
  "id, name, commit_id, change_set_id, inherits_from_version_id, hidden";

pub struct RawVersion {
  pub id:                       String,
  pub name:                     String,
  pub commit_id:                String,
  pub change_set_id:            String,
  pub inherits_from_version_id: Option<String>,
  pub hidden:                   bool,
}

impl RawVersion {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                       row.get(0)?,
      name:                     row.get(1)?,
      commit_id:                row.get(2)?,
      change_set_id:            row.get(3)?,
      inherits_from_version_id: row.get(4)?,
      hidden:                   row.get(5)?,
    })
  }

  pub fn into_version(self) -> Version {
    Version {
      id:                       self.id,
      name:                     self.name,
      commit_id:                self.commit_id,
      change_set_id:            self.change_set_id,
      inherits_from_version_id: self.inherits_from_version_id,
      hidden:                   self.hidden,
    }
  }
}

// ─── StateRow ────────────────────────────────────────────────────────────────

/// Raw cache-table row, columns in [`crate::schema::CACHE_COLUMNS`] order.
pub struct RawStateRow {
  pub entity_id:                 String,
  pub schema_key:                String,
  pub file_id:                   String,
  pub version_id:                String,
  pub plugin_key:                String,
  pub snapshot_content:          String,
  pub schema_version:            String,
  pub created_at:                String,
  pub updated_at:                String,
  pub change_id:                 Option<String>,
  pub commit_id:                 Option<String>,
  pub inherited_from_version_id: Option<String>,
  pub untracked:                 bool,
}

impl RawStateRow {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      entity_id:                 row.get(0)?,
      schema_key:                row.get(1)?,
      file_id:                   row.get(2)?,
      version_id:                row.get(3)?,
      plugin_key:                row.get(4)?,
      snapshot_content:          row.get(5)?,
      schema_version:            row.get(6)?,
      created_at:                row.get(7)?,
      updated_at:                row.get(8)?,
      change_id:                 row.get(9)?,
      commit_id:                 row.get(10)?,
      inherited_from_version_id: row.get(11)?,
      untracked:                 row.get(12)?,
    })
  }

  pub fn into_state_row(self) -> Result<StateRow> {
    Ok(StateRow {
      entity_id:                 self.entity_id,
      schema_key:                self.schema_key,
      file_id:                   self.file_id,
      version_id:                self.version_id,
      plugin_key:                self.plugin_key,
      snapshot_content:          decode_json(&self.snapshot_content)?,
      schema_version:            self.schema_version,
      created_at:                decode_dt(&self.created_at)?,
      updated_at:                decode_dt(&self.updated_at)?,
      change_id:                 self.change_id,
      commit_id:                 self.commit_id,
      inherited_from_version_id: self.inherited_from_version_id,
      untracked:                 self.untracked,
    })
  }
}

// ─── SQL values ──────────────────────────────────────────────────────────────

/// Key under which blob cells are carried through JSON.
pub const BLOB_KEY: &str = "$blob";

/// Bind a JSON value. Booleans become 0/1, arrays and objects their JSON
/// text, and `{"$blob": <base64>}` a blob.
pub fn to_sql_value(value: &serde_json::Value) -> Result<SqlValue> {
  use serde_json::Value;
  Ok(match value {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
    Value::Number(n) => match n.as_i64() {
      Some(i) => SqlValue::Integer(i),
      None => SqlValue::Real(n.as_f64().unwrap_or_default()),
    },
    Value::String(s) => SqlValue::Text(s.clone()),
    Value::Object(obj) if obj.len() == 1 && obj.contains_key(BLOB_KEY) => {
      let encoded = obj[BLOB_KEY].as_str().unwrap_or_default();
      let bytes = BASE64
        .decode(encoded)
        .map_err(|e| Error::InvalidPortable(e.to_string()))?;
      SqlValue::Blob(bytes)
    }
    other => SqlValue::Text(encode_json(other)),
  })
}

pub fn from_sql_value(value: ValueRef<'_>) -> serde_json::Value {
  use serde_json::Value;
  match value {
    ValueRef::Null => Value::Null,
    ValueRef::Integer(i) => Value::from(i),
    ValueRef::Real(f) => serde_json::Number::from_f64(f)
      .map(Value::Number)
      .unwrap_or(Value::Null),
    ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    ValueRef::Blob(b) => Value::Object(serde_json::Map::from_iter([(
      BLOB_KEY.to_owned(),
      Value::String(BASE64.encode(b)),
    )])),
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn timestamps_sort_as_text() {
    let a = Utc.timestamp_millis_opt(1_704_067_200_001).unwrap();
    let b = Utc.timestamp_millis_opt(1_704_067_200_010).unwrap();
    assert!(encode_dt(a) < encode_dt(b));
    assert_eq!(decode_dt(&encode_dt(a)).unwrap(), a);
  }

  #[test]
  fn blobs_travel_as_base64_objects() {
    let json = from_sql_value(ValueRef::Blob(&[0, 1, 254]));
    assert_eq!(json, serde_json::json!({ "$blob": "AAH+" }));
    assert_eq!(to_sql_value(&json).unwrap(), SqlValue::Blob(vec![0, 1, 254]));
  }

  #[test]
  fn json_scalars_bind_as_sqlite_values() {
    use serde_json::json;
    assert_eq!(to_sql_value(&json!(true)).unwrap(), SqlValue::Integer(1));
    assert_eq!(to_sql_value(&json!(1.5)).unwrap(), SqlValue::Real(1.5));
    assert_eq!(
      to_sql_value(&json!({ "a": 1 })).unwrap(),
      SqlValue::Text("{\"a\":1}".into())
    );
  }
}
