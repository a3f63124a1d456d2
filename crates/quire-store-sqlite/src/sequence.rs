//! Id, timestamp and counter generation.
//!
//! With deterministic mode on, every id and timestamp is derived from one
//! counter persisted in `key_value`, so two stores fed the same operations
//! produce the same ids, and an exported store resumes where it left off.

use chrono::{DateTime, TimeZone as _, Utc};
use quire_core::deterministic::DeterministicConfig;
use rusqlite::{Connection, OptionalExtension as _, params};
use uuid::Uuid;

use crate::{Error, Result};

pub const SEQUENCE_KEY: &str = "quire_sequence_number";
pub const DETERMINISTIC_KEY: &str = "quire_deterministic_mode";

pub fn get_key_value(
  conn: &Connection,
  key: &str,
) -> Result<Option<serde_json::Value>> {
  let raw: Option<String> = conn
    .query_row("SELECT value FROM key_value WHERE key = ?1", [key], |r| {
      r.get(0)
    })
    .optional()?;
  raw.map(|s| Ok(serde_json::from_str(&s)?)).transpose()
}

pub fn set_key_value(
  conn: &Connection,
  key: &str,
  value: &serde_json::Value,
) -> Result<()> {
  conn.execute(
    "INSERT INTO key_value (key, value) VALUES (?1, ?2)
     ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    params![key, value.to_string()],
  )?;
  Ok(())
}

/// The persisted deterministic settings, if any were ever stored.
pub fn load_config(conn: &Connection) -> Result<Option<DeterministicConfig>> {
  get_key_value(conn, DETERMINISTIC_KEY)?
    .map(|v| Ok(serde_json::from_value(v)?))
    .transpose()
}

pub fn persist_config(
  conn: &Connection,
  config: &DeterministicConfig,
) -> Result<()> {
  set_key_value(conn, DETERMINISTIC_KEY, &serde_json::to_value(config)?)
}

/// Return the current counter value and advance it by one.
pub fn next_sequence_number(
  conn: &Connection,
  mode: Option<&DeterministicConfig>,
) -> Result<i64> {
  if !mode.is_some_and(|m| m.enabled) {
    return Err(Error::DeterministicModeDisabled);
  }
  let current = get_key_value(conn, SEQUENCE_KEY)?
    .and_then(|v| v.as_i64())
    .unwrap_or(0);
  set_key_value(conn, SEQUENCE_KEY, &serde_json::Value::from(current + 1))?;
  Ok(current)
}

pub fn generate_id(
  conn: &Connection,
  mode: Option<&DeterministicConfig>,
) -> Result<String> {
  match mode {
    Some(m) if m.enabled => {
      let n = next_sequence_number(conn, mode)?;
      Ok(Uuid::from_u128(n as u128).hyphenated().to_string())
    }
    _ => Ok(Uuid::new_v4().hyphenated().to_string()),
  }
}

pub fn timestamp(
  conn: &Connection,
  mode: Option<&DeterministicConfig>,
) -> Result<DateTime<Utc>> {
  match mode {
    Some(m) if m.enabled => {
      let n = next_sequence_number(conn, mode)?;
      Utc
        .timestamp_millis_opt(m.start_timestamp_ms + n)
        .single()
        .ok_or_else(|| Error::DateParse(format!("timestamp out of range: {n}")))
    }
    _ => Ok(Utc::now()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::schema::SCHEMA;

  fn conn() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(SCHEMA).unwrap();
    conn
  }

  #[test]
  fn counter_fails_when_disabled() {
    let conn = conn();
    assert!(matches!(
      next_sequence_number(&conn, None),
      Err(Error::DeterministicModeDisabled)
    ));
    let off = DeterministicConfig { enabled: false, ..Default::default() };
    assert!(next_sequence_number(&conn, Some(&off)).is_err());
  }

  #[test]
  fn ids_and_timestamps_share_the_counter() {
    let conn = conn();
    let mode = DeterministicConfig::default();
    assert_eq!(
      generate_id(&conn, Some(&mode)).unwrap(),
      "00000000-0000-0000-0000-000000000000"
    );
    let ts = timestamp(&conn, Some(&mode)).unwrap();
    assert_eq!(ts.timestamp_millis(), mode.start_timestamp_ms + 1);
    assert_eq!(next_sequence_number(&conn, Some(&mode)).unwrap(), 2);
  }

  #[test]
  fn random_ids_when_disabled() {
    let conn = conn();
    assert_ne!(
      generate_id(&conn, None).unwrap(),
      generate_id(&conn, None).unwrap()
    );
  }
}
