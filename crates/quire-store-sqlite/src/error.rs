//! Error type for `quire-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] quire_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  // ── Graph integrity ───────────────────────────────────────────────────

  #[error("change already exists: {0}")]
  ChangeAlreadyExists(String),

  #[error("change {change_id} does not belong to file {file_id}")]
  ChangeDoesNotBelongToFile { change_id: String, file_id: String },

  #[error("change {change_id} is not a direct child of conflict {conflict_id}")]
  ChangeNotDirectChildOfConflict { change_id: String, conflict_id: String },

  #[error("foreign key violation on {schema_key}: {message}")]
  ForeignKeyViolation { schema_key: String, message: String },

  // ── Lookups ───────────────────────────────────────────────────────────

  #[error("change not found: {0}")]
  ChangeNotFound(String),

  #[error("version not found: {0}")]
  VersionNotFound(String),

  #[error("a version named {0:?} already exists")]
  VersionExists(String),

  #[error("commit not found: {0}")]
  CommitNotFound(String),

  #[error("file not found: {0}")]
  FileNotFound(String),

  #[error("conflict not found: {0}")]
  ConflictNotFound(String),

  // ── Engine ────────────────────────────────────────────────────────────

  #[error("no plugin handles {path}")]
  PluginMissing { path: String },

  #[error("deterministic mode is disabled")]
  DeterministicModeDisabled,

  #[error("sql parse error: {0}")]
  SqlParse(String),

  #[error("unsupported statement on virtual relation {relation}")]
  UnsupportedStatement { relation: String },

  #[error("invalid portable blob: {0}")]
  InvalidPortable(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
