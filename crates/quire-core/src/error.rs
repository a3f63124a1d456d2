//! Error types for `quire-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// A schema definition is malformed. `path` is a JSON pointer into the
  /// definition document.
  #[error("invalid schema at {path}: {message}")]
  SchemaInvalid { path: String, message: String },

  /// An instance does not satisfy its schema.
  #[error("invalid {schema_key} data at {path}: {message} (got {value})")]
  DataInvalid {
    schema_key: String,
    path:       String,
    value:      serde_json::Value,
    message:    String,
  },

  #[error("schema not found: {key} (version {version:?})")]
  SchemaNotFound { key: String, version: Option<String> },

  #[error("plugin {plugin_key} failed: {message}")]
  Plugin { plugin_key: String, message: String },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  pub(crate) fn schema_invalid(
    path: impl Into<String>,
    message: impl Into<String>,
  ) -> Self {
    Self::SchemaInvalid { path: path.into(), message: message.into() }
  }

  pub(crate) fn plugin(
    plugin_key: impl Into<String>,
    message: impl Into<String>,
  ) -> Self {
    Self::Plugin { plugin_key: plugin_key.into(), message: message.into() }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
