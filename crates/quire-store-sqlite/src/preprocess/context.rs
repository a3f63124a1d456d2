//! The memoized lookup tables the preprocessor works from.

use std::{
  cmp::Ordering,
  collections::BTreeMap,
  sync::Arc,
};

use quire_core::{
  plugin::Plugin,
  schema::{STORED_SCHEMA_KEY, SchemaDefinition, builtin_schemas},
  version::GLOBAL_VERSION_ID,
};
use rusqlite::Connection;

use super::parse::{quote_ident, quote_literal};
use crate::{
  Result, cache,
  materialize::{self, ResolveFilter},
};

/// Schema keys that would shadow a built-in relation get no views.
const RESERVED_VIEW_NAMES: &[&str] =
  &["state", "state_by_version", "state_history"];

/// A view the preprocessor expands in place of a relation name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDef {
  pub select:              String,
  pub filter:              Option<String>,
  /// Restrict the view to whichever version is active at expansion time.
  pub active_version_only: bool,
}

impl ViewDef {
  pub fn sql(&self, active_version_id: &str) -> String {
    let mut conjuncts: Vec<String> = self.filter.iter().cloned().collect();
    if self.active_version_only {
      conjuncts
        .push(format!("version_id = {}", quote_literal(active_version_id)));
    }
    if conjuncts.is_empty() {
      self.select.clone()
    } else {
      format!("{} WHERE {}", self.select, conjuncts.join(" AND "))
    }
  }
}

/// Schemas, views and the cache-table mapping, as of one load.
#[derive(Debug, Default)]
pub struct PreprocessorContext {
  /// schema key -> known versions, oldest first.
  pub schemas:      BTreeMap<String, Vec<SchemaDefinition>>,
  /// lower-cased view name -> definition.
  pub views:        BTreeMap<String, ViewDef>,
  /// schema key -> cache table.
  pub cache_tables: BTreeMap<String, String>,
}

impl PreprocessorContext {
  /// Load everything visible to `conn`: built-in and plugin schemas plus
  /// every schema stored in the global version.
  pub fn load(
    conn: &Connection,
    plugins: &[Arc<dyn Plugin>],
  ) -> Result<Self> {
    let mut ctx = Self::default();
    for schema in builtin_schemas() {
      ctx.add_schema(schema);
    }
    for plugin in plugins {
      for schema in plugin.schemas() {
        ctx.add_schema(schema);
      }
    }

    let stored = materialize::resolve_version(
      conn,
      GLOBAL_VERSION_ID,
      &ResolveFilter::schema(STORED_SCHEMA_KEY),
    )?;
    for row in stored {
      match SchemaDefinition::from_stored(&row.snapshot_content) {
        Ok(schema) => ctx.add_schema(schema),
        Err(error) => {
          tracing::warn!(
            %error,
            entity_id = %row.entity_id,
            "skipping invalid stored schema"
          );
        }
      }
    }

    ctx.cache_tables = cache::cache_tables(conn)?;
    ctx.build_views();
    tracing::debug!(
      schemas = ctx.schemas.len(),
      cache_tables = ctx.cache_tables.len(),
      "loaded preprocessor context"
    );
    Ok(ctx)
  }

  pub fn add_schema(&mut self, schema: SchemaDefinition) {
    let versions = self.schemas.entry(schema.key.clone()).or_default();
    match versions.iter().position(|s| s.version == schema.version) {
      Some(i) => versions[i] = schema,
      None => {
        versions.push(schema);
        versions.sort_by(|a, b| compare_versions(&a.version, &b.version));
      }
    }
  }

  /// A specific version of `key`, or its latest version when `version` is
  /// `None`.
  pub fn schema(
    &self,
    key: &str,
    version: Option<&str>,
  ) -> Option<&SchemaDefinition> {
    let versions = self.schemas.get(key)?;
    match version {
      Some(v) => versions.iter().find(|s| s.version == v),
      None => versions.last(),
    }
  }

  pub fn view(&self, name: &str) -> Option<&ViewDef> {
    self.views.get(&name.to_ascii_lowercase())
  }

  pub(super) fn build_views(&mut self) {
    self.views.insert("state".to_owned(), ViewDef {
      select:              "SELECT * FROM state_by_version".to_owned(),
      filter:              None,
      active_version_only: true,
    });
    for (key, versions) in &self.schemas {
      if RESERVED_VIEW_NAMES.contains(&key.as_str()) {
        continue;
      }
      let Some(latest) = versions.last() else { continue };
      let mut columns: Vec<String> = latest
        .property_names()
        .iter()
        .map(|p| {
          format!(
            "json_extract(snapshot_content, {}) AS {}",
            quote_literal(&json_path(p)),
            quote_ident(p)
          )
        })
        .collect();
      columns.extend(
        [
          "entity_id",
          "schema_key",
          "file_id",
          "version_id",
          "plugin_key",
          "change_id",
          "untracked",
        ]
        .iter()
        .map(|c| format!("{c} AS _{c}")),
      );
      let select =
        format!("SELECT {} FROM state_by_version", columns.join(", "));
      let filter = Some(format!("schema_key = {}", quote_literal(key)));

      self.views.insert(format!("{key}_by_version"), ViewDef {
        select:              select.clone(),
        filter:              filter.clone(),
        active_version_only: false,
      });
      self.views.insert(key.clone(), ViewDef {
        select,
        filter,
        active_version_only: true,
      });
    }
  }
}

fn json_path(property: &str) -> String {
  let simple = property
    .chars()
    .all(|c| c.is_ascii_alphanumeric() || c == '_');
  if simple {
    format!("$.{property}")
  } else {
    format!("$.\"{}\"", property.replace('"', "\\\""))
  }
}

/// Order dotted version strings numerically where both segments are
/// numbers, lexically otherwise.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
  let mut left = a.split('.');
  let mut right = b.split('.');
  loop {
    match (left.next(), right.next()) {
      (None, None) => return Ordering::Equal,
      (None, Some(_)) => return Ordering::Less,
      (Some(_), None) => return Ordering::Greater,
      (Some(x), Some(y)) => {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
          (Ok(x), Ok(y)) => x.cmp(&y),
          _ => x.cmp(y),
        };
        if ord != Ordering::Equal {
          return ord;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn versions_compare_numerically() {
    assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
    assert_eq!(compare_versions("1.0", "1.0"), Ordering::Equal);
    assert_eq!(compare_versions("1", "1.0"), Ordering::Less);
    assert_eq!(compare_versions("1.0-beta", "1.0-alpha"), Ordering::Greater);
  }

  #[test]
  fn latest_schema_wins_by_version() {
    let mut ctx = PreprocessorContext::default();
    for version in ["1.10", "1.2"] {
      ctx.add_schema(
        SchemaDefinition::parse(serde_json::json!({
          "type": "object",
          "x-lix-key": "todo",
          "x-lix-version": version,
          "properties": { "title": { "type": "string" } }
        }))
        .unwrap(),
      );
    }
    assert_eq!(ctx.schema("todo", None).unwrap().version, "1.10");
    assert_eq!(ctx.schema("todo", Some("1.2")).unwrap().version, "1.2");
    assert!(ctx.schema("todo", Some("3")).is_none());
  }

  #[test]
  fn views_filter_to_the_active_version() {
    let mut ctx = PreprocessorContext::default();
    ctx.add_schema(
      SchemaDefinition::parse(serde_json::json!({
        "type": "object",
        "x-lix-key": "todo",
        "x-lix-version": "1.0",
        "properties": { "title": { "type": "string" } }
      }))
      .unwrap(),
    );
    ctx.build_views();

    let state = ctx.view("STATE").unwrap().sql("v1");
    assert_eq!(state, "SELECT * FROM state_by_version WHERE version_id = 'v1'");

    let todo = ctx.view("todo").unwrap().sql("v1");
    assert!(todo.starts_with(
      "SELECT json_extract(snapshot_content, '$.title') AS \"title\""
    ));
    assert!(todo.ends_with("WHERE schema_key = 'todo' AND version_id = 'v1'"));

    let by_version = ctx.view("todo_by_version").unwrap().sql("v1");
    assert!(by_version.ends_with("WHERE schema_key = 'todo'"));
  }
}
