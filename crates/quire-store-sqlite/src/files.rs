//! Files as projections of entities.
//!
//! A file is a descriptor entity plus whatever entities its plugin detected
//! in its bytes. Bytes are never the source of truth: they are rendered by
//! the plugin from the entities and kept in `file_data_cache` per version.

use std::{collections::BTreeMap, sync::Arc};

use quire_core::{
  change::{Change, NewChange},
  plugin::{FileSnapshot, Plugin, PluginChange},
  schema::FILE_DESCRIPTOR_SCHEMA_KEY,
  state::{OWN_ENTITY_FILE_ID, OWN_ENTITY_PLUGIN_KEY, StateRow},
};
use rusqlite::{OptionalExtension as _, params};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
  Error, Result, change_store, graph,
  materialize::{self, ResolveFilter},
  txn::WriteTxn,
};

/// A file as seen from one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
  pub id:         String,
  pub path:       String,
  pub version_id: String,
  pub data:       Vec<u8>,
}

/// The file as it was at one ancestor commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileHistoryEntry {
  pub commit_id: String,
  pub depth:     usize,
  pub path:      String,
  pub data:      Vec<u8>,
}

impl WriteTxn<'_> {
  // ─── Writes ────────────────────────────────────────────────────────────────

  /// Create a file in the active version from its initial bytes.
  pub fn insert_file(
    &mut self,
    path: &str,
    data: Vec<u8>,
  ) -> Result<FileRecord> {
    let plugin = self.plugin_for(path)?;
    let version_id = self.active_version_id()?;
    let id = self.new_id()?;

    let after = FileSnapshot {
      id:   id.clone(),
      path: path.to_owned(),
      data: Some(data),
    };
    let detected = plugin.detect_changes(None, &after)?;

    let mut changes = vec![self.descriptor_change(&id, Some(path))];
    changes.extend(self.entity_changes(&id, plugin.as_ref(), detected)?);
    self.commit_changes(&version_id, changes, &[])?;

    let data = after.data.unwrap_or_default();
    self.store_file_data(&id, &version_id, &data)?;
    tracing::debug!(file_id = %id, path, "inserted file");
    Ok(FileRecord { id, path: path.to_owned(), version_id, data })
  }

  /// Replace a file's bytes. Only the entities that changed are recorded;
  /// entities missing from `data` are tombstoned.
  pub fn update_file(&mut self, id: &str, data: Vec<u8>) -> Result<FileRecord> {
    let version_id = self.active_version_id()?;
    let path = self.require_path(id, &version_id)?;
    let plugin = self.plugin_for(&path)?;

    let before = FileSnapshot {
      id:   id.to_owned(),
      path: path.clone(),
      data: Some(self.file_data(id, &path, &version_id)?),
    };
    let after = FileSnapshot { data: Some(data), ..before.clone() };
    let detected = plugin.detect_changes(Some(&before), &after)?;
    if !detected.is_empty() {
      let changes = self.entity_changes(id, plugin.as_ref(), detected)?;
      self.commit_changes(&version_id, changes, &[])?;
    }

    let data = after.data.unwrap_or_default();
    self.store_file_data(id, &version_id, &data)?;
    Ok(FileRecord { id: id.to_owned(), path, version_id, data })
  }

  /// Tombstone a file's descriptor and every entity it holds.
  pub fn delete_file(&mut self, id: &str) -> Result<()> {
    let version_id = self.active_version_id()?;
    self.require_path(id, &version_id)?;

    let mut changes = vec![self.descriptor_change(id, None)];
    for row in self.file_entities(id, &version_id)? {
      changes.push(NewChange {
        id:               None,
        entity_id:        row.entity_id,
        schema_key:       row.schema_key,
        schema_version:   row.schema_version,
        file_id:          row.file_id,
        plugin_key:       row.plugin_key,
        snapshot_content: None,
        metadata:         None,
      });
    }
    self.commit_changes(&version_id, changes, &[])?;
    tracing::debug!(file_id = id, "deleted file");
    Ok(())
  }

  // ─── Reads ─────────────────────────────────────────────────────────────────

  /// Read a file in `version_id` (the active version by default).
  pub fn file(
    &mut self,
    id: &str,
    version_id: Option<&str>,
  ) -> Result<FileRecord> {
    let version = self.version_or_active(version_id)?;
    let path = self.require_path(id, &version.id)?;
    let data = self.file_data(id, &path, &version.id)?;
    Ok(FileRecord { id: id.to_owned(), path, version_id: version.id, data })
  }

  /// The file at every ancestor of `root_commit_id` (the root included)
  /// whose commit touched it, nearest first.
  pub fn file_history(
    &mut self,
    file_id: &str,
    root_commit_id: &str,
  ) -> Result<Vec<FileHistoryEntry>> {
    let depths =
      graph::ancestry_depths(self.conn, root_commit_id, self.depth_limit())?;
    let mut ordered: Vec<(usize, String)> =
      depths.into_iter().map(|(id, d)| (d, id)).collect();
    ordered.sort();

    let mut entries = Vec::new();
    for (depth, commit_id) in ordered {
      let touched = graph::commit_changes(self.conn, &commit_id)?
        .iter()
        .any(|c| belongs_to(c, file_id));
      if !touched {
        continue;
      }

      let descriptor = materialize::resolve_at_commit(
        self.conn,
        &commit_id,
        &descriptor_filter(file_id),
      )?
      .into_values()
      .next()
      .and_then(|r| r.content);
      let Some(path) = descriptor.as_ref().and_then(path_of) else {
        // Deleted as of this commit.
        continue;
      };

      let plugin = self.plugin_for(&path)?;
      let entities: Vec<PluginChange> = materialize::resolve_at_commit(
        self.conn,
        &commit_id,
        &file_filter(file_id),
      )?
      .into_values()
      .filter_map(|r| {
        r.content.map(|content| PluginChange {
          entity_id:        r.change.entity_id,
          schema_key:       r.change.schema_key,
          schema_version:   r.change.schema_version,
          snapshot_content: Some(content),
        })
      })
      .collect();
      let data = render(plugin.as_ref(), file_id, &path, &entities)?;
      entries.push(FileHistoryEntry { commit_id, depth, path, data });
    }
    Ok(entries)
  }

  // ─── Applying history ──────────────────────────────────────────────────────

  /// Commit `commit_id`'s changes onto `target_version_id` and re-render
  /// every file they touch. Fails as a whole when a file has no plugin or
  /// its plugin fails.
  pub fn apply_commit(
    &mut self,
    commit_id: &str,
    target_version_id: &str,
  ) -> Result<String> {
    let target = self.version_or_active(Some(target_version_id))?;
    let leaves = graph::commit_changes(self.conn, commit_id)?;

    let mut by_file: BTreeMap<String, Vec<Change>> = BTreeMap::new();
    for change in &leaves {
      if change.file_id != OWN_ENTITY_FILE_ID {
        by_file.entry(change.file_id.clone()).or_default().push(change.clone());
      }
    }

    let mut rendered = Vec::new();
    for (file_id, changes) in &by_file {
      let path = match self.descriptor_in(&leaves, file_id)? {
        Some(Some(path)) => path,
        // Deleted by this commit; nothing left to render.
        Some(None) => continue,
        None => self.require_path(file_id, &target.id)?,
      };
      let data = self.apply_to_bytes(file_id, &path, &target.id, changes)?;
      rendered.push((file_id.clone(), data));
    }

    let committed = self.commit_existing(
      &target.id,
      leaves,
      &[commit_id.to_owned()],
    )?;
    for (file_id, data) in rendered {
      self.store_file_data(&file_id, &target.id, &data)?;
    }
    tracing::debug!(
      commit_id,
      target = %target.id,
      files = by_file.len(),
      "applied commit"
    );
    Ok(committed.commit_id)
  }

  /// Apply recorded changes to one file in the active version and return
  /// its new bytes.
  pub fn apply_changes_to_file(
    &mut self,
    file_id: &str,
    change_ids: &[String],
  ) -> Result<Vec<u8>> {
    let version_id = self.active_version_id()?;
    let mut changes = Vec::with_capacity(change_ids.len());
    for id in change_ids {
      let change = change_store::require_change(self.conn, id)?;
      if !belongs_to(&change, file_id) {
        return Err(Error::ChangeDoesNotBelongToFile {
          change_id: change.id,
          file_id:   file_id.to_owned(),
        });
      }
      changes.push(change);
    }

    let path = match self.descriptor_in(&changes, file_id)? {
      Some(Some(path)) => path,
      Some(None) => {
        self.commit_existing(&version_id, changes, &[])?;
        return Ok(Vec::new());
      }
      None => self.require_path(file_id, &version_id)?,
    };
    let entity_changes: Vec<Change> = changes
      .iter()
      .filter(|c| c.file_id == file_id)
      .cloned()
      .collect();
    let data =
      self.apply_to_bytes(file_id, &path, &version_id, &entity_changes)?;
    self.commit_existing(&version_id, changes, &[])?;
    self.store_file_data(file_id, &version_id, &data)?;
    Ok(data)
  }

  // ─── Helpers ───────────────────────────────────────────────────────────────

  /// What a descriptor change among `changes` says about `file_id`:
  /// `Some(Some(path))` when it is written, `Some(None)` when it is
  /// tombstoned and `None` when no descriptor change is present.
  fn descriptor_in(
    &self,
    changes: &[Change],
    file_id: &str,
  ) -> Result<Option<Option<String>>> {
    let Some(descriptor) = changes.iter().find(|c| {
      c.schema_key == FILE_DESCRIPTOR_SCHEMA_KEY && c.entity_id == file_id
    }) else {
      return Ok(None);
    };
    let content =
      change_store::snapshot_content(self.conn, &descriptor.snapshot_id)?;
    Ok(Some(content.as_ref().and_then(path_of)))
  }

  fn plugin_for(&self, path: &str) -> Result<Arc<dyn Plugin>> {
    self
      .shared
      .plugin_for(path)
      .ok_or_else(|| Error::PluginMissing { path: path.to_owned() })
  }

  /// A descriptor write, or its tombstone when `path` is `None`.
  fn descriptor_change(&self, id: &str, path: Option<&str>) -> NewChange {
    NewChange {
      id:               None,
      entity_id:        id.to_owned(),
      schema_key:       FILE_DESCRIPTOR_SCHEMA_KEY.to_owned(),
      schema_version:   "1.0".to_owned(),
      file_id:          OWN_ENTITY_FILE_ID.to_owned(),
      plugin_key:       OWN_ENTITY_PLUGIN_KEY.to_owned(),
      snapshot_content: path
        .map(|p| json!({ "id": id, "path": p, "metadata": Value::Null })),
      metadata:         None,
    }
  }

  /// Turn plugin output into changes on `file_id`, validating content
  /// against the plugin's schemas when they are known.
  fn entity_changes(
    &mut self,
    file_id: &str,
    plugin: &dyn Plugin,
    detected: Vec<PluginChange>,
  ) -> Result<Vec<NewChange>> {
    let ctx = self.context()?;
    let mut changes = Vec::with_capacity(detected.len());
    for change in detected {
      if let (Some(content), Some(schema)) = (
        &change.snapshot_content,
        ctx.schema(&change.schema_key, Some(&change.schema_version)),
      ) {
        schema.validate(content)?;
      }
      changes.push(NewChange {
        id:               None,
        entity_id:        change.entity_id,
        schema_key:       change.schema_key,
        schema_version:   change.schema_version,
        file_id:          file_id.to_owned(),
        plugin_key:       plugin.key().to_owned(),
        snapshot_content: change.snapshot_content,
        metadata:         None,
      });
    }
    Ok(changes)
  }

  fn require_path(&self, file_id: &str, version_id: &str) -> Result<String> {
    materialize::resolve_version(
      self.conn,
      version_id,
      &descriptor_filter(file_id),
    )?
    .first()
    .and_then(|row| path_of(&row.snapshot_content))
    .ok_or_else(|| Error::FileNotFound(file_id.to_owned()))
  }

  fn file_entities(
    &self,
    file_id: &str,
    version_id: &str,
  ) -> Result<Vec<StateRow>> {
    materialize::resolve_version(self.conn, version_id, &file_filter(file_id))
  }

  /// Cached bytes, or a full render from the file's entities on a miss.
  fn file_data(
    &self,
    file_id: &str,
    path: &str,
    version_id: &str,
  ) -> Result<Vec<u8>> {
    let cached: Option<Vec<u8>> = self
      .conn
      .query_row(
        "SELECT data FROM file_data_cache
         WHERE file_id = ?1 AND version_id = ?2",
        params![file_id, version_id],
        |r| r.get(0),
      )
      .optional()?;
    if let Some(data) = cached {
      return Ok(data);
    }

    let plugin = self.plugin_for(path)?;
    let entities: Vec<PluginChange> = self
      .file_entities(file_id, version_id)?
      .into_iter()
      .map(|row| PluginChange {
        entity_id:        row.entity_id,
        schema_key:       row.schema_key,
        schema_version:   row.schema_version,
        snapshot_content: Some(row.snapshot_content),
      })
      .collect();
    let data = render(plugin.as_ref(), file_id, path, &entities)?;
    self.store_file_data(file_id, version_id, &data)?;
    Ok(data)
  }

  /// Current bytes of `file_id` with `changes` applied by its plugin.
  fn apply_to_bytes(
    &self,
    file_id: &str,
    path: &str,
    version_id: &str,
    changes: &[Change],
  ) -> Result<Vec<u8>> {
    let plugin = self.plugin_for(path)?;
    let prior = match self.require_path(file_id, version_id) {
      Ok(_) => Some(self.file_data(file_id, path, version_id)?),
      Err(Error::FileNotFound(_)) => None,
      Err(e) => return Err(e),
    };
    let mut batch = Vec::with_capacity(changes.len());
    for change in changes {
      batch.push(PluginChange {
        entity_id:        change.entity_id.clone(),
        schema_key:       change.schema_key.clone(),
        schema_version:   change.schema_version.clone(),
        snapshot_content: change_store::snapshot_content(
          self.conn,
          &change.snapshot_id,
        )?,
      });
    }
    let file = FileSnapshot {
      id:   file_id.to_owned(),
      path: path.to_owned(),
      data: prior,
    };
    Ok(plugin.apply_changes(&file, &batch)?)
  }

  fn store_file_data(
    &self,
    file_id: &str,
    version_id: &str,
    data: &[u8],
  ) -> Result<()> {
    self.conn.execute(
      "INSERT INTO file_data_cache (file_id, version_id, data)
       VALUES (?1, ?2, ?3)
       ON CONFLICT (file_id, version_id) DO UPDATE SET data = excluded.data",
      params![file_id, version_id, data],
    )?;
    Ok(())
  }
}

fn render(
  plugin: &dyn Plugin,
  file_id: &str,
  path: &str,
  entities: &[PluginChange],
) -> Result<Vec<u8>> {
  let empty = FileSnapshot {
    id:   file_id.to_owned(),
    path: path.to_owned(),
    data: None,
  };
  Ok(plugin.apply_changes(&empty, entities)?)
}

fn descriptor_filter(file_id: &str) -> ResolveFilter {
  ResolveFilter {
    schema_key: Some(FILE_DESCRIPTOR_SCHEMA_KEY.to_owned()),
    entity_id:  Some(file_id.to_owned()),
    file_id:    Some(OWN_ENTITY_FILE_ID.to_owned()),
  }
}

fn file_filter(file_id: &str) -> ResolveFilter {
  ResolveFilter { file_id: Some(file_id.to_owned()), ..Default::default() }
}

fn path_of(content: &Value) -> Option<String> {
  content.get("path").and_then(Value::as_str).map(str::to_owned)
}

/// Whether `change` is one of the file's entities or its descriptor.
fn belongs_to(change: &Change, file_id: &str) -> bool {
  change.file_id == file_id
    || (change.schema_key == FILE_DESCRIPTOR_SCHEMA_KEY
      && change.entity_id == file_id)
}
