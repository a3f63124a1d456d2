//! [`WriteTxn`]: the single transaction every engine operation runs in.
//!
//! Each method is one multi-step write (record, commit, repoint, mark stale)
//! that either lands completely or rolls back with the transaction. Methods
//! freely call each other; nested calls join the open transaction.

use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Utc};
use quire_core::{
  change::{Change, NewChange},
  commit::Traversal,
  hooks::StateCommitRow,
  schema::{
    FILE_DESCRIPTOR_SCHEMA_KEY, STORED_SCHEMA_KEY,
    VERSION_DESCRIPTOR_SCHEMA_KEY, SchemaDefinition,
  },
  state::{
    NewState, OWN_ENTITY_FILE_ID, OWN_ENTITY_PLUGIN_KEY, StateAddress,
    StateRow,
  },
  version::{GLOBAL_VERSION_ID, NewVersion, Version},
};
use rusqlite::{Connection, TransactionBehavior, params, params_from_iter};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
  Error, Result, cache,
  cache::{CacheRead, FreshReport},
  change_store,
  encode::{encode_dt, encode_json, from_sql_value, to_sql_value},
  engine::Shared,
  graph::{self, Direction},
  materialize::{self, ResolveFilter},
  preprocess::{
    self, PreprocessOutput, PreprocessRequest, PreprocessorContext, TraceStep,
  },
  sequence, version,
};

/// Rows returned by [`WriteTxn::query`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
  pub columns: Vec<String>,
  pub rows:    Vec<Vec<Value>>,
}

/// Ids produced by one commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
  pub commit_id: String,
  pub changes:   Vec<Change>,
}

/// Run `f` inside one IMMEDIATE transaction and collect the commit events it
/// produced. Nothing is committed when `f` fails.
pub(crate) fn transact<T>(
  conn: &mut Connection,
  shared: &Shared,
  f: impl FnOnce(&mut WriteTxn<'_>) -> Result<T>,
) -> Result<(T, Vec<StateCommitRow>)> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let mut txn = WriteTxn::new(&tx, shared);
  let result = f(&mut txn);
  let (events, dirty) = txn.finish();
  if dirty {
    shared.invalidate_context();
  }
  let value = result?;
  tx.commit()?;
  Ok((value, events))
}

pub struct WriteTxn<'a> {
  pub(crate) conn:   &'a Connection,
  pub(crate) shared: &'a Shared,
  writer_key:        Option<String>,
  events:            Vec<StateCommitRow>,
  /// Context loaded inside this transaction after a schema or cache-table
  /// change; never published to the shared memo.
  context:           Option<Arc<PreprocessorContext>>,
  dirty:             bool,
}

impl<'a> WriteTxn<'a> {
  pub(crate) fn new(conn: &'a Connection, shared: &'a Shared) -> Self {
    Self {
      conn,
      shared,
      writer_key: None,
      events: Vec::new(),
      context: None,
      dirty: false,
    }
  }

  fn finish(self) -> (Vec<StateCommitRow>, bool) { (self.events, self.dirty) }

  pub fn connection(&self) -> &Connection { self.conn }

  pub fn depth_limit(&self) -> usize { self.shared.depth_limit }

  // ─── Writer identity ───────────────────────────────────────────────────────

  pub fn writer_key(&self) -> Option<&str> { self.writer_key.as_deref() }

  /// Tag every write made by `f` with `key`. The previous tag is restored
  /// afterwards, also when `f` fails.
  pub fn with_writer_key<T>(
    &mut self,
    key: impl Into<String>,
    f: impl FnOnce(&mut Self) -> Result<T>,
  ) -> Result<T> {
    let previous = self.writer_key.replace(key.into());
    let result = f(self);
    self.writer_key = previous;
    result
  }

  // ─── Context ───────────────────────────────────────────────────────────────

  /// The preprocessor context as seen by this transaction.
  pub fn context(&mut self) -> Result<Arc<PreprocessorContext>> {
    if let Some(ctx) = &self.context {
      return Ok(ctx.clone());
    }
    let ctx = if self.dirty {
      Arc::new(PreprocessorContext::load(self.conn, &self.shared.plugins)?)
    } else {
      self.shared.context(self.conn)?
    };
    self.context = Some(ctx.clone());
    Ok(ctx)
  }

  fn mark_dirty(&mut self) {
    self.dirty = true;
    self.context = None;
  }

  // ─── Sequence ──────────────────────────────────────────────────────────────

  pub fn new_id(&self) -> Result<String> {
    sequence::generate_id(self.conn, self.shared.deterministic.as_ref())
  }

  pub fn now(&self) -> Result<DateTime<Utc>> {
    sequence::timestamp(self.conn, self.shared.deterministic.as_ref())
  }

  pub fn next_sequence_number(&self) -> Result<i64> {
    sequence::next_sequence_number(
      self.conn,
      self.shared.deterministic.as_ref(),
    )
  }

  // ─── Changes and commits ───────────────────────────────────────────────────

  /// Record a change without committing it to any version.
  pub fn record_change(&mut self, new: NewChange) -> Result<Change> {
    let id = match &new.id {
      Some(id) => id.clone(),
      None => self.new_id()?,
    };
    let created_at = self.now()?;
    change_store::record_change(self.conn, id, new, created_at)
  }

  pub fn change(&self, id: &str) -> Result<Option<Change>> {
    change_store::change(self.conn, id)
  }

  pub fn commit(&self, id: &str) -> Result<quire_core::commit::Commit> {
    graph::commit(self.conn, id)
  }

  /// Record `changes` and commit them onto `version_id`.
  pub fn commit_changes(
    &mut self,
    version_id: &str,
    changes: Vec<NewChange>,
    extra_parents: &[String],
  ) -> Result<Committed> {
    let mut recorded = Vec::with_capacity(changes.len());
    for change in changes {
      recorded.push(self.record_change(change)?);
    }
    self.commit_existing(version_id, recorded, extra_parents)
  }

  /// Commit already-recorded changes onto `version_id`: new change set, new
  /// commit on top of the version tip, pointer updates and staleness.
  pub(crate) fn commit_existing(
    &mut self,
    version_id: &str,
    changes: Vec<Change>,
    extra_parents: &[String],
  ) -> Result<Committed> {
    let version = version::require_version(self.conn, version_id)?;

    let change_set_id = self.new_id()?;
    graph::insert_change_set(self.conn, &change_set_id)?;
    for change in &changes {
      graph::upsert_element(
        self.conn,
        &change_set_id,
        &change.id,
        &change.entity_key(),
      )?;
    }

    let commit_id = self.new_id()?;
    let mut parents = vec![version.commit_id.clone()];
    for parent in extra_parents {
      if !parents.contains(parent) {
        parents.push(parent.clone());
      }
    }
    let created_at = self.now()?;
    graph::insert_commit(
      self.conn,
      &commit_id,
      &change_set_id,
      &parents,
      created_at,
    )?;
    version::set_commit(self.conn, &version.id, &commit_id)?;
    version::update_pointers(self.conn, &version, &changes)?;

    let files = changes.iter().map(touched_file).collect();
    self.invalidate_version(&version.id, &files)?;

    for change in &changes {
      let snapshot_content =
        change_store::snapshot_content(self.conn, &change.snapshot_id)?;
      self.events.push(StateCommitRow {
        entity_id: change.entity_id.clone(),
        schema_key: change.schema_key.clone(),
        file_id: change.file_id.clone(),
        version_id: version.id.clone(),
        commit_id: Some(commit_id.clone()),
        change_id: Some(change.id.clone()),
        snapshot_content,
        untracked: false,
        writer_key: self.writer_key.clone(),
      });
    }
    Ok(Committed { commit_id, changes })
  }

  /// Mark `version_id` and its inheritors stale and drop their cached
  /// renderings of `files`.
  pub(crate) fn invalidate_version(
    &self,
    version_id: &str,
    files: &BTreeSet<String>,
  ) -> Result<()> {
    cache::mark_stale(self.conn, version_id)?;
    let mut versions = version::inheritors(self.conn, version_id)?;
    versions.insert(version_id.to_owned());
    for file_id in files.iter().filter(|f| *f != OWN_ENTITY_FILE_ID) {
      for version_id in &versions {
        self.conn.execute(
          "DELETE FROM file_data_cache WHERE file_id = ?1 AND version_id = ?2",
          params![file_id, version_id],
        )?;
      }
    }
    Ok(())
  }

  // ─── State writes ──────────────────────────────────────────────────────────

  /// Validate and write one entity, tracked or untracked.
  pub fn insert_state(&mut self, new: NewState) -> Result<StateCommitRow> {
    let version = self.version_or_active(new.version_id.as_deref())?;
    let ctx = self.context()?;
    let schema = ctx
      .schema(&new.schema_key, new.schema_version.as_deref())
      .cloned()
      .ok_or_else(|| quire_core::Error::SchemaNotFound {
        key:     new.schema_key.clone(),
        version: new.schema_version.clone(),
      })?;

    let mut content = new.snapshot_content;
    schema.apply_defaults(&mut content);
    schema.validate(&content)?;
    if schema.key == STORED_SCHEMA_KEY {
      SchemaDefinition::from_stored(&content)?;
    }
    let entity_id = match new.entity_id {
      Some(id) => id,
      None => schema.entity_id_for(&content)?.ok_or_else(|| {
        quire_core::Error::DataInvalid {
          schema_key: schema.key.clone(),
          path:       String::new(),
          value:      content.clone(),
          message:    "schema has no primary key; entity_id is required"
            .to_owned(),
        }
      })?,
    };

    let row = if new.untracked {
      self.write_untracked(&version.id, UntrackedRow {
        entity_id,
        schema_key: schema.key.clone(),
        file_id: new.file_id,
        plugin_key: new.plugin_key,
        schema_version: schema.version.clone(),
        content,
      })?
    } else {
      self.check_foreign_keys(&ctx, &schema, &content, &version.id)?;
      let address = StateAddress::new(
        entity_id.clone(),
        schema.key.clone(),
        new.file_id.clone(),
        version.id.clone(),
      );
      self.delete_untracked(&address)?;
      let committed = self.commit_changes(
        &version.id,
        vec![NewChange {
          id:               None,
          entity_id:        address.entity_id.clone(),
          schema_key:       schema.key.clone(),
          schema_version:   schema.version.clone(),
          file_id:          address.file_id.clone(),
          plugin_key:       new.plugin_key,
          snapshot_content: Some(content.clone()),
          metadata:         new.metadata,
        }],
        &[],
      )?;
      StateCommitRow {
        entity_id:        address.entity_id,
        schema_key:       address.schema_key,
        file_id:          address.file_id,
        version_id:       address.version_id,
        change_id:        committed.changes.first().map(|c| c.id.clone()),
        commit_id:        Some(committed.commit_id),
        snapshot_content: Some(content),
        untracked:        false,
        writer_key:       self.writer_key.clone(),
      }
    };

    if schema.key == STORED_SCHEMA_KEY {
      self.mark_dirty();
    }
    Ok(row)
  }

  /// Delete one entity. Removes the untracked row if there is one and
  /// tombstones whatever is still visible. Returns `false` when nothing was
  /// visible to delete.
  pub fn delete_state(&mut self, address: &StateAddress) -> Result<bool> {
    version::require_version(self.conn, &address.version_id)?;
    let removed = self.delete_untracked(address)?;
    if removed {
      self.invalidate_version(
        &address.version_id,
        &BTreeSet::from([address.file_id.clone()]),
      )?;
    }

    let visible = materialize::resolve_version(
      self.conn,
      &address.version_id,
      &filter_for(address),
    )?
    .into_iter()
    .next();

    match visible {
      Some(row) => {
        self.commit_changes(
          &address.version_id,
          vec![NewChange {
            id: None,
            entity_id: row.entity_id,
            schema_key: row.schema_key,
            schema_version: row.schema_version,
            file_id: row.file_id,
            plugin_key: row.plugin_key,
            snapshot_content: None,
            metadata: None,
          }],
          &[],
        )?;
        Ok(true)
      }
      None if removed => {
        self.events.push(StateCommitRow {
          entity_id:        address.entity_id.clone(),
          schema_key:       address.schema_key.clone(),
          file_id:          address.file_id.clone(),
          version_id:       address.version_id.clone(),
          commit_id:        None,
          change_id:        None,
          snapshot_content: None,
          untracked:        true,
          writer_key:       self.writer_key.clone(),
        });
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Store a schema in the global version and create its cache table.
  pub fn register_schema(
    &mut self,
    document: Value,
  ) -> Result<SchemaDefinition> {
    let schema = SchemaDefinition::parse(document)?;
    self.insert_state(
      NewState::new(STORED_SCHEMA_KEY, schema.to_stored())
        .in_version(GLOBAL_VERSION_ID),
    )?;
    cache::ensure_cache_table(self.conn, &schema.key)?;
    self.mark_dirty();
    tracing::debug!(
      schema_key = %schema.key,
      version = %schema.version,
      "registered schema"
    );
    Ok(schema)
  }

  fn write_untracked(
    &mut self,
    version_id: &str,
    row: UntrackedRow,
  ) -> Result<StateCommitRow> {
    let now = encode_dt(self.now()?);
    self.conn.execute(
      "INSERT INTO untracked_state
         (entity_id, schema_key, file_id, version_id, plugin_key,
          schema_version, snapshot_content, created_at, updated_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
       ON CONFLICT (entity_id, schema_key, file_id, version_id)
       DO UPDATE SET plugin_key       = excluded.plugin_key,
                     schema_version   = excluded.schema_version,
                     snapshot_content = excluded.snapshot_content,
                     updated_at       = excluded.updated_at",
      params![
        row.entity_id,
        row.schema_key,
        row.file_id,
        version_id,
        row.plugin_key,
        row.schema_version,
        encode_json(&row.content),
        now,
      ],
    )?;
    self.invalidate_version(
      version_id,
      &BTreeSet::from([row.file_id.clone()]),
    )?;

    let event = StateCommitRow {
      entity_id:        row.entity_id,
      schema_key:       row.schema_key,
      file_id:          row.file_id,
      version_id:       version_id.to_owned(),
      commit_id:        None,
      change_id:        None,
      snapshot_content: Some(row.content),
      untracked:        true,
      writer_key:       self.writer_key.clone(),
    };
    self.events.push(event.clone());
    Ok(event)
  }

  fn delete_untracked(&self, address: &StateAddress) -> Result<bool> {
    let removed = self.conn.execute(
      "DELETE FROM untracked_state
       WHERE entity_id = ?1 AND schema_key = ?2 AND file_id = ?3
         AND version_id = ?4",
      params![
        address.entity_id,
        address.schema_key,
        address.file_id,
        address.version_id
      ],
    )?;
    Ok(removed > 0)
  }

  /// Every foreign key that targets the referenced schema's primary key must
  /// resolve to a live entity in `version_id`.
  fn check_foreign_keys(
    &self,
    ctx: &PreprocessorContext,
    schema: &SchemaDefinition,
    content: &Value,
    version_id: &str,
  ) -> Result<()> {
    for fk in &schema.foreign_keys {
      let Some(target) = ctx.schema(&fk.references.schema_key, None) else {
        return Err(Error::ForeignKeyViolation {
          schema_key: schema.key.clone(),
          message:    format!(
            "referenced schema {} is not registered",
            fk.references.schema_key
          ),
        });
      };
      if target.primary_key != fk.references.properties {
        continue;
      }
      let incomplete = fk
        .properties
        .iter()
        .any(|p| content.get(p).is_none_or(Value::is_null));
      if incomplete {
        continue;
      }
      let entity_id = schema.key_for(&fk.properties, content)?;
      let filter = ResolveFilter {
        schema_key: Some(target.key.clone()),
        entity_id:  Some(entity_id.clone()),
        file_id:    None,
      };
      let found =
        materialize::resolve_version(self.conn, version_id, &filter)?;
      if found.is_empty() {
        return Err(Error::ForeignKeyViolation {
          schema_key: schema.key.clone(),
          message:    format!(
            "no {} entity {entity_id:?} in version {version_id}",
            target.key
          ),
        });
      }
    }
    Ok(())
  }

  // ─── Reads ─────────────────────────────────────────────────────────────────

  /// Cache-first read of one entity.
  pub fn read(&mut self, address: &StateAddress) -> Result<Option<StateRow>> {
    Ok(self.read_entry(address)?.row)
  }

  /// Like [`read`](Self::read), also reporting whether the cache served it.
  pub fn read_entry(&mut self, address: &StateAddress) -> Result<CacheRead> {
    let result = cache::read(self.conn, address)?;
    if result.table_created {
      self.mark_dirty();
    }
    Ok(result)
  }

  /// Resolve `version_id` from history, bypassing the cache.
  pub fn resolve(
    &self,
    version_id: &str,
    filter: &ResolveFilter,
  ) -> Result<Vec<StateRow>> {
    materialize::resolve_version(self.conn, version_id, filter)
  }

  pub fn ensure_fresh(
    &mut self,
    hint: Option<&[String]>,
  ) -> Result<FreshReport> {
    let report = cache::ensure_fresh(self.conn, hint)?;
    if report.tables_created {
      self.mark_dirty();
    }
    Ok(report)
  }

  pub fn preprocess(
    &mut self,
    request: PreprocessRequest,
  ) -> Result<PreprocessOutput> {
    let active = self.active_version_id()?;
    let ctx = self.context()?;
    let mut prepared = preprocess::prepare(&ctx, &active, request)?;

    if let Some(scope) = prepared.shape().cache_scope() {
      let report = self.ensure_fresh(scope.as_deref())?;
      tracing::debug!(
        refreshed = ?report.refreshed,
        "refreshed cache for query"
      );
      prepared.record(TraceStep::EnsureFresh, || {
        json!({
          "scope": scope,
          "refreshed": report.refreshed,
          "tables_created": report.tables_created,
        })
      });
    }

    let ctx = self.context()?;
    Ok(prepared.emit(&ctx, self.shared.depth_limit))
  }

  /// Preprocess and run a read query. Parameters bind positionally.
  pub fn query(
    &mut self,
    sql: &str,
    parameters: Vec<Value>,
  ) -> Result<QueryResult> {
    let output = self
      .preprocess(PreprocessRequest::new(sql).with_parameters(parameters))?;
    let values = output
      .parameters
      .iter()
      .map(to_sql_value)
      .collect::<Result<Vec<_>>>()?;

    let mut stmt = self.conn.prepare(&output.sql)?;
    let columns: Vec<String> =
      stmt.column_names().into_iter().map(str::to_owned).collect();
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    let mut result = QueryResult { columns, rows: Vec::new() };
    while let Some(row) = rows.next()? {
      let mut record = Vec::with_capacity(result.columns.len());
      for i in 0..result.columns.len() {
        record.push(from_sql_value(row.get_ref(i)?));
      }
      result.rows.push(record);
    }
    Ok(result)
  }

  // ─── History ───────────────────────────────────────────────────────────────

  pub fn ancestors_of(
    &self,
    commit_id: &str,
    traversal: Traversal,
  ) -> Result<BTreeSet<String>> {
    graph::walk(
      self.conn,
      commit_id,
      Direction::Parents,
      traversal,
      self.shared.depth_limit,
    )
  }

  pub fn descendants_of(
    &self,
    commit_id: &str,
    traversal: Traversal,
  ) -> Result<BTreeSet<String>> {
    graph::walk(
      self.conn,
      commit_id,
      Direction::Children,
      traversal,
      self.shared.depth_limit,
    )
  }

  // ─── Versions ──────────────────────────────────────────────────────────────

  pub fn active_version_id(&self) -> Result<String> {
    version::active_version_id(self.conn)
  }

  pub fn active_version(&self) -> Result<Version> {
    version::require_version(self.conn, &self.active_version_id()?)
  }

  pub fn version(&self, id: &str) -> Result<Option<Version>> {
    version::version(self.conn, id)
  }

  pub fn versions(&self) -> Result<Vec<Version>> {
    version::versions(self.conn)
  }

  pub(crate) fn version_or_active(&self, id: Option<&str>) -> Result<Version> {
    match id {
      Some(id) => version::require_version(self.conn, id),
      None => self.active_version(),
    }
  }

  /// Branch a new version off `new.parent` (the active version by default).
  pub fn create_version(&mut self, new: NewVersion) -> Result<Version> {
    let parent = self.version_or_active(new.parent.as_deref())?;
    let inherits = new
      .inherits_from_version_id
      .unwrap_or_else(|| GLOBAL_VERSION_ID.to_owned());
    version::require_version(self.conn, &inherits)?;

    let change_set_id = self.new_id()?;
    graph::insert_change_set(self.conn, &change_set_id)?;
    graph::copy_change_set(self.conn, &parent.change_set_id, &change_set_id)?;

    let id = match new.id {
      Some(id) => id,
      None => self.new_id()?,
    };
    let version = Version {
      name: new.name.unwrap_or_else(|| id.clone()),
      id,
      commit_id: parent.commit_id,
      change_set_id,
      inherits_from_version_id: Some(inherits),
      hidden: new.hidden,
    };
    self.insert_version(&version)?;
    tracing::debug!(
      version_id = %version.id,
      parent = %parent.id,
      "created version"
    );
    Ok(version)
  }

  pub fn switch_version(&mut self, version_id: &str) -> Result<()> {
    version::set_active(self.conn, version_id)
  }

  /// Create a version positioned at `commit_id` and make it active. Its
  /// pointer set holds the entity leaves as of that commit.
  pub fn checkout(&mut self, commit_id: &str) -> Result<Version> {
    graph::require_commit_exists(self.conn, commit_id)?;
    let leaves = materialize::resolve_at_commit(
      self.conn,
      commit_id,
      &ResolveFilter::default(),
    )?;

    let change_set_id = self.new_id()?;
    graph::insert_change_set(self.conn, &change_set_id)?;
    for (key, leaf) in &leaves {
      graph::upsert_element(self.conn, &change_set_id, &leaf.change.id, key)?;
    }

    let id = self.new_id()?;
    let version = Version {
      name: id.clone(),
      id,
      commit_id: commit_id.to_owned(),
      change_set_id,
      inherits_from_version_id: Some(GLOBAL_VERSION_ID.to_owned()),
      hidden: false,
    };
    self.insert_version(&version)?;
    version::set_active(self.conn, &version.id)?;
    tracing::debug!(version_id = %version.id, commit_id, "checked out");
    Ok(version)
  }

  fn insert_version(&mut self, version: &Version) -> Result<()> {
    version::insert_version(self.conn, version, self.now()?)?;
    cache::mark_stale(self.conn, &version.id)?;
    self.commit_changes(
      GLOBAL_VERSION_ID,
      vec![NewChange {
        id:               None,
        entity_id:        version.id.clone(),
        schema_key:       VERSION_DESCRIPTOR_SCHEMA_KEY.to_owned(),
        schema_version:   "1.0".to_owned(),
        file_id:          OWN_ENTITY_FILE_ID.to_owned(),
        plugin_key:       OWN_ENTITY_PLUGIN_KEY.to_owned(),
        snapshot_content: Some(json!({
          "id": version.id,
          "name": version.name,
          "inherits_from_version_id": version.inherits_from_version_id,
          "hidden": version.hidden,
        })),
        metadata:         None,
      }],
      &[],
    )?;
    Ok(())
  }

  /// Point `version_id`'s latest-pointer set at `change_ids`. Reads of the
  /// version and its inheritors see the new pointers right away.
  pub fn update_pointers(
    &mut self,
    version_id: &str,
    change_ids: &[String],
  ) -> Result<()> {
    let version = version::require_version(self.conn, version_id)?;
    let changes = change_ids
      .iter()
      .map(|id| change_store::require_change(self.conn, id))
      .collect::<Result<Vec<_>>>()?;
    version::update_pointers(self.conn, &version, &changes)?;
    if changes.iter().any(|c| c.schema_key == STORED_SCHEMA_KEY) {
      self.mark_dirty();
    }
    let files = changes.iter().map(touched_file).collect();
    self.invalidate_version(&version.id, &files)
  }

  /// Elements of `version_id`'s latest-pointer set.
  pub fn pointers(&self, version_id: &str) -> Result<Vec<Change>> {
    let version = version::require_version(self.conn, version_id)?;
    graph::change_set_changes(self.conn, &version.change_set_id)
  }

  pub fn update_conflict_pointers(
    &mut self,
    version_id: &str,
    conflict_ids: &[String],
  ) -> Result<usize> {
    version::update_conflict_pointers(self.conn, version_id, conflict_ids)
  }

  // ─── Maintenance ───────────────────────────────────────────────────────────

  pub fn gc_snapshots(&mut self) -> Result<usize> {
    change_store::gc_snapshots(self.conn)
  }

  pub fn export(&self) -> Result<Vec<u8>> { crate::portable::export(self.conn) }
}

struct UntrackedRow {
  entity_id:      String,
  schema_key:     String,
  file_id:        String,
  plugin_key:     String,
  schema_version: String,
  content:        Value,
}

fn filter_for(address: &StateAddress) -> ResolveFilter {
  ResolveFilter {
    schema_key: Some(address.schema_key.clone()),
    entity_id:  Some(address.entity_id.clone()),
    file_id:    Some(address.file_id.clone()),
  }
}

/// The user file a change affects; descriptors affect the file they
/// describe.
fn touched_file(change: &Change) -> String {
  if change.schema_key == FILE_DESCRIPTOR_SCHEMA_KEY {
    change.entity_id.clone()
  } else {
    change.file_id.clone()
  }
}
