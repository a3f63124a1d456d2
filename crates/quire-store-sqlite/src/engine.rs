//! [`Engine`]: the async handle onto one Quire store.
//!
//! All database work runs on the `tokio_rusqlite` connection thread, one
//! closure per operation, each inside its own [`WriteTxn`]. Commit events are
//! delivered to subscribers after the closure returns, so handlers never run
//! for rolled-back work and may call back into the engine.

use std::{
  collections::BTreeSet,
  path::Path,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use quire_core::{
  change::{Change, NewChange},
  commit::{Commit, Traversal},
  deterministic::DeterministicConfig,
  hooks::{HookBus, StateCommitRow, Subscription},
  json_plugin::JsonObjectPlugin,
  plugin::Plugin,
  schema::{STORED_SCHEMA_KEY, SchemaDefinition, builtin_schemas},
  state::{NewState, StateAddress, StateRow},
  version::{GLOBAL_VERSION_ID, MAIN_VERSION_NAME, NewVersion, Version},
};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  Result, cache,
  cache::FreshReport,
  files::{FileHistoryEntry, FileRecord},
  graph,
  merge::{ChangeConflict, MergeOutcome},
  portable::{self, PortableStore},
  preprocess::{PreprocessOutput, PreprocessRequest, PreprocessorContext},
  schema::SCHEMA,
  sequence,
  txn::{QueryResult, WriteTxn, transact},
  version,
};

// ─── Configuration ───────────────────────────────────────────────────────────

/// Options for [`Engine::open`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Applied only when the store has no persisted setting of its own.
  pub deterministic:       Option<DeterministicConfig>,
  #[serde(skip)]
  pub plugins:             Vec<Arc<dyn Plugin>>,
  /// Upper bound on the hops of explicit history walks: ancestry queries,
  /// file history and `state_history`. Current state is never bounded.
  pub history_depth_limit: usize,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      deterministic:       None,
      plugins:             vec![Arc::new(JsonObjectPlugin)],
      history_depth_limit: 4096,
    }
  }
}

impl EngineConfig {
  pub fn deterministic(mut self, config: DeterministicConfig) -> Self {
    self.deterministic = Some(config);
    self
  }

  pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
    self.plugins.push(plugin);
    self
  }
}

impl std::fmt::Debug for EngineConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let plugins: Vec<&str> = self.plugins.iter().map(|p| p.key()).collect();
    f.debug_struct("EngineConfig")
      .field("deterministic", &self.deterministic)
      .field("plugins", &plugins)
      .field("history_depth_limit", &self.history_depth_limit)
      .finish()
  }
}

// ─── Shared state ────────────────────────────────────────────────────────────

/// Mutable engine state that outlives a single transaction.
#[derive(Debug, Default)]
pub struct EngineState {
  context: Option<Arc<PreprocessorContext>>,
}

impl EngineState {
  pub fn context(&self) -> Option<&Arc<PreprocessorContext>> {
    self.context.as_ref()
  }

  pub fn invalidate_context(&mut self) {
    if self.context.take().is_some() {
      tracing::debug!("invalidated preprocessor context");
    }
  }
}

pub(crate) struct Shared {
  pub(crate) state:         Arc<Mutex<EngineState>>,
  pub(crate) hooks:         HookBus,
  pub(crate) plugins:       Vec<Arc<dyn Plugin>>,
  pub(crate) deterministic: Option<DeterministicConfig>,
  pub(crate) depth_limit:   usize,
}

fn lock(state: &Mutex<EngineState>) -> MutexGuard<'_, EngineState> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
  pub(crate) fn invalidate_context(&self) {
    lock(&self.state).invalidate_context();
  }

  /// The memoized context, loaded from `conn` on first use.
  pub(crate) fn context(
    &self,
    conn: &Connection,
  ) -> Result<Arc<PreprocessorContext>> {
    let mut state = lock(&self.state);
    if let Some(ctx) = &state.context {
      return Ok(ctx.clone());
    }
    let ctx = Arc::new(PreprocessorContext::load(conn, &self.plugins)?);
    state.context = Some(ctx.clone());
    Ok(ctx)
  }

  pub(crate) fn plugin_for(&self, path: &str) -> Option<Arc<dyn Plugin>> {
    self.plugins.iter().find(|p| p.matches(path)).cloned()
  }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Cloning is cheap; clones share the connection, hooks and state.
#[derive(Clone)]
pub struct Engine {
  conn:   tokio_rusqlite::Connection,
  shared: Arc<Shared>,
}

impl std::fmt::Debug for Engine {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Engine")
      .field("hooks", &self.shared.hooks)
      .field("deterministic", &self.shared.deterministic)
      .finish_non_exhaustive()
  }
}

impl Engine {
  /// Open an in-memory engine, seeded from an exported blob when given.
  pub async fn open(blob: Option<&[u8]>, config: EngineConfig) -> Result<Self> {
    let seed = blob.map(portable::decode).transpose()?;
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::start(conn, seed, config).await
  }

  /// Open (or create) a store backed by the file at `path`.
  pub async fn open_path(
    path: impl AsRef<Path>,
    config: EngineConfig,
  ) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::start(conn, None, config).await
  }

  /// A fresh in-memory engine with the default configuration.
  pub async fn open_in_memory() -> Result<Self> {
    Self::open(None, EngineConfig::default()).await
  }

  async fn start(
    conn: tokio_rusqlite::Connection,
    seed: Option<PortableStore>,
    config: EngineConfig,
  ) -> Result<Self> {
    let mut schema_keys: BTreeSet<String> =
      builtin_schemas().into_iter().map(|s| s.key).collect();
    for plugin in &config.plugins {
      schema_keys.extend(plugin.schemas().into_iter().map(|s| s.key));
    }
    let requested = config.deterministic;
    let deterministic = conn
      .call(move |conn| Ok(initialize(conn, seed, requested, &schema_keys)))
      .await??;

    let state = Arc::new(Mutex::new(EngineState::default()));
    let hooks = HookBus::new();
    let watched = state.clone();
    // Dropping the handle keeps the subscription for the engine's lifetime.
    let _ = hooks.subscribe(move |rows| {
      if rows.iter().any(|r| r.schema_key == STORED_SCHEMA_KEY) {
        lock(&watched).invalidate_context();
      }
    });

    tracing::info!(
      deterministic = deterministic.is_some_and(|d| d.enabled),
      plugins = config.plugins.len(),
      "opened engine"
    );
    Ok(Self {
      conn,
      shared: Arc::new(Shared {
        state,
        hooks,
        plugins: config.plugins,
        deterministic,
        depth_limit: config.history_depth_limit,
      }),
    })
  }

  /// Run `f` inside one write transaction, then deliver its commit events.
  pub async fn transaction<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&mut WriteTxn<'_>) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    let shared = self.shared.clone();
    let (value, events) = self
      .conn
      .call(move |conn| Ok(transact(conn, &shared, f)))
      .await??;
    self.shared.hooks.emit(&events);
    Ok(value)
  }

  /// Run `f` with every write tagged by `key`.
  pub async fn with_writer_key<T, F>(
    &self,
    key: impl Into<String>,
    f: F,
  ) -> Result<T>
  where
    F: FnOnce(&mut WriteTxn<'_>) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    let key = key.into();
    self.transaction(move |txn| txn.with_writer_key(key, f)).await
  }

  pub fn hooks(&self) -> &HookBus { &self.shared.hooks }

  /// Subscribe to committed batches of state rows.
  pub fn on_state_commit<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&[StateCommitRow]) + Send + Sync + 'static,
  {
    self.shared.hooks.subscribe(handler)
  }

  /// The memoized preprocessor context.
  pub async fn context(&self) -> Result<Arc<PreprocessorContext>> {
    self.transaction(|txn| txn.context()).await
  }

  pub fn deterministic_config(&self) -> Option<DeterministicConfig> {
    self.shared.deterministic
  }

  // ── Schemas and state ───────────────────────────────────────────────────

  pub async fn register_schema(
    &self,
    document: Value,
  ) -> Result<SchemaDefinition> {
    self.transaction(move |txn| txn.register_schema(document)).await
  }

  pub async fn insert_state(&self, new: NewState) -> Result<StateCommitRow> {
    self.transaction(move |txn| txn.insert_state(new)).await
  }

  pub async fn delete_state(&self, address: StateAddress) -> Result<bool> {
    self.transaction(move |txn| txn.delete_state(&address)).await
  }

  pub async fn read(&self, address: StateAddress) -> Result<Option<StateRow>> {
    self.transaction(move |txn| txn.read(&address)).await
  }

  pub async fn ensure_fresh(
    &self,
    hint: Option<Vec<String>>,
  ) -> Result<FreshReport> {
    self
      .transaction(move |txn| txn.ensure_fresh(hint.as_deref()))
      .await
  }

  pub async fn preprocess(
    &self,
    request: PreprocessRequest,
  ) -> Result<PreprocessOutput> {
    self.transaction(move |txn| txn.preprocess(request)).await
  }

  pub async fn query(
    &self,
    sql: impl Into<String>,
    parameters: Vec<Value>,
  ) -> Result<QueryResult> {
    let sql = sql.into();
    self
      .transaction(move |txn| txn.query(&sql, parameters))
      .await
  }

  // ── Changes and history ─────────────────────────────────────────────────

  pub async fn record_change(&self, new: NewChange) -> Result<Change> {
    self.transaction(move |txn| txn.record_change(new)).await
  }

  pub async fn change(&self, id: impl Into<String>) -> Result<Option<Change>> {
    let id = id.into();
    self.transaction(move |txn| txn.change(&id)).await
  }

  pub async fn commit(&self, id: impl Into<String>) -> Result<Commit> {
    let id = id.into();
    self.transaction(move |txn| txn.commit(&id)).await
  }

  pub async fn ancestors_of(
    &self,
    commit_id: impl Into<String>,
    traversal: Traversal,
  ) -> Result<BTreeSet<String>> {
    let id = commit_id.into();
    self
      .transaction(move |txn| txn.ancestors_of(&id, traversal))
      .await
  }

  pub async fn descendants_of(
    &self,
    commit_id: impl Into<String>,
    traversal: Traversal,
  ) -> Result<BTreeSet<String>> {
    let id = commit_id.into();
    self
      .transaction(move |txn| txn.descendants_of(&id, traversal))
      .await
  }

  /// Minimum hop depth of every ancestor of `commit_id`, itself included.
  pub async fn ancestry_depths(
    &self,
    commit_id: impl Into<String>,
  ) -> Result<Vec<(String, usize)>> {
    let id = commit_id.into();
    self
      .transaction(move |txn| {
        let mut depths: Vec<(String, usize)> =
          graph::ancestry_depths(txn.connection(), &id, txn.depth_limit())?
            .into_iter()
            .collect();
        depths.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
        Ok(depths)
      })
      .await
  }

  // ── Versions ────────────────────────────────────────────────────────────

  pub async fn versions(&self) -> Result<Vec<Version>> {
    self.transaction(|txn| txn.versions()).await
  }

  pub async fn version(
    &self,
    id: impl Into<String>,
  ) -> Result<Option<Version>> {
    let id = id.into();
    self.transaction(move |txn| txn.version(&id)).await
  }

  pub async fn active_version(&self) -> Result<Version> {
    self.transaction(|txn| txn.active_version()).await
  }

  pub async fn create_version(&self, new: NewVersion) -> Result<Version> {
    self.transaction(move |txn| txn.create_version(new)).await
  }

  pub async fn switch_version(&self, id: impl Into<String>) -> Result<()> {
    let id = id.into();
    self.transaction(move |txn| txn.switch_version(&id)).await
  }

  pub async fn checkout(
    &self,
    commit_id: impl Into<String>,
  ) -> Result<Version> {
    let id = commit_id.into();
    self.transaction(move |txn| txn.checkout(&id)).await
  }

  pub async fn update_pointers(
    &self,
    version_id: impl Into<String>,
    change_ids: Vec<String>,
  ) -> Result<()> {
    let id = version_id.into();
    self
      .transaction(move |txn| txn.update_pointers(&id, &change_ids))
      .await
  }

  pub async fn update_conflict_pointers(
    &self,
    version_id: impl Into<String>,
    conflict_ids: Vec<String>,
  ) -> Result<usize> {
    let id = version_id.into();
    self
      .transaction(move |txn| txn.update_conflict_pointers(&id, &conflict_ids))
      .await
  }

  // ── Merge and conflicts ─────────────────────────────────────────────────

  pub async fn version_change_in_difference(
    &self,
    version_a: impl Into<String>,
    version_b: impl Into<String>,
  ) -> Result<Vec<Change>> {
    let (a, b) = (version_a.into(), version_b.into());
    self
      .transaction(move |txn| txn.version_change_in_difference(&a, &b))
      .await
  }

  pub async fn merge_version(
    &self,
    source: impl Into<String>,
    target: impl Into<String>,
  ) -> Result<MergeOutcome> {
    let (source, target) = (source.into(), target.into());
    self
      .transaction(move |txn| txn.merge_version(&source, &target))
      .await
  }

  pub async fn conflicts(
    &self,
    version_id: impl Into<String>,
  ) -> Result<Vec<ChangeConflict>> {
    let id = version_id.into();
    self.transaction(move |txn| txn.conflicts(&id)).await
  }

  pub async fn resolve_conflict(
    &self,
    version_id: impl Into<String>,
    conflict_id: impl Into<String>,
    change_id: impl Into<String>,
  ) -> Result<String> {
    let (version_id, conflict_id, change_id) =
      (version_id.into(), conflict_id.into(), change_id.into());
    self
      .transaction(move |txn| {
        txn.resolve_conflict(&version_id, &conflict_id, &change_id)
      })
      .await
  }

  // ── Files ───────────────────────────────────────────────────────────────

  pub async fn insert_file(
    &self,
    path: impl Into<String>,
    data: Vec<u8>,
  ) -> Result<FileRecord> {
    let path = path.into();
    self.transaction(move |txn| txn.insert_file(&path, data)).await
  }

  pub async fn update_file(
    &self,
    id: impl Into<String>,
    data: Vec<u8>,
  ) -> Result<FileRecord> {
    let id = id.into();
    self.transaction(move |txn| txn.update_file(&id, data)).await
  }

  pub async fn delete_file(&self, id: impl Into<String>) -> Result<()> {
    let id = id.into();
    self.transaction(move |txn| txn.delete_file(&id)).await
  }

  pub async fn file(
    &self,
    id: impl Into<String>,
    version_id: Option<String>,
  ) -> Result<FileRecord> {
    let id = id.into();
    self
      .transaction(move |txn| txn.file(&id, version_id.as_deref()))
      .await
  }

  pub async fn file_history(
    &self,
    file_id: impl Into<String>,
    root_commit_id: impl Into<String>,
  ) -> Result<Vec<FileHistoryEntry>> {
    let (file_id, root) = (file_id.into(), root_commit_id.into());
    self
      .transaction(move |txn| txn.file_history(&file_id, &root))
      .await
  }

  pub async fn apply_commit(
    &self,
    commit_id: impl Into<String>,
    target_version_id: impl Into<String>,
  ) -> Result<String> {
    let (commit_id, target) = (commit_id.into(), target_version_id.into());
    self
      .transaction(move |txn| txn.apply_commit(&commit_id, &target))
      .await
  }

  pub async fn apply_changes_to_file(
    &self,
    file_id: impl Into<String>,
    change_ids: Vec<String>,
  ) -> Result<Vec<u8>> {
    let file_id = file_id.into();
    self
      .transaction(move |txn| txn.apply_changes_to_file(&file_id, &change_ids))
      .await
  }

  // ── Sequence and maintenance ────────────────────────────────────────────

  pub async fn next_sequence_number(&self) -> Result<i64> {
    self.transaction(|txn| txn.next_sequence_number()).await
  }

  pub async fn deterministic_id(&self) -> Result<String> {
    self.transaction(|txn| txn.new_id()).await
  }

  pub async fn gc_snapshots(&self) -> Result<usize> {
    self.transaction(|txn| txn.gc_snapshots()).await
  }

  /// Serialize the whole store, cache tables included.
  pub async fn export(&self) -> Result<Vec<u8>> {
    self.transaction(|txn| txn.export()).await
  }
}

// ─── Initialization ──────────────────────────────────────────────────────────

/// Create the schema, import `seed`, settle the deterministic settings and
/// bootstrap a brand-new store. Returns the settings in effect.
fn initialize(
  conn: &mut Connection,
  seed: Option<PortableStore>,
  requested: Option<DeterministicConfig>,
  schema_keys: &BTreeSet<String>,
) -> Result<Option<DeterministicConfig>> {
  conn.execute_batch(SCHEMA)?;
  if let Some(seed) = seed {
    portable::import(conn, &seed)?;
  }

  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let mode = match sequence::load_config(&tx)? {
    Some(persisted) => Some(persisted),
    None => {
      if let Some(mode) = &requested {
        sequence::persist_config(&tx, mode)?;
      }
      requested
    }
  };
  if version::version(&tx, GLOBAL_VERSION_ID)?.is_none() {
    bootstrap(&tx, mode.as_ref())?;
  }
  for key in schema_keys {
    cache::ensure_cache_table(&tx, key)?;
  }
  tx.commit()?;
  Ok(mode)
}

/// `global` and `main`, each on an empty root commit; `main` is active.
fn bootstrap(
  conn: &Connection,
  mode: Option<&DeterministicConfig>,
) -> Result<()> {
  let created_at = sequence::timestamp(conn, mode)?;
  let main_id = sequence::generate_id(conn, mode)?;
  let levels = [
    (GLOBAL_VERSION_ID.to_owned(), GLOBAL_VERSION_ID, None),
    (main_id.clone(), MAIN_VERSION_NAME, Some(GLOBAL_VERSION_ID.to_owned())),
  ];
  for (id, name, inherits_from_version_id) in levels {
    let commit_set = sequence::generate_id(conn, mode)?;
    graph::insert_change_set(conn, &commit_set)?;
    let commit_id = sequence::generate_id(conn, mode)?;
    graph::insert_commit(conn, &commit_id, &commit_set, &[], created_at)?;

    let change_set_id = sequence::generate_id(conn, mode)?;
    graph::insert_change_set(conn, &change_set_id)?;
    version::insert_version(
      conn,
      &Version {
        id,
        name: name.to_owned(),
        commit_id,
        change_set_id,
        inherits_from_version_id,
        hidden: false,
      },
      created_at,
    )?;
  }
  version::set_active(conn, &main_id)?;
  cache::mark_stale(conn, GLOBAL_VERSION_ID)?;
  tracing::info!(main_version_id = %main_id, "bootstrapped new store");
  Ok(())
}
