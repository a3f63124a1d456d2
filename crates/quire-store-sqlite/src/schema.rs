//! SQL schema for the Quire SQLite store.
//!
//! The fixed tables hold the change log, the commit DAG, version pointers
//! and conflict bookkeeping; [`SCHEMA`] is applied on every open and records
//! its layout in `user_version`. Each registered schema additionally gets a
//! state cache table, created the first time it is needed from
//! [`cache_table_ddl`].

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Content-addressed and immutable. 'no-content' is the tombstone.
CREATE TABLE IF NOT EXISTS snapshot (
    id       TEXT PRIMARY KEY,
    content  TEXT              -- canonical JSON; NULL only for the tombstone
);

INSERT OR IGNORE INTO snapshot (id, content) VALUES ('no-content', NULL);

-- Changes are strictly append-only.
-- No UPDATE or DELETE is ever issued against this table.
CREATE TABLE IF NOT EXISTS change (
    id              TEXT PRIMARY KEY,
    entity_id       TEXT NOT NULL,
    schema_key      TEXT NOT NULL,
    schema_version  TEXT NOT NULL,
    file_id         TEXT NOT NULL,
    plugin_key      TEXT NOT NULL,
    snapshot_id     TEXT NOT NULL REFERENCES snapshot(id),
    metadata        TEXT,             -- JSON or NULL
    created_at      TEXT NOT NULL,    -- RFC 3339 UTC
    UNIQUE (id, entity_id, file_id, schema_key)
);

CREATE TABLE IF NOT EXISTS change_set (
    id  TEXT PRIMARY KEY
);

-- One pointer per entity per set. Commit sets are written once; version
-- pointer sets are upserted in place.
CREATE TABLE IF NOT EXISTS change_set_element (
    change_set_id  TEXT NOT NULL REFERENCES change_set(id),
    change_id      TEXT NOT NULL REFERENCES change(id),
    entity_id      TEXT NOT NULL,
    schema_key     TEXT NOT NULL,
    file_id        TEXT NOT NULL,
    UNIQUE (change_set_id, entity_id, schema_key, file_id)
);

CREATE TABLE IF NOT EXISTS commits (
    id                  TEXT PRIMARY KEY,
    change_set_id       TEXT NOT NULL REFERENCES change_set(id),
    author_account_ids  TEXT NOT NULL DEFAULT '[]',
    meta_change_ids     TEXT NOT NULL DEFAULT '[]',
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS commit_edge (
    parent_id  TEXT NOT NULL REFERENCES commits(id),
    child_id   TEXT NOT NULL REFERENCES commits(id),
    -- 0 for the first parent: the tip of the version the commit landed on.
    position   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (parent_id, child_id),
    CHECK (parent_id != child_id)
);

CREATE TABLE IF NOT EXISTS version (
    id                        TEXT PRIMARY KEY,
    name                      TEXT NOT NULL UNIQUE,
    commit_id                 TEXT NOT NULL REFERENCES commits(id),
    change_set_id             TEXT NOT NULL REFERENCES change_set(id),
    inherits_from_version_id  TEXT,
    hidden                    INTEGER NOT NULL DEFAULT 0,
    created_at                TEXT NOT NULL
);

-- Singleton row naming the active version.
CREATE TABLE IF NOT EXISTS active_version (
    singleton   INTEGER PRIMARY KEY CHECK (singleton = 0),
    version_id  TEXT NOT NULL REFERENCES version(id)
);

-- Mutable state that never produces history.
CREATE TABLE IF NOT EXISTS untracked_state (
    entity_id         TEXT NOT NULL,
    schema_key        TEXT NOT NULL,
    file_id           TEXT NOT NULL,
    version_id        TEXT NOT NULL,
    plugin_key        TEXT NOT NULL,
    schema_version    TEXT NOT NULL,
    snapshot_content  TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    PRIMARY KEY (entity_id, schema_key, file_id, version_id)
);

CREATE TABLE IF NOT EXISTS change_conflict (
    id          TEXT PRIMARY KEY,
    entity_id   TEXT NOT NULL,
    schema_key  TEXT NOT NULL,
    file_id     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS change_conflict_element (
    conflict_id  TEXT NOT NULL REFERENCES change_conflict(id) ON DELETE CASCADE,
    change_id    TEXT NOT NULL REFERENCES change(id),
    PRIMARY KEY (conflict_id, change_id)
);

CREATE TABLE IF NOT EXISTS version_change_conflict (
    version_id   TEXT NOT NULL REFERENCES version(id),
    conflict_id  TEXT NOT NULL REFERENCES change_conflict(id) ON DELETE CASCADE,
    PRIMARY KEY (version_id, conflict_id)
);

-- schema_key -> name of its state cache table.
CREATE TABLE IF NOT EXISTS cache_table (
    schema_key  TEXT PRIMARY KEY,
    table_name  TEXT NOT NULL UNIQUE
);

-- Version ids whose cache rows are out of date; '*' means every version.
CREATE TABLE IF NOT EXISTS cache_stale (
    scope  TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS file_data_cache (
    file_id     TEXT NOT NULL,
    version_id  TEXT NOT NULL,
    data        BLOB NOT NULL,
    PRIMARY KEY (file_id, version_id)
);

CREATE TABLE IF NOT EXISTS key_value (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL   -- JSON
);

-- Blobs served by the sync server.
CREATE TABLE IF NOT EXISTS blob (
    id          TEXT PRIMARY KEY,
    data        BLOB NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS change_entity_idx     ON change(entity_id, schema_key, file_id);
CREATE INDEX IF NOT EXISTS change_file_idx       ON change(file_id);
CREATE INDEX IF NOT EXISTS commit_edge_child_idx ON commit_edge(child_id);
CREATE INDEX IF NOT EXISTS cse_change_idx        ON change_set_element(change_id);

PRAGMA user_version = 1;
";

/// Name of the cache table for `schema_key`. Schema keys are restricted to
/// `[a-z0-9_]+`, so the result is always a plain identifier.
pub fn cache_table_name(schema_key: &str) -> String {
  format!("state_cache_{schema_key}")
}

/// Columns of every cache table, in storage order.
pub const CACHE_COLUMNS: &[&str] = &[
  "entity_id",
  "schema_key",
  "file_id",
  "version_id",
  "plugin_key",
  "snapshot_content",
  "schema_version",
  "created_at",
  "updated_at",
  "change_id",
  "commit_id",
  "inherited_from_version_id",
  "untracked",
];

pub fn cache_table_ddl(table_name: &str) -> String {
  format!(
    "CREATE TABLE IF NOT EXISTS {table_name} (
        entity_id                  TEXT NOT NULL,
        schema_key                 TEXT NOT NULL,
        file_id                    TEXT NOT NULL,
        version_id                 TEXT NOT NULL,
        plugin_key                 TEXT NOT NULL,
        snapshot_content           TEXT NOT NULL,
        schema_version             TEXT NOT NULL,
        created_at                 TEXT NOT NULL,
        updated_at                 TEXT NOT NULL,
        change_id                  TEXT,
        commit_id                  TEXT,
        inherited_from_version_id  TEXT,
        untracked                  INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (entity_id, file_id, version_id)
    );"
  )
}
