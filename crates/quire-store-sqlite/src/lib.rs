//! SQLite engine for Quire.
//!
//! [`Engine`] owns one SQLite connection behind [`tokio_rusqlite`], so all
//! database work runs off the async runtime. Every public operation runs
//! inside a single [`WriteTxn`]: changes, commits, pointer updates and cache
//! invalidation land together or not at all.

mod encode;
mod schema;

pub mod blob_store;
pub mod cache;
pub mod change_store;
pub mod engine;
pub mod error;
pub mod files;
pub mod graph;
pub mod materialize;
pub mod merge;
pub mod portable;
pub mod preprocess;
pub mod sequence;
pub mod txn;
pub mod version;

pub use blob_store::SqliteBlobStore;
pub use engine::{Engine, EngineConfig, EngineState};
pub use error::{Error, Result};
pub use files::{FileHistoryEntry, FileRecord};
pub use merge::{ChangeConflict, MergeOutcome};
pub use txn::{Committed, QueryResult, WriteTxn};

#[cfg(test)]
mod tests;
