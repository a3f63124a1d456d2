//! Core types and trait definitions for the Quire data engine.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! All other crates depend on it; it depends on nothing proprietary.

pub mod change;
pub mod commit;
pub mod deterministic;
pub mod error;
pub mod hooks;
pub mod json_plugin;
pub mod plugin;
pub mod schema;
pub mod state;
pub mod store;
pub mod version;

mod validate;

pub use error::{Error, Result};
