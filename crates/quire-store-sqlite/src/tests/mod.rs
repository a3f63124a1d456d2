//! Integration tests for [`Engine`] against an in-memory database.

mod files;
mod history;
mod hooks;
mod merge;
mod query;

use quire_core::deterministic::DeterministicConfig;
use serde_json::{Value, json};

use crate::{Engine, EngineConfig};

/// A deterministic in-memory engine.
async fn engine() -> Engine {
  Engine::open(None, config()).await.expect("in-memory engine")
}

fn config() -> EngineConfig {
  EngineConfig::default().deterministic(DeterministicConfig::default())
}

fn todo_schema() -> Value {
  json!({
    "type": "object",
    "x-lix-key": "todo",
    "x-lix-version": "1.0",
    "x-lix-primary-key": ["id"],
    "properties": {
      "id":    { "type": "string" },
      "title": { "type": "string" },
      "done":  { "type": "boolean" }
    },
    "required": ["id", "title"]
  })
}

/// An engine with the `todo` schema registered.
async fn todo_engine() -> Engine {
  let engine = engine().await;
  engine.register_schema(todo_schema()).await.unwrap();
  engine
}

async fn main_id(engine: &Engine) -> String {
  engine.active_version().await.unwrap().id
}
