//! Blob sync server for Quire.
//!
//! Clients push exported stores with `POST /new` and pull them back with
//! `POST /get`. Blobs are write-once: a second push under the same id is
//! rejected with 409 and leaves the first blob untouched.
//!
//! The router is generic over [`quire_core::store::BlobStore`], so tests can
//! run it against an in-memory backend.
//!
//! ```rust,ignore
//! let store = Arc::new(SqliteBlobStore::open("sync.sqlite").await?);
//! axum::serve(listener, quire_sync::sync_router(store)).await?;
//! ```

pub mod blobs;
pub mod error;

use std::{path::PathBuf, sync::Arc};

use axum::{Router, routing::post};
use quire_core::store::BlobStore;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

pub use error::ApiError;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Server configuration, deserialised from a TOML file with `QUIRE_*`
/// environment overrides.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
  pub host:       String,
  pub port:       u16,
  pub store_path: PathBuf,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      host:       "127.0.0.1".to_string(),
      port:       3000,
      store_path: PathBuf::from("quire-sync.sqlite"),
    }
  }
}

impl ServerConfig {
  pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Build the sync [`Router`] over `store`.
pub fn sync_router<S>(store: Arc<S>) -> Router
where
  S: BlobStore + 'static,
{
  Router::new()
    .route("/new", post(blobs::create::<S>))
    .route("/get", post(blobs::get_one::<S>))
    .layer(TraceLayer::new_for_http())
    .with_state(store)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use axum::{
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
  };
  use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
  use quire_store_sqlite::SqliteBlobStore;
  use serde_json::{Value, json};
  use tower::ServiceExt;

  use super::*;

  async fn app() -> Router {
    let store = SqliteBlobStore::open_in_memory().await.unwrap();
    sync_router(Arc::new(store))
  }

  async fn post(app: &Router, path: &str, body: impl Into<Body>) -> Response {
    let req = Request::builder()
      .method("POST")
      .uri(path)
      .header(header::CONTENT_TYPE, "application/json")
      .body(body.into())
      .unwrap();
    app.clone().oneshot(req).await.unwrap()
  }

  async fn body_bytes(resp: Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), usize::MAX)
      .await
      .unwrap()
      .to_vec()
  }

  fn new_body(id: &str, blob: &[u8]) -> String {
    json!({ "id": id, "blob": B64.encode(blob) }).to_string()
  }

  #[tokio::test]
  async fn pushed_blobs_come_back_verbatim() {
    let app = app().await;
    let resp = post(&app, "/new", new_body("a", b"\x00\x01store")).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body["id"], "a");

    let resp = post(&app, "/get", json!({ "id": "a" }).to_string()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
      resp.headers().get(header::CONTENT_TYPE).unwrap(),
      "application/octet-stream"
    );
    assert_eq!(body_bytes(resp).await, b"\x00\x01store");
  }

  #[tokio::test]
  async fn second_push_conflicts_and_keeps_the_first() {
    let app = app().await;
    post(&app, "/new", new_body("a", b"first")).await;
    let resp = post(&app, "/new", new_body("a", b"second")).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert!(body["error"].is_string());

    let resp = post(&app, "/get", json!({ "id": "a" }).to_string()).await;
    assert_eq!(body_bytes(resp).await, b"first");
  }

  #[tokio::test]
  async fn unknown_ids_are_not_found() {
    let app = app().await;
    let resp = post(&app, "/get", json!({ "id": "nope" }).to_string()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn malformed_bodies_are_bad_requests() {
    let app = app().await;
    for (path, body) in [
      ("/new", "not json".to_string()),
      ("/new", json!({ "id": "a" }).to_string()),
      ("/new", json!({ "id": "a", "blob": "!!!" }).to_string()),
      ("/get", json!({}).to_string()),
      ("/get", String::new()),
    ] {
      let resp = post(&app, path, body.clone()).await;
      assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{path} {body}");
    }
  }

  #[test]
  fn config_defaults_fill_missing_fields() {
    let cfg: ServerConfig = config::Config::builder()
      .set_override("port", 8080)
      .unwrap()
      .build()
      .unwrap()
      .try_deserialize()
      .unwrap();
    assert_eq!(cfg.address(), "127.0.0.1:8080");
    assert_eq!(cfg.store_path, PathBuf::from("quire-sync.sqlite"));
  }
}
