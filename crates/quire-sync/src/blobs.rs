//! Handlers for the blob endpoints.
//!
//! | Method | Path   | Body                  | Success                      |
//! |--------|--------|-----------------------|------------------------------|
//! | `POST` | `/new` | `{"id", "blob": b64}` | 201 `{"id"}`; 409 if taken   |
//! | `POST` | `/get` | `{"id"}`              | 200 raw bytes; 404 if absent |
//!
//! Bodies are parsed by hand so that malformed JSON and missing fields both
//! surface as 400.

use std::sync::Arc;

use axum::{
  Json,
  extract::State,
  http::{StatusCode, header},
  response::IntoResponse,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use bytes::Bytes;
use quire_core::store::{BlobInsert, BlobStore};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;

use crate::error::ApiError;

fn parse<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
  serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

// ─── New ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct NewBody {
  pub id:   String,
  /// Standard base64.
  pub blob: String,
}

/// `POST /new`
pub async fn create<S>(
  State(store): State<Arc<S>>,
  body: Bytes,
) -> Result<impl IntoResponse, ApiError>
where
  S: BlobStore,
{
  let NewBody { id, blob } = parse(&body)?;
  let data = B64
    .decode(blob.as_bytes())
    .map_err(|e| ApiError::BadRequest(format!("blob is not base64: {e}")))?;

  let size = data.len();
  match store
    .create_blob(id.clone(), data)
    .await
    .map_err(|e| ApiError::Store(Box::new(e)))?
  {
    BlobInsert::Created => {
      tracing::info!(%id, size, "stored blob");
      Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
    }
    BlobInsert::AlreadyExists => {
      Err(ApiError::Conflict(format!("blob {id} already exists")))
    }
  }
}

// ─── Get ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GetBody {
  pub id: String,
}

/// `POST /get`
pub async fn get_one<S>(
  State(store): State<Arc<S>>,
  body: Bytes,
) -> Result<impl IntoResponse, ApiError>
where
  S: BlobStore,
{
  let GetBody { id } = parse(&body)?;
  let data = store
    .get_blob(id.clone())
    .await
    .map_err(|e| ApiError::Store(Box::new(e)))?
    .ok_or_else(|| ApiError::NotFound(format!("blob {id}")))?;
  Ok((
    StatusCode::OK,
    [(header::CONTENT_TYPE, "application/octet-stream")],
    data,
  ))
}
