//! [`SqliteBlobStore`]: the SQLite implementation of [`BlobStore`].

use std::{future::Future, path::Path};

use chrono::Utc;
use quire_core::store::{BlobInsert, BlobStore};
use rusqlite::{OptionalExtension as _, params};

use crate::{Error, Result, encode::encode_dt, schema::SCHEMA};

/// Id-addressed blob storage in the `blob` table.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteBlobStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteBlobStore {
  /// Open (or create) a blob store at `path`.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

impl BlobStore for SqliteBlobStore {
  type Error = Error;

  fn create_blob(
    &self,
    id: String,
    blob: Vec<u8>,
  ) -> impl Future<Output = Result<BlobInsert>> + Send + '_ {
    async move {
      let created_at = encode_dt(Utc::now());
      let inserted = self
        .conn
        .call(move |conn| {
          Ok(conn.execute(
            "INSERT OR IGNORE INTO blob (id, data, created_at)
             VALUES (?1, ?2, ?3)",
            params![id, blob, created_at],
          )?)
        })
        .await?;
      Ok(if inserted == 0 {
        BlobInsert::AlreadyExists
      } else {
        BlobInsert::Created
      })
    }
  }

  fn get_blob(
    &self,
    id: String,
  ) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send + '_ {
    async move {
      let data = self
        .conn
        .call(move |conn| {
          Ok(
            conn
              .query_row("SELECT data FROM blob WHERE id = ?1", [id], |r| {
                r.get(0)
              })
              .optional()?,
          )
        })
        .await?;
      Ok(data)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn blobs_are_never_overwritten() {
    let store = SqliteBlobStore::open_in_memory().await.unwrap();
    let first = store.create_blob("a".into(), vec![1, 2]).await.unwrap();
    let second = store.create_blob("a".into(), vec![3]).await.unwrap();
    assert_eq!(first, BlobInsert::Created);
    assert_eq!(second, BlobInsert::AlreadyExists);
    assert_eq!(
      store.get_blob("a".into()).await.unwrap(),
      Some(vec![1, 2])
    );
  }

  #[tokio::test]
  async fn missing_blobs_are_none() {
    let store = SqliteBlobStore::open_in_memory().await.unwrap();
    assert_eq!(store.get_blob("nope".into()).await.unwrap(), None);
  }
}
