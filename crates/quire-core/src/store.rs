//! The `BlobStore` trait backing the sync server.
//!
//! The trait is implemented by storage backends (e.g. `quire-store-sqlite`).
//! The sync router depends on this abstraction, not on any concrete backend.

use std::future::Future;

/// Outcome of [`BlobStore::create_blob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobInsert {
  Created,
  /// A blob with this id already exists; nothing was written.
  AlreadyExists,
}

/// Id-addressed storage for portable store blobs.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes (e.g. tokio with `axum`).
pub trait BlobStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Store `blob` under `id`. Existing blobs are never overwritten.
  fn create_blob(
    &self,
    id: String,
    blob: Vec<u8>,
  ) -> impl Future<Output = Result<BlobInsert, Self::Error>> + Send + '_;

  /// Fetch a blob by id. Returns `None` if not found.
  fn get_blob(
    &self,
    id: String,
  ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send + '_;
}
