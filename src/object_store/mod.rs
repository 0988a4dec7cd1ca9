mod gcs;
mod local;

pub use gcs::GcsStore;
pub use local::LocalStore;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid object key: {0}")]
    InvalidKey(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Abstraction over object storage backends.
///
/// Keys are opaque to the store. The only structure the rest of the crate
/// relies on is the per-owner prefix used for bulk deletion.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes, content_type: &str)
        -> Result<(), ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;
    /// Deleting a key that does not exist succeeds.
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;
    /// All keys starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    /// Enumerate keys under `prefix`, then delete them as a batch.
    /// An empty prefix listing is a successful no-op.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, ObjectStoreError> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len() as u64)
    }
}

/// Key prefix under which all of an owner's blobs live.
pub fn owner_prefix(owner_id: &str) -> String {
    format!("{owner_id}/")
}

/// Object key for a file's primary blob.
pub fn object_key(owner_id: &str, file_id: &str, extension: &str) -> String {
    format!("{owner_id}/{file_id}{extension}")
}
