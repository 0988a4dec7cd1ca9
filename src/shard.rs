//! Owner-to-shard routing.
//!
//! A user's file metadata lives in exactly one shard, picked by hashing the
//! owner id. The router is built once at startup from a fixed list of shard
//! stores and never changes afterwards.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::storage::{Database, DatabaseError, MetadataStore};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a 32-bit hash.
fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Map an owner id to a shard index in `[0, shard_count)`.
///
/// Deterministic across calls and process restarts. Total over every input,
/// including the empty string.
///
/// # Panics
///
/// Panics if `shard_count` is zero. The router never calls it that way.
pub fn resolve(owner_id: &str, shard_count: usize) -> usize {
    assert!(shard_count > 0, "shard_count must be positive");
    (fnv1a32(owner_id.as_bytes()) as usize) % shard_count
}

#[derive(Debug, Error)]
pub enum ShardRouterError {
    #[error("at least one shard is required")]
    NoShards,
    #[error("failed to open shard {index}: {source}")]
    Open {
        index: usize,
        #[source]
        source: DatabaseError,
    },
}

/// Failure of a deadline-bounded call into one shard.
#[derive(Debug, Error)]
pub enum ShardCallError {
    #[error("shard {shard} did not answer within {deadline:?}")]
    DeadlineExceeded { shard: usize, deadline: Duration },
    #[error("shard {shard}: {source}")]
    Storage {
        shard: usize,
        #[source]
        source: DatabaseError,
    },
    #[error("shard {shard} task failed: {message}")]
    Task { shard: usize, message: String },
}

/// The only component allowed to decide which shard owns a user.
pub struct ShardRouter {
    shards: Vec<Arc<dyn MetadataStore>>,
}

impl ShardRouter {
    /// Build a router over already-open stores. Index `i` in `shards` is shard `i`.
    pub fn new(shards: Vec<Arc<dyn MetadataStore>>) -> Result<Self, ShardRouterError> {
        if shards.is_empty() {
            return Err(ShardRouterError::NoShards);
        }
        Ok(Self { shards })
    }

    /// Open (or create) `shard_count` redb shards under `data_dir`.
    pub fn open<P: AsRef<Path>>(data_dir: P, shard_count: usize) -> Result<Self, ShardRouterError> {
        if shard_count == 0 {
            return Err(ShardRouterError::NoShards);
        }

        let mut shards: Vec<Arc<dyn MetadataStore>> = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let db = Database::open_shard(data_dir.as_ref(), index, shard_count)
                .map_err(|source| ShardRouterError::Open { index, source })?;
            shards.push(Arc::new(db));
        }

        Self::new(shards)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_index(&self, owner_id: &str) -> usize {
        resolve(owner_id, self.shards.len())
    }

    /// The store holding `owner_id`'s records.
    pub fn store_for(&self, owner_id: &str) -> &Arc<dyn MetadataStore> {
        &self.shards[self.shard_index(owner_id)]
    }

    /// All shards with their indexes, for fan-out reads.
    pub fn shards(&self) -> impl Iterator<Item = (usize, &Arc<dyn MetadataStore>)> {
        self.shards.iter().enumerate()
    }

    /// Run `op` against the owner's shard on the blocking pool, giving up after `deadline`.
    pub async fn call_for_owner<T, F>(
        &self,
        owner_id: &str,
        deadline: Duration,
        op: F,
    ) -> Result<T, ShardCallError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MetadataStore) -> Result<T, DatabaseError> + Send + 'static,
    {
        let shard = self.shard_index(owner_id);
        call_shard(shard, Arc::clone(&self.shards[shard]), deadline, op).await
    }
}

/// Run a blocking store operation on shard `shard` with an upper bound on its duration.
///
/// On timeout the blocking task keeps running to completion; only the caller
/// stops waiting. Each store call is a single transaction, so it either lands
/// or it does not.
pub async fn call_shard<T, F>(
    shard: usize,
    store: Arc<dyn MetadataStore>,
    deadline: Duration,
    op: F,
) -> Result<T, ShardCallError>
where
    T: Send + 'static,
    F: FnOnce(&dyn MetadataStore) -> Result<T, DatabaseError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(move || op(store.as_ref()));
    match tokio::time::timeout(deadline, task).await {
        Ok(Ok(result)) => result.map_err(|source| ShardCallError::Storage { shard, source }),
        Ok(Err(e)) => Err(ShardCallError::Task {
            shard,
            message: e.to_string(),
        }),
        Err(_) => Err(ShardCallError::DeadlineExceeded { shard, deadline }),
    }
}
