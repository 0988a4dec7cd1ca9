pub mod db;
mod files;
pub mod models;
mod tables;

pub use db::{Database, DatabaseError};
pub use tables::*;

use chrono::{DateTime, Utc};

use models::{FileRecord, OwnerUsage, ScanStatus, ScanUpdate, ShardStats};

/// File metadata operations scoped to a single shard.
///
/// Implementations never reach into another shard; the `ShardRouter` decides
/// which instance a caller gets. Calls block on storage I/O.
pub trait MetadataStore: Send + Sync {
    /// Insert or replace the record with `record.id`.
    fn save(&self, record: &FileRecord) -> Result<(), DatabaseError>;

    fn get(&self, file_id: &str) -> Result<Option<FileRecord>, DatabaseError>;

    /// One page of an owner's files, newest upload first.
    fn list_by_owner(
        &self,
        owner_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FileRecord>, DatabaseError>;

    fn count_by_owner(&self, owner_id: &str) -> Result<u64, DatabaseError>;

    /// Delete a record only if both the id and the owner match.
    fn delete(&self, file_id: &str, owner_id: &str) -> Result<bool, DatabaseError>;

    /// Move a pending record to a terminal scan status.
    fn update_scan_status(
        &self,
        file_id: &str,
        status: ScanStatus,
        scanned_at: DateTime<Utc>,
    ) -> Result<ScanUpdate, DatabaseError>;

    /// Remove every record owned by `owner_id`, returning how many were removed.
    fn delete_all_for_owner(&self, owner_id: &str) -> Result<u64, DatabaseError>;

    /// Primary and preview object keys for all of an owner's records.
    fn object_keys_for_owner(&self, owner_id: &str) -> Result<Vec<String>, DatabaseError>;

    fn owner_usage(&self, owner_id: &str) -> Result<OwnerUsage, DatabaseError>;

    fn stats(&self) -> Result<ShardStats, DatabaseError>;
}
