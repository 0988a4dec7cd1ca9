use redb::{Database as RedbDatabase, ReadTransaction, ReadableTable, WriteTransaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::models::ScanStatus;
use super::tables::*;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Commit error: {0}")]
    Commit(Box<redb::CommitError>),
    #[error("Database error: {0}")]
    Redb(Box<redb::Error>),
    #[error("Database error: {0}")]
    RedbDatabase(Box<redb::DatabaseError>),
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    #[error("Storage error: {0}")]
    Storage(Box<redb::StorageError>),
    #[error("Table error: {0}")]
    Table(Box<redb::TableError>),
    #[error("Transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("Invalid scan status transition to {0}")]
    InvalidTransition(ScanStatus),
    #[error("Shard file {path} belongs to shard {found_index}/{found_count}, expected {expected_index}/{expected_count}")]
    ShardMismatch {
        path: PathBuf,
        expected_index: u64,
        expected_count: u64,
        found_index: u64,
        found_count: u64,
    },
}

impl From<redb::CommitError> for DatabaseError {
    fn from(e: redb::CommitError) -> Self {
        DatabaseError::Commit(Box::new(e))
    }
}

impl From<redb::DatabaseError> for DatabaseError {
    fn from(e: redb::DatabaseError) -> Self {
        DatabaseError::RedbDatabase(Box::new(e))
    }
}

impl From<redb::Error> for DatabaseError {
    fn from(e: redb::Error) -> Self {
        DatabaseError::Redb(Box::new(e))
    }
}

impl From<redb::StorageError> for DatabaseError {
    fn from(e: redb::StorageError) -> Self {
        DatabaseError::Storage(Box::new(e))
    }
}

impl From<redb::TableError> for DatabaseError {
    fn from(e: redb::TableError) -> Self {
        DatabaseError::Table(Box::new(e))
    }
}

impl From<redb::TransactionError> for DatabaseError {
    fn from(e: redb::TransactionError) -> Self {
        DatabaseError::Transaction(Box::new(e))
    }
}

/// One metadata shard, backed by its own redb file.
pub struct Database {
    db: Arc<RedbDatabase>,
    shard_index: usize,
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            shard_index: self.shard_index,
        }
    }
}

impl Database {
    /// Open or create shard `shard_index` of `shard_count` under `data_dir`.
    ///
    /// The first open stamps the shard's identity into the file. Later opens
    /// with a different index or count fail: moving users between shards needs
    /// an explicit migration.
    pub fn open_shard<P: AsRef<Path>>(
        data_dir: P,
        shard_index: usize,
        shard_count: usize,
    ) -> Result<Self, DatabaseError> {
        let shard_dir = data_dir.as_ref().join("shards");
        std::fs::create_dir_all(&shard_dir)?;
        let db_path = shard_dir.join(format!("shard-{shard_index:02}.redb"));
        let db = Arc::new(RedbDatabase::create(&db_path)?);

        let expected_index = shard_index as u64;
        let expected_count = shard_count as u64;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(FILES)?;
            let _ = write_txn.open_table(OWNER_FILES)?;

            let mut meta = write_txn.open_table(SHARD_META)?;
            let found_index = meta.get("shard_index")?.map(|v| v.value());
            let found_count = meta.get("shard_count")?.map(|v| v.value());
            match (found_index, found_count) {
                (Some(found_index), Some(found_count))
                    if found_index != expected_index || found_count != expected_count =>
                {
                    return Err(DatabaseError::ShardMismatch {
                        path: db_path,
                        expected_index,
                        expected_count,
                        found_index,
                        found_count,
                    });
                }
                (Some(_), Some(_)) => {}
                _ => {
                    meta.insert("shard_index", expected_index)?;
                    meta.insert("shard_count", expected_count)?;
                }
            }
        }
        write_txn.commit()?;

        Ok(Self { db, shard_index })
    }

    pub fn shard_index(&self) -> usize {
        self.shard_index
    }

    /// Begin a read transaction
    pub fn begin_read(&self) -> Result<ReadTransaction, DatabaseError> {
        Ok(self.db.begin_read()?)
    }

    /// Begin a write transaction
    pub fn begin_write(&self) -> Result<WriteTransaction, DatabaseError> {
        Ok(self.db.begin_write()?)
    }
}
