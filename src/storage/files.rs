use chrono::{DateTime, Utc};
use redb::{ReadableTable, Table};

use super::db::{Database, DatabaseError};
use super::models::{FileRecord, OwnerUsage, ScanStatus, ScanUpdate, ShardStats};
use super::tables::*;
use super::MetadataStore;

type BlobTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

fn decode_record(bytes: &[u8]) -> Result<FileRecord, DatabaseError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

fn read_owner_ids(
    index: &impl ReadableTable<&'static str, &'static [u8]>,
    owner_id: &str,
) -> Result<Vec<String>, DatabaseError> {
    match index.get(owner_id)? {
        Some(data) => Ok(rmp_serde::from_slice(data.value())?),
        None => Ok(Vec::new()),
    }
}

fn write_owner_ids(
    index: &mut BlobTable<'_>,
    owner_id: &str,
    ids: &[String],
) -> Result<(), DatabaseError> {
    if ids.is_empty() {
        index.remove(owner_id)?;
    } else {
        let data = rmp_serde::to_vec_named(ids)?;
        index.insert(owner_id, data.as_slice())?;
    }
    Ok(())
}

impl Database {
    /// Load all of an owner's records inside one read transaction.
    fn owner_records(&self, owner_id: &str) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let index = read_txn.open_table(OWNER_FILES)?;
        let files = read_txn.open_table(FILES)?;

        let mut records = Vec::new();
        for file_id in read_owner_ids(&index, owner_id)? {
            if let Some(data) = files.get(file_id.as_str())? {
                records.push(decode_record(data.value())?);
            }
        }
        Ok(records)
    }
}

impl MetadataStore for Database {
    fn save(&self, record: &FileRecord) -> Result<(), DatabaseError> {
        debug_assert!(!record.id.is_empty(), "file id must not be empty");

        let write_txn = self.begin_write()?;
        {
            let mut files = write_txn.open_table(FILES)?;
            let mut index = write_txn.open_table(OWNER_FILES)?;

            let previous_owner = match files.get(record.id.as_str())? {
                Some(data) => Some(decode_record(data.value())?.owner_id),
                None => None,
            };

            // Owner is immutable in practice; keep the index honest if a caller rewrites it anyway.
            if let Some(previous) = previous_owner.filter(|o| *o != record.owner_id) {
                let mut ids = read_owner_ids(&index, &previous)?;
                ids.retain(|id| *id != record.id);
                write_owner_ids(&mut index, &previous, &ids)?;
            }

            let data = rmp_serde::to_vec_named(record)?;
            files.insert(record.id.as_str(), data.as_slice())?;

            let mut ids = read_owner_ids(&index, &record.owner_id)?;
            if !ids.contains(&record.id) {
                ids.push(record.id.clone());
                write_owner_ids(&mut index, &record.owner_id, &ids)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(&self, file_id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        match table.get(file_id)? {
            Some(data) => Ok(Some(decode_record(data.value())?)),
            None => Ok(None),
        }
    }

    fn list_by_owner(
        &self,
        owner_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        let mut records = self.owner_records(owner_id)?;
        records.sort_by(|a, b| {
            b.uploaded_at
                .cmp(&a.uploaded_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    fn count_by_owner(&self, owner_id: &str) -> Result<u64, DatabaseError> {
        let read_txn = self.begin_read()?;
        let index = read_txn.open_table(OWNER_FILES)?;
        Ok(read_owner_ids(&index, owner_id)?.len() as u64)
    }

    fn delete(&self, file_id: &str, owner_id: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let deleted = {
            let mut files = write_txn.open_table(FILES)?;
            let mut index = write_txn.open_table(OWNER_FILES)?;

            let owned = match files.get(file_id)? {
                Some(data) => decode_record(data.value())?.owner_id == owner_id,
                None => false,
            };

            if owned {
                files.remove(file_id)?;
                let mut ids = read_owner_ids(&index, owner_id)?;
                ids.retain(|id| id != file_id);
                write_owner_ids(&mut index, owner_id, &ids)?;
            }
            owned
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    fn update_scan_status(
        &self,
        file_id: &str,
        status: ScanStatus,
        scanned_at: DateTime<Utc>,
    ) -> Result<ScanUpdate, DatabaseError> {
        if !status.is_terminal() {
            return Err(DatabaseError::InvalidTransition(status));
        }

        // Check and write in one transaction so concurrent deliveries cannot regress a terminal status.
        let write_txn = self.begin_write()?;
        let update = {
            let mut files = write_txn.open_table(FILES)?;

            let existing = match files.get(file_id)? {
                Some(data) => Some(decode_record(data.value())?),
                None => None,
            };

            match existing {
                None => ScanUpdate::NotFound,
                Some(record) if record.scan_status.is_terminal() => {
                    ScanUpdate::AlreadyTerminal(record.scan_status)
                }
                Some(mut record) => {
                    record.scan_status = status;
                    record.scanned_at = Some(scanned_at);
                    if status == ScanStatus::Infected {
                        record.preview_key = None;
                    }
                    let data = rmp_serde::to_vec_named(&record)?;
                    files.insert(file_id, data.as_slice())?;
                    ScanUpdate::Applied
                }
            }
        };
        write_txn.commit()?;
        Ok(update)
    }

    fn delete_all_for_owner(&self, owner_id: &str) -> Result<u64, DatabaseError> {
        let write_txn = self.begin_write()?;
        let mut removed = 0;
        {
            let mut files = write_txn.open_table(FILES)?;
            let mut index = write_txn.open_table(OWNER_FILES)?;

            for file_id in read_owner_ids(&index, owner_id)? {
                if files.remove(file_id.as_str())?.is_some() {
                    removed += 1;
                }
            }
            index.remove(owner_id)?;
        }
        write_txn.commit()?;
        Ok(removed)
    }

    fn object_keys_for_owner(&self, owner_id: &str) -> Result<Vec<String>, DatabaseError> {
        Ok(self
            .owner_records(owner_id)?
            .iter()
            .flat_map(|record| record.object_keys().map(str::to_string))
            .collect())
    }

    fn owner_usage(&self, owner_id: &str) -> Result<OwnerUsage, DatabaseError> {
        let records = self.owner_records(owner_id)?;
        Ok(OwnerUsage {
            file_count: records.len() as u64,
            total_size_bytes: records.iter().map(|r| r.size_bytes).sum(),
        })
    }

    fn stats(&self) -> Result<ShardStats, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        let mut stats = ShardStats::default();
        for result in table.iter()? {
            let (_, value) = result?;
            let record = decode_record(value.value())?;
            stats.file_count += 1;
            stats.total_size_bytes += record.size_bytes;
            stats.latest_upload = stats.latest_upload.max(Some(record.uploaded_at));
        }
        Ok(stats)
    }
}
