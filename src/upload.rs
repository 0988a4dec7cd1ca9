//! Request-path file workflows: upload, owner-scoped reads, download, delete.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{publish_event, BusError, EventBus};
use crate::events::LifecycleEvent;
use crate::object_store::{object_key, ObjectStore, ObjectStoreError};
use crate::shard::{ShardCallError, ShardRouter};
use crate::storage::models::{total_pages, FileRecord, MimeCategory, OwnerUsage, ScanStatus};

const MAX_EXTENSION_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum FileServiceError {
    #[error("Invalid owner id: {0:?}")]
    InvalidOwner(String),
    #[error("Empty file: {0}")]
    EmptyFile(String),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("File {0} is quarantined")]
    Quarantined(String),
    #[error("Metadata error: {0}")]
    Metadata(#[from] ShardCallError),
    #[error("Object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),
    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),
}

/// One page of an owner's files.
#[derive(Debug, Clone, Serialize)]
pub struct FilePage {
    pub files: Vec<FileRecord>,
    pub total: u64,
    pub total_pages: u64,
}

/// Owner ids become the first segment of every object key.
pub fn validate_owner_id(owner_id: &str) -> Result<(), FileServiceError> {
    if owner_id.trim().is_empty() || owner_id.contains('/') || owner_id == ".." {
        return Err(FileServiceError::InvalidOwner(owner_id.to_string()));
    }
    Ok(())
}

/// Lowercased `.ext` of `name`, or empty when it has none usable in a key.
fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

pub struct FileService {
    router: Arc<ShardRouter>,
    objects: Arc<dyn ObjectStore>,
    bus: Arc<dyn EventBus>,
    deadline: Duration,
}

impl FileService {
    pub fn new(
        router: Arc<ShardRouter>,
        objects: Arc<dyn ObjectStore>,
        bus: Arc<dyn EventBus>,
        deadline: Duration,
    ) -> Self {
        Self {
            router,
            objects,
            bus,
            deadline,
        }
    }

    /// Store a new file as `pending` and hand it to the scan pipeline.
    ///
    /// Side effects are undone in reverse order when a later step fails, so a
    /// failed upload leaves neither a row nor a blob behind.
    pub async fn upload(
        &self,
        owner_id: &str,
        original_name: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> Result<FileRecord, FileServiceError> {
        validate_owner_id(owner_id)?;
        if data.is_empty() {
            return Err(FileServiceError::EmptyFile(original_name.to_string()));
        }

        let mime_type = content_type
            .filter(|ct| !ct.is_empty() && *ct != "application/octet-stream")
            .map(str::to_string)
            .unwrap_or_else(|| {
                mime_guess::from_path(original_name)
                    .first_or_octet_stream()
                    .to_string()
            });

        let id = Uuid::new_v4().to_string();
        let record = FileRecord {
            object_key: object_key(owner_id, &id, &extension_of(original_name)),
            id,
            owner_id: owner_id.to_string(),
            preview_key: None,
            original_name: original_name.to_string(),
            mime_category: MimeCategory::from_mime(&mime_type),
            mime_type,
            size_bytes: data.len() as u64,
            uploaded_at: Utc::now(),
            scan_status: ScanStatus::Pending,
            scanned_at: None,
        };

        self.objects
            .put(&record.object_key, data, &record.mime_type)
            .await?;

        let row = record.clone();
        if let Err(e) = self
            .router
            .call_for_owner(owner_id, self.deadline, move |store| store.save(&row))
            .await
        {
            self.discard_blob(&record).await;
            return Err(e.into());
        }

        if let Err(e) = self.announce(&record).await {
            error!(file_id = %record.id, error = %e, "Failed to publish upload events, rolling back");
            let (id, owner) = (record.id.clone(), record.owner_id.clone());
            if let Err(e) = self
                .router
                .call_for_owner(owner_id, self.deadline, move |store| store.delete(&id, &owner))
                .await
            {
                error!(file_id = %record.id, error = %e, "Failed to roll back metadata row");
            }
            self.discard_blob(&record).await;
            return Err(e);
        }

        info!(
            file_id = %record.id,
            owner_id,
            shard = self.router.shard_index(owner_id),
            size_bytes = record.size_bytes,
            "File uploaded"
        );
        Ok(record)
    }

    /// A rolled-back upload may leave `scan-requested` on the bus (the scan
    /// consumer acks it as a missing record) but never `uploaded`.
    async fn announce(&self, record: &FileRecord) -> Result<(), FileServiceError> {
        publish_event(self.bus.as_ref(), &LifecycleEvent::scan_requested(record)).await?;
        publish_event(self.bus.as_ref(), &LifecycleEvent::uploaded(record)).await?;
        Ok(())
    }

    async fn discard_blob(&self, record: &FileRecord) {
        if let Err(e) = self.objects.delete(&record.object_key).await {
            error!(file_id = %record.id, key = %record.object_key, error = %e, "Failed to remove blob of failed upload");
        }
    }

    /// The owner's record for `file_id`. Another owner's file is reported as not found.
    pub async fn get(&self, owner_id: &str, file_id: &str) -> Result<FileRecord, FileServiceError> {
        let id = file_id.to_string();
        self.router
            .call_for_owner(owner_id, self.deadline, move |store| store.get(&id))
            .await?
            .filter(|record| record.owner_id == owner_id)
            .ok_or_else(|| FileServiceError::NotFound(file_id.to_string()))
    }

    /// Newest-first page of the owner's files. `limit` must be positive.
    pub async fn list(
        &self,
        owner_id: &str,
        limit: u32,
        offset: u64,
    ) -> Result<FilePage, FileServiceError> {
        let owner = owner_id.to_string();
        let (files, total) = self
            .router
            .call_for_owner(owner_id, self.deadline, move |store| {
                let files = store.list_by_owner(&owner, limit as usize, offset as usize)?;
                let total = store.count_by_owner(&owner)?;
                Ok((files, total))
            })
            .await?;

        Ok(FilePage {
            files,
            total,
            total_pages: total_pages(total, limit),
        })
    }

    /// Record and content of a file. Quarantined files cannot be downloaded.
    pub async fn download(
        &self,
        owner_id: &str,
        file_id: &str,
    ) -> Result<(FileRecord, Bytes), FileServiceError> {
        let record = self.get(owner_id, file_id).await?;
        if record.scan_status == ScanStatus::Infected {
            return Err(FileServiceError::Quarantined(file_id.to_string()));
        }

        match self.objects.get(&record.object_key).await {
            Ok(data) => Ok((record, data)),
            Err(ObjectStoreError::NotFound(_)) => {
                Err(FileServiceError::NotFound(file_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete one of the owner's files: blob first, then the row.
    pub async fn delete(&self, owner_id: &str, file_id: &str) -> Result<(), FileServiceError> {
        let record = self.get(owner_id, file_id).await?;

        self.objects.delete(&record.object_key).await?;
        if let Some(preview_key) = &record.preview_key {
            if let Err(e) = self.objects.delete(preview_key).await {
                warn!(file_id, key = %preview_key, error = %e, "Failed to delete preview");
            }
        }

        let (id, owner) = (file_id.to_string(), owner_id.to_string());
        let deleted = self
            .router
            .call_for_owner(owner_id, self.deadline, move |store| store.delete(&id, &owner))
            .await?;
        if !deleted {
            return Err(FileServiceError::NotFound(file_id.to_string()));
        }

        info!(file_id, owner_id, "File deleted");
        Ok(())
    }

    pub async fn usage(&self, owner_id: &str) -> Result<OwnerUsage, FileServiceError> {
        let owner = owner_id.to_string();
        Ok(self
            .router
            .call_for_owner(owner_id, self.deadline, move |store| store.owner_usage(&owner))
            .await?)
    }
}
