//! Lifecycle facts and commands exchanged over the event bus.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::models::{FileRecord, ScanStatus};

pub const FILES_UPLOADED: &str = "files.uploaded";
pub const FILES_SCAN_REQUESTED: &str = "files.scan.requested";
pub const FILES_SCAN_COMPLETED: &str = "files.scan.completed";
pub const USERS_REMOVED: &str = "users.removed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Uploaded,
    ScanRequested,
    ScanCompleted,
    UserRemoved,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Uploaded => "uploaded",
            EventType::ScanRequested => "scan-requested",
            EventType::ScanCompleted => "scan-completed",
            EventType::UserRemoved => "user-removed",
        }
    }

    /// The single subject each event type is published on.
    pub fn subject(self) -> &'static str {
        match self {
            EventType::Uploaded => FILES_UPLOADED,
            EventType::ScanRequested => FILES_SCAN_REQUESTED,
            EventType::ScanCompleted => FILES_SCAN_COMPLETED,
            EventType::UserRemoved => USERS_REMOVED,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Expected a {expected} event, got {actual}")]
    WrongType {
        expected: EventType,
        actual: EventType,
    },
    #[error("{event_type} event is missing {field}")]
    MissingField {
        event_type: EventType,
        field: &'static str,
    },
}

/// An immutable fact published to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_status: Option<ScanStatus>,
    pub timestamp: DateTime<Utc>,
    pub idempotency_key: String,
}

/// Idempotency key for a per-file event: one logical fact per (file, type).
pub fn file_idempotency_key(file_id: &str, event_type: EventType) -> String {
    format!("{file_id}:{event_type}")
}

impl LifecycleEvent {
    fn for_file(event_type: EventType, record: &FileRecord) -> Self {
        Self {
            event_type,
            file_id: Some(record.id.clone()),
            owner_id: record.owner_id.clone(),
            object_key: Some(record.object_key.clone()),
            scan_status: None,
            timestamp: Utc::now(),
            idempotency_key: file_idempotency_key(&record.id, event_type),
        }
    }

    pub fn uploaded(record: &FileRecord) -> Self {
        Self::for_file(EventType::Uploaded, record)
    }

    pub fn scan_requested(record: &FileRecord) -> Self {
        Self::for_file(EventType::ScanRequested, record)
    }

    pub fn scan_completed(record: &FileRecord, status: ScanStatus) -> Self {
        Self {
            scan_status: Some(status),
            ..Self::for_file(EventType::ScanCompleted, record)
        }
    }

    pub fn user_removed(owner_id: &str) -> Self {
        Self {
            event_type: EventType::UserRemoved,
            file_id: None,
            owner_id: owner_id.to_string(),
            object_key: None,
            scan_status: None,
            timestamp: Utc::now(),
            idempotency_key: format!("{owner_id}:{}", EventType::UserRemoved),
        }
    }

    pub fn subject(&self) -> &'static str {
        self.event_type.subject()
    }

    pub fn encode(&self) -> Result<Bytes, EventError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a payload and check it is of the expected type.
    pub fn decode(payload: &[u8], expected: EventType) -> Result<Self, EventError> {
        let event: LifecycleEvent = serde_json::from_slice(payload)?;
        if event.event_type != expected {
            return Err(EventError::WrongType {
                expected,
                actual: event.event_type,
            });
        }
        Ok(event)
    }

    pub fn require_file_id(&self) -> Result<&str, EventError> {
        self.file_id.as_deref().ok_or(EventError::MissingField {
            event_type: self.event_type,
            field: "file_id",
        })
    }
}
