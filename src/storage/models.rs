use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Malware scan state of a file. Only `Pending -> Clean` and
/// `Pending -> Infected` are valid transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Clean,
    Infected,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ScanStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Clean => "clean",
            ScanStatus::Infected => "infected",
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a file derived from its MIME type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MimeCategory {
    Audio,
    Document,
    Image,
    Other,
    Video,
}

impl MimeCategory {
    pub fn from_mime(mime_type: &str) -> Self {
        let mut parts = mime_type.split('/');
        let primary = parts.next().unwrap_or("");
        let sub = parts.next().unwrap_or("");
        match primary {
            "audio" => MimeCategory::Audio,
            "image" => MimeCategory::Image,
            "video" => MimeCategory::Video,
            "text" => MimeCategory::Document,
            "application" => match sub {
                "pdf"
                | "msword"
                | "rtf"
                | "vnd.openxmlformats-officedocument.wordprocessingml.document"
                | "vnd.openxmlformats-officedocument.spreadsheetml.sheet"
                | "vnd.openxmlformats-officedocument.presentationml.presentation"
                | "vnd.ms-excel"
                | "vnd.ms-powerpoint" => MimeCategory::Document,
                _ => MimeCategory::Other,
            },
            _ => MimeCategory::Other,
        }
    }
}

/// A file's metadata row, stored in the shard that owns `owner_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub owner_id: String,
    pub object_key: String,
    #[serde(default)]
    pub preview_key: Option<String>,
    pub original_name: String,
    pub mime_type: String,
    pub mime_category: MimeCategory,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
    pub scan_status: ScanStatus,
    #[serde(default)]
    pub scanned_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// Primary and preview keys held by this record.
    pub fn object_keys(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.object_key.as_str()).chain(self.preview_key.as_deref())
    }
}

/// Result of a scan status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanUpdate {
    Applied,
    /// The record already carried a terminal status; nothing was written.
    AlreadyTerminal(ScanStatus),
    NotFound,
}

/// Aggregate figures for one shard.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShardStats {
    pub file_count: u64,
    pub total_size_bytes: u64,
    pub latest_upload: Option<DateTime<Utc>>,
}

/// Aggregate figures for one owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OwnerUsage {
    pub file_count: u64,
    pub total_size_bytes: u64,
}

/// Number of pages needed to show `count` items `limit` at a time.
pub fn total_pages(count: u64, limit: u32) -> u64 {
    if limit == 0 {
        return 0;
    }
    count.div_ceil(u64::from(limit))
}
