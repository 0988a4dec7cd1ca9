//! file-lifecycle - Sharded file metadata with an event-driven scan and purge pipeline
//!
//! This crate provides:
//! - Deterministic owner-to-shard routing over independent redb metadata shards
//! - Swappable object storage backends (local filesystem, GCS)
//! - A durable at-least-once event bus with per-group cursors and ack/nak
//! - Scan (pending -> clean | infected) and cascading user purge coordinators
//! - REST API with multipart upload support

pub mod api;
pub mod bus;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod object_store;
pub mod purge;
pub mod scanner;
pub mod shard;
pub mod stats;
pub mod storage;
pub mod upload;

use config::Config;
use stats::StatsAggregator;
use upload::FileService;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub files: FileService,
    pub stats: StatsAggregator,
}
