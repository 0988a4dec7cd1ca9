pub mod mocks;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use file_lifecycle::bus::{EventBus, RedbBus};
use file_lifecycle::config::BusConfig;
use file_lifecycle::lifecycle::LifecycleCoordinator;
use file_lifecycle::object_store::{LocalStore, ObjectStore};
use file_lifecycle::purge::UserPurgeCoordinator;
use file_lifecycle::scanner::Scanner;
use file_lifecycle::shard::ShardRouter;
use file_lifecycle::storage::models::{FileRecord, MimeCategory, ScanStatus};
use file_lifecycle::storage::{Database, MetadataStore};
use file_lifecycle::upload::FileService;

#[allow(unused_imports)]
pub use mocks::{
    FailingBus, FailingScanner, FixedScanner, FlakyStore, SlowShard, SubjectFailingBus,
    UnavailableShard,
};

#[allow(dead_code)]
pub const SHARDS: usize = 4;

#[allow(dead_code)]
pub const DEADLINE: Duration = Duration::from_secs(3);

/// Bus timings short enough for redelivery to be observable in a test.
#[allow(dead_code)]
pub fn bus_config() -> BusConfig {
    BusConfig {
        ack_wait_ms: 200,
        retry_delay_ms: 50,
        poll_interval_ms: 20,
        dedup_window_secs: 120,
        retention_secs: 3600,
    }
}

/// Shards, a local object store with failure injection and a bus, all under one tempdir.
#[allow(dead_code)]
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub router: Arc<ShardRouter>,
    pub objects: Arc<FlakyStore>,
    pub bus: Arc<RedbBus>,
}

#[allow(dead_code)]
impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let router = Arc::new(ShardRouter::open(dir.path().join("data"), SHARDS).unwrap());
        let local = LocalStore::new(dir.path().join("files")).unwrap();
        let bus = Arc::new(RedbBus::open(dir.path().join("data/bus"), &bus_config()).unwrap());
        Self {
            dir,
            router,
            objects: Arc::new(FlakyStore::new(local)),
            bus,
        }
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.objects.clone()
    }

    pub fn event_bus(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }

    pub fn files(&self) -> FileService {
        FileService::new(
            Arc::clone(&self.router),
            self.object_store(),
            self.event_bus(),
            DEADLINE,
        )
    }

    pub fn lifecycle(&self, scanner: Arc<dyn Scanner>) -> LifecycleCoordinator {
        LifecycleCoordinator::new(
            Arc::clone(&self.router),
            self.object_store(),
            self.event_bus(),
            scanner,
            DEADLINE,
        )
    }

    pub fn purge(&self) -> UserPurgeCoordinator {
        UserPurgeCoordinator::new(Arc::clone(&self.router), self.object_store(), DEADLINE)
    }

    pub fn store_for(&self, owner_id: &str) -> Arc<dyn MetadataStore> {
        Arc::clone(self.router.store_for(owner_id))
    }
}

/// A pending record whose blob lives at `{owner}/{id}.bin`.
#[allow(dead_code)]
pub fn record(id: &str, owner_id: &str, uploaded_at: DateTime<Utc>) -> FileRecord {
    FileRecord {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        object_key: format!("{owner_id}/{id}.bin"),
        preview_key: None,
        original_name: format!("{id}.bin"),
        mime_type: "application/octet-stream".to_string(),
        mime_category: MimeCategory::Other,
        size_bytes: 100,
        uploaded_at,
        scan_status: ScanStatus::Pending,
        scanned_at: None,
    }
}

/// A single-shard router whose shard answers after `delay`, plus direct
/// access to the shard for seeding and inspection.
#[allow(dead_code)]
pub fn slow_router(env: &TestEnv, delay: Duration) -> (Arc<ShardRouter>, Database) {
    let db = Database::open_shard(env.dir.path().join("slow"), 0, 1).unwrap();
    let shards: Vec<Arc<dyn MetadataStore>> = vec![Arc::new(SlowShard::new(db.clone(), delay))];
    (Arc::new(ShardRouter::new(shards).unwrap()), db)
}
