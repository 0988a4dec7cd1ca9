use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use file_lifecycle::bus::{BusError, Delivery, EventBus, PublishAck, RedbBus};
use file_lifecycle::object_store::{LocalStore, ObjectStore, ObjectStoreError};
use file_lifecycle::scanner::{ScanError, ScanVerdict, Scanner};
use file_lifecycle::storage::models::{
    FileRecord, OwnerUsage, ScanStatus, ScanUpdate, ShardStats,
};
use file_lifecycle::storage::{Database, DatabaseError, MetadataStore};

/// Local store whose deletes can be made to fail on demand.
#[allow(dead_code)]
pub struct FlakyStore {
    inner: LocalStore,
    fail_deletes: AtomicBool,
    pub deletes: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn new(inner: LocalStore) -> Self {
        Self {
            inner,
            fail_deletes: AtomicBool::new(false),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), ObjectStoreError> {
        self.inner.put(key, data, content_type).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Backend("connection reset".to_string()));
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        self.inner.exists(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        self.inner.list(prefix).await
    }
}

fn offline() -> DatabaseError {
    DatabaseError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "shard offline",
    ))
}

/// A shard that refuses every call.
#[allow(dead_code)]
pub struct UnavailableShard;

impl MetadataStore for UnavailableShard {
    fn save(&self, _record: &FileRecord) -> Result<(), DatabaseError> {
        Err(offline())
    }

    fn get(&self, _file_id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        Err(offline())
    }

    fn list_by_owner(
        &self,
        _owner_id: &str,
        _limit: usize,
        _offset: usize,
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        Err(offline())
    }

    fn count_by_owner(&self, _owner_id: &str) -> Result<u64, DatabaseError> {
        Err(offline())
    }

    fn delete(&self, _file_id: &str, _owner_id: &str) -> Result<bool, DatabaseError> {
        Err(offline())
    }

    fn update_scan_status(
        &self,
        _file_id: &str,
        _status: ScanStatus,
        _scanned_at: DateTime<Utc>,
    ) -> Result<ScanUpdate, DatabaseError> {
        Err(offline())
    }

    fn delete_all_for_owner(&self, _owner_id: &str) -> Result<u64, DatabaseError> {
        Err(offline())
    }

    fn object_keys_for_owner(&self, _owner_id: &str) -> Result<Vec<String>, DatabaseError> {
        Err(offline())
    }

    fn owner_usage(&self, _owner_id: &str) -> Result<OwnerUsage, DatabaseError> {
        Err(offline())
    }

    fn stats(&self) -> Result<ShardStats, DatabaseError> {
        Err(offline())
    }
}

/// A real shard that answers only after `delay`.
#[allow(dead_code)]
pub struct SlowShard {
    inner: Database,
    delay: Duration,
}

#[allow(dead_code)]
impl SlowShard {
    pub fn new(inner: Database, delay: Duration) -> Self {
        Self { inner, delay }
    }

    fn wait(&self) {
        std::thread::sleep(self.delay);
    }
}

impl MetadataStore for SlowShard {
    fn save(&self, record: &FileRecord) -> Result<(), DatabaseError> {
        self.wait();
        self.inner.save(record)
    }

    fn get(&self, file_id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        self.wait();
        self.inner.get(file_id)
    }

    fn list_by_owner(
        &self,
        owner_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        self.wait();
        self.inner.list_by_owner(owner_id, limit, offset)
    }

    fn count_by_owner(&self, owner_id: &str) -> Result<u64, DatabaseError> {
        self.wait();
        self.inner.count_by_owner(owner_id)
    }

    fn delete(&self, file_id: &str, owner_id: &str) -> Result<bool, DatabaseError> {
        self.wait();
        self.inner.delete(file_id, owner_id)
    }

    fn update_scan_status(
        &self,
        file_id: &str,
        status: ScanStatus,
        scanned_at: DateTime<Utc>,
    ) -> Result<ScanUpdate, DatabaseError> {
        self.wait();
        self.inner.update_scan_status(file_id, status, scanned_at)
    }

    fn delete_all_for_owner(&self, owner_id: &str) -> Result<u64, DatabaseError> {
        self.wait();
        self.inner.delete_all_for_owner(owner_id)
    }

    fn object_keys_for_owner(&self, owner_id: &str) -> Result<Vec<String>, DatabaseError> {
        self.wait();
        self.inner.object_keys_for_owner(owner_id)
    }

    fn owner_usage(&self, owner_id: &str) -> Result<OwnerUsage, DatabaseError> {
        self.wait();
        self.inner.owner_usage(owner_id)
    }

    fn stats(&self) -> Result<ShardStats, DatabaseError> {
        self.wait();
        self.inner.stats()
    }
}

/// Scanner that always returns the same verdict and counts its calls.
#[allow(dead_code)]
pub struct FixedScanner {
    verdict: ScanVerdict,
    pub calls: AtomicUsize,
}

#[allow(dead_code)]
impl FixedScanner {
    pub fn clean() -> Self {
        Self::new(ScanVerdict::Clean)
    }

    pub fn infected() -> Self {
        Self::new(ScanVerdict::Infected {
            signature: "Eicar-Test-Signature".to_string(),
        })
    }

    fn new(verdict: ScanVerdict) -> Self {
        Self {
            verdict,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scanner for FixedScanner {
    async fn scan(&self, _data: &[u8]) -> Result<ScanVerdict, ScanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.verdict.clone())
    }
}

#[allow(dead_code)]
pub struct FailingScanner;

#[async_trait]
impl Scanner for FailingScanner {
    async fn scan(&self, _data: &[u8]) -> Result<ScanVerdict, ScanError> {
        Err(ScanError::Unavailable("clamd connection refused".to_string()))
    }
}

/// Broker that is unreachable for publishing.
#[allow(dead_code)]
pub struct FailingBus;

#[async_trait]
impl EventBus for FailingBus {
    async fn publish(
        &self,
        _subject: &str,
        _idempotency_key: &str,
        _payload: Bytes,
    ) -> Result<PublishAck, BusError> {
        Err(BusError::Storage(offline()))
    }

    async fn fetch(&self, _subject: &str, _group: &str) -> Result<Option<Delivery>, BusError> {
        Err(BusError::Storage(offline()))
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), BusError> {
        Err(BusError::Storage(offline()))
    }

    async fn nak(&self, _delivery: &Delivery, _delay: Duration) -> Result<(), BusError> {
        Err(BusError::Storage(offline()))
    }
}

/// Real bus whose publishes on one subject fail a set number of times.
#[allow(dead_code)]
pub struct SubjectFailingBus {
    inner: Arc<RedbBus>,
    subject: &'static str,
    failures: AtomicUsize,
}

#[allow(dead_code)]
impl SubjectFailingBus {
    pub fn new(inner: Arc<RedbBus>, subject: &'static str, failures: usize) -> Self {
        Self {
            inner,
            subject,
            failures: AtomicUsize::new(failures),
        }
    }

    /// Fails every publish on `subject`.
    pub fn always(inner: Arc<RedbBus>, subject: &'static str) -> Self {
        Self::new(inner, subject, usize::MAX)
    }
}

#[async_trait]
impl EventBus for SubjectFailingBus {
    async fn publish(
        &self,
        subject: &str,
        idempotency_key: &str,
        payload: Bytes,
    ) -> Result<PublishAck, BusError> {
        let fail = subject == self.subject
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fail {
            return Err(BusError::Storage(offline()));
        }
        self.inner.publish(subject, idempotency_key, payload).await
    }

    async fn fetch(&self, subject: &str, group: &str) -> Result<Option<Delivery>, BusError> {
        self.inner.fetch(subject, group).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        self.inner.ack(delivery).await
    }

    async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<(), BusError> {
        self.inner.nak(delivery, delay).await
    }
}
