//! Scan pipeline: `pending -> clean` or `pending -> infected`.
//!
//! Both transitions are one-way and guarded by a state check inside the
//! shard's write transaction, so redelivered or reordered scan events are
//! idempotent. On `infected` the blobs are deleted before the status is
//! committed: a record is never observable as infected while its content is
//! still retrievable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::bus::{publish_event, Delivery, EventBus, EventHandler, HandlerOutcome};
use crate::events::{EventType, LifecycleEvent};
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::scanner::{ScanVerdict, Scanner};
use crate::shard::ShardRouter;
use crate::storage::models::{FileRecord, ScanStatus, ScanUpdate};

/// Durable consumer group of the scan pipeline.
pub const SCANNER_GROUP: &str = "file-lifecycle-scanner";

pub struct LifecycleCoordinator {
    router: Arc<ShardRouter>,
    objects: Arc<dyn ObjectStore>,
    bus: Arc<dyn EventBus>,
    scanner: Arc<dyn Scanner>,
    deadline: Duration,
}

impl LifecycleCoordinator {
    /// `deadline` bounds every call into the owner's shard.
    pub fn new(
        router: Arc<ShardRouter>,
        objects: Arc<dyn ObjectStore>,
        bus: Arc<dyn EventBus>,
        scanner: Arc<dyn Scanner>,
        deadline: Duration,
    ) -> Self {
        Self {
            router,
            objects,
            bus,
            scanner,
            deadline,
        }
    }

    async fn load(&self, owner_id: &str, file_id: &str) -> Result<Option<FileRecord>, HandlerOutcome> {
        let id = file_id.to_string();
        let record = self
            .router
            .call_for_owner(owner_id, self.deadline, move |store| store.get(&id))
            .await
            .map_err(|e| HandlerOutcome::RetryLater(e.to_string()))?;

        // A record found under another owner was not routed here; treat it as absent.
        Ok(record.filter(|r| r.owner_id == owner_id))
    }

    /// Scan a pending file's blob and apply the verdict.
    pub async fn handle_scan_requested(&self, event: &LifecycleEvent) -> HandlerOutcome {
        let file_id = match event.require_file_id() {
            Ok(id) => id,
            Err(e) => return HandlerOutcome::PermanentlyRejected(e.to_string()),
        };
        let owner_id = event.owner_id.as_str();

        let record = match self.load(owner_id, file_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(file_id, owner_id, "Scan requested for a file that no longer exists");
                return HandlerOutcome::Applied;
            }
            Err(outcome) => return outcome,
        };

        // A redelivery after a failed scan-completed publish lands here.
        if record.scan_status.is_terminal() {
            debug!(file_id, status = %record.scan_status, "File already scanned");
            let status = record.scan_status;
            return self.publish_completed(&record, status).await;
        }

        let data = match self.objects.get(&record.object_key).await {
            Ok(data) => data,
            Err(ObjectStoreError::NotFound(key)) => {
                return HandlerOutcome::PermanentlyRejected(format!(
                    "blob {key} of pending file {file_id} is gone"
                ));
            }
            Err(e) => return HandlerOutcome::RetryLater(e.to_string()),
        };

        let verdict = match self.scanner.scan(&data).await {
            Ok(verdict) => verdict,
            Err(e) => return HandlerOutcome::RetryLater(e.to_string()),
        };

        self.apply_scan_result(file_id, owner_id, &verdict).await
    }

    /// Move a pending record to the terminal status matching `verdict`.
    ///
    /// Safe to call any number of times for the same file: once the record is
    /// terminal nothing is mutated and the completion event is re-published
    /// under the same idempotency key.
    pub async fn apply_scan_result(
        &self,
        file_id: &str,
        owner_id: &str,
        verdict: &ScanVerdict,
    ) -> HandlerOutcome {
        let mut record = match self.load(owner_id, file_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(file_id, owner_id, "Scan result for a file that no longer exists");
                return HandlerOutcome::Applied;
            }
            Err(outcome) => return outcome,
        };

        if record.scan_status.is_terminal() {
            let status = record.scan_status;
            return self.publish_completed(&record, status).await;
        }

        let status = match verdict {
            ScanVerdict::Clean => ScanStatus::Clean,
            ScanVerdict::Infected { .. } => ScanStatus::Infected,
        };

        if let ScanVerdict::Infected { signature } = verdict {
            for key in record.object_keys() {
                if let Err(e) = self.objects.delete(key).await {
                    warn!(file_id, key, error = %e, "Failed to delete infected blob");
                    return HandlerOutcome::RetryLater(format!("quarantine of {key} failed: {e}"));
                }
            }
            info!(file_id, owner_id, signature = %signature, "Quarantined infected file");
        }

        let id = file_id.to_string();
        let update = self
            .router
            .call_for_owner(owner_id, self.deadline, move |store| {
                store.update_scan_status(&id, status, Utc::now())
            })
            .await;

        let committed = match update {
            Ok(ScanUpdate::Applied) => status,
            Ok(ScanUpdate::AlreadyTerminal(existing)) => existing,
            Ok(ScanUpdate::NotFound) => {
                debug!(file_id, "File deleted while its scan result was applied");
                return HandlerOutcome::Applied;
            }
            Err(e) => return HandlerOutcome::RetryLater(e.to_string()),
        };

        info!(
            file_id,
            owner_id,
            shard = self.router.shard_index(owner_id),
            status = %committed,
            "Scan status committed"
        );

        record.scan_status = committed;
        if committed == ScanStatus::Infected {
            record.preview_key = None;
        }
        self.publish_completed(&record, committed).await
    }

    async fn publish_completed(&self, record: &FileRecord, status: ScanStatus) -> HandlerOutcome {
        let event = LifecycleEvent::scan_completed(record, status);
        match publish_event(self.bus.as_ref(), &event).await {
            Ok(_) => HandlerOutcome::Applied,
            Err(e) => HandlerOutcome::RetryLater(format!("publish scan-completed: {e}")),
        }
    }
}

#[async_trait]
impl EventHandler for LifecycleCoordinator {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        match LifecycleEvent::decode(&delivery.payload, EventType::ScanRequested) {
            Ok(event) => self.handle_scan_requested(&event).await,
            Err(e) => HandlerOutcome::PermanentlyRejected(e.to_string()),
        }
    }
}
