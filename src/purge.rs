//! Cascading delete of everything a removed user owns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::bus::{Delivery, EventHandler, HandlerOutcome};
use crate::events::{EventType, LifecycleEvent};
use crate::object_store::{owner_prefix, ObjectStore};
use crate::shard::ShardRouter;
use crate::upload::validate_owner_id;

/// Durable consumer group of the purge workflow.
pub const PURGE_GROUP: &str = "file-lifecycle-purge";

pub struct UserPurgeCoordinator {
    router: Arc<ShardRouter>,
    objects: Arc<dyn ObjectStore>,
    deadline: Duration,
}

impl UserPurgeCoordinator {
    pub fn new(router: Arc<ShardRouter>, objects: Arc<dyn ObjectStore>, deadline: Duration) -> Self {
        Self {
            router,
            objects,
            deadline,
        }
    }

    /// Delete an owner's blobs, then their rows.
    ///
    /// Rows are only removed once every blob deletion has succeeded; any
    /// failure before that leaves the rows in place and asks for redelivery,
    /// which restarts from the top. Re-running for an owner with nothing left
    /// is a no-op that still succeeds.
    pub async fn handle_user_removed(&self, owner_id: &str) -> HandlerOutcome {
        if let Err(e) = validate_owner_id(owner_id) {
            return HandlerOutcome::PermanentlyRejected(e.to_string());
        }
        let shard = self.router.shard_index(owner_id);

        let owner = owner_id.to_string();
        let keys = match self
            .router
            .call_for_owner(owner_id, self.deadline, move |store| {
                store.object_keys_for_owner(&owner)
            })
            .await
        {
            Ok(keys) => keys,
            Err(e) => return HandlerOutcome::RetryLater(e.to_string()),
        };

        for key in &keys {
            if let Err(e) = self.objects.delete(key).await {
                warn!(owner_id, key = %key, error = %e, "Failed to delete blob during purge");
                return HandlerOutcome::RetryLater(format!("delete {key}: {e}"));
            }
        }

        // Blobs whose row was never written (interrupted uploads) only show up under the prefix.
        let swept = match self.objects.delete_by_prefix(&owner_prefix(owner_id)).await {
            Ok(count) => count,
            Err(e) => {
                warn!(owner_id, error = %e, "Failed to sweep owner prefix during purge");
                return HandlerOutcome::RetryLater(format!("sweep {owner_id}/: {e}"));
            }
        };

        let owner = owner_id.to_string();
        let rows = match self
            .router
            .call_for_owner(owner_id, self.deadline, move |store| {
                store.delete_all_for_owner(&owner)
            })
            .await
        {
            Ok(rows) => rows,
            Err(e) => return HandlerOutcome::RetryLater(e.to_string()),
        };

        info!(
            owner_id,
            shard,
            objects_deleted = keys.len(),
            objects_swept = swept,
            rows_deleted = rows,
            "User purge completed"
        );
        HandlerOutcome::Applied
    }
}

#[async_trait]
impl EventHandler for UserPurgeCoordinator {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        match LifecycleEvent::decode(&delivery.payload, EventType::UserRemoved) {
            Ok(event) => self.handle_user_removed(&event.owner_id).await,
            Err(e) => HandlerOutcome::PermanentlyRejected(e.to_string()),
        }
    }
}
