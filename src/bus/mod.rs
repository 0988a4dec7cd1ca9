//! Durable at-least-once publish/subscribe.
//!
//! Handlers never see ack/nak. They return a [`HandlerOutcome`] and the
//! [`Consumer`] loop turns it into an acknowledgement or a redelivery.

mod consumer;
mod redb_bus;

pub use consumer::{Consumer, EventHandler};
pub use redb_bus::RedbBus;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::events::{EventError, LifecycleEvent};
use crate::storage::DatabaseError;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus storage error: {0}")]
    Storage(#[from] DatabaseError),
    #[error("Event encoding error: {0}")]
    Encode(#[from] EventError),
    #[error("Invalid subject or consumer group name: {0:?}")]
    InvalidName(String),
}

/// Broker confirmation of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub sequence: u64,
    /// The idempotency key was seen recently; no new message was stored.
    pub duplicate: bool,
}

/// One message handed to one consumer group.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: String,
    pub group: String,
    pub sequence: u64,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    pub idempotency_key: String,
    pub payload: Bytes,
}

/// What a handler decided about a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Work is done (or was already done). Acknowledge.
    Applied,
    /// Transient failure. Redeliver later.
    RetryLater(String),
    /// The message can never succeed. Acknowledge so it is not redelivered.
    PermanentlyRejected(String),
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(
        &self,
        subject: &str,
        idempotency_key: &str,
        payload: Bytes,
    ) -> Result<PublishAck, BusError>;

    /// Next message for `group` on `subject`: a due redelivery first, else the
    /// next unseen message. `None` when there is nothing to deliver.
    async fn fetch(&self, subject: &str, group: &str) -> Result<Option<Delivery>, BusError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Schedule redelivery after `delay`.
    async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<(), BusError>;

    /// Park until something may have been published, or `max_wait` passes.
    async fn wait_for_messages(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}

/// Publish a lifecycle event on its subject under its idempotency key.
pub async fn publish_event(
    bus: &dyn EventBus,
    event: &LifecycleEvent,
) -> Result<PublishAck, BusError> {
    let payload = event.encode()?;
    let ack = bus
        .publish(event.subject(), &event.idempotency_key, payload)
        .await?;

    tracing::debug!(
        subject = event.subject(),
        sequence = ack.sequence,
        duplicate = ack.duplicate,
        owner_id = %event.owner_id,
        file_id = event.file_id.as_deref().unwrap_or(""),
        "Published event"
    );
    Ok(ack)
}
