use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BusError, Delivery, EventBus, HandlerOutcome};
use crate::config::BusConfig;

/// Processes one delivery and says what should happen to it.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome;
}

/// A durable consumer: one (subject, group) pair, one delivery at a time.
pub struct Consumer {
    bus: Arc<dyn EventBus>,
    subject: String,
    group: String,
    handler: Arc<dyn EventHandler>,
    retry_delay: Duration,
    poll_interval: Duration,
}

impl Consumer {
    pub fn new(
        bus: Arc<dyn EventBus>,
        subject: impl Into<String>,
        group: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        config: &BusConfig,
    ) -> Self {
        Self {
            bus,
            subject: subject.into(),
            group: group.into(),
            handler,
            retry_delay: config.retry_delay(),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Consume until `cancel` fires. A delivery already being handled is
    /// finished and settled before the loop exits.
    pub async fn run(self, cancel: CancellationToken) {
        info!(subject = %self.subject, group = %self.group, "Consumer started");

        while !cancel.is_cancelled() {
            let idle = match self.poll_once().await {
                Ok(handled) => !handled,
                Err(e) => {
                    error!(
                        subject = %self.subject,
                        group = %self.group,
                        error = %e,
                        "Failed to fetch from bus"
                    );
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.bus.wait_for_messages(self.poll_interval) => {}
                }
            }
        }

        info!(subject = %self.subject, group = %self.group, "Consumer stopped");
    }

    /// Fetch, handle and settle at most one delivery. Returns whether one was handled.
    pub async fn poll_once(&self) -> Result<bool, BusError> {
        let Some(delivery) = self.bus.fetch(&self.subject, &self.group).await? else {
            return Ok(false);
        };

        let outcome = self.handler.handle(&delivery).await;
        let settled = match &outcome {
            HandlerOutcome::Applied => {
                debug!(
                    subject = %delivery.subject,
                    group = %delivery.group,
                    sequence = delivery.sequence,
                    attempt = delivery.attempt,
                    "Delivery applied"
                );
                self.bus.ack(&delivery).await
            }
            HandlerOutcome::PermanentlyRejected(reason) => {
                warn!(
                    subject = %delivery.subject,
                    group = %delivery.group,
                    sequence = delivery.sequence,
                    reason = %reason,
                    "Delivery rejected permanently"
                );
                self.bus.ack(&delivery).await
            }
            HandlerOutcome::RetryLater(reason) => {
                warn!(
                    subject = %delivery.subject,
                    group = %delivery.group,
                    sequence = delivery.sequence,
                    attempt = delivery.attempt,
                    reason = %reason,
                    "Delivery failed, scheduling redelivery"
                );
                self.bus.nak(&delivery, self.retry_delay).await
            }
        };

        if let Err(e) = settled {
            // The broker redelivers after the ack deadline; handlers are idempotent.
            error!(
                subject = %delivery.subject,
                group = %delivery.group,
                sequence = delivery.sequence,
                error = %e,
                "Failed to settle delivery"
            );
        }

        Ok(true)
    }
}
