//! Fulfillment queue facade.
//!
//! The surface the rest of the system calls: the upstream payment-event
//! handler enqueues one request per unit of work after verifying the
//! triggering payment succeeded, and the dashboard reads the status
//! aggregate. Processing itself is the runner's business.

use std::sync::Arc;

use tracing::info;

use keymint_billing::AccountStore;
use keymint_core::{CustomerId, DomainError};

use crate::dedup::Deduplicator;
use crate::error::QueueError;
use crate::store::QueueStore;
use crate::types::{EnqueueRequest, EnqueueResult, QueueItem, QueueStats};

/// Entry point for enqueueing fulfillment work and reading queue status.
pub struct FulfillmentQueue {
    queue: Arc<dyn QueueStore>,
    dedup: Deduplicator,
}

impl FulfillmentQueue {
    pub fn new(queue: Arc<dyn QueueStore>, accounts: Arc<dyn AccountStore>) -> Self {
        let dedup = Deduplicator::new(queue.clone(), accounts);
        Self { queue, dedup }
    }

    /// Enqueue one unit of fulfillment work.
    ///
    /// Runs the enqueue-time dedup check first; a matching
    /// `(payment_intent_id, license_key)` pair short-circuits to the
    /// existing row (`skipped: true`) without inserting anything.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueResult, QueueError> {
        if request.quantity == 0 {
            return Err(QueueError::Domain(DomainError::validation(
                "quantity must be at least 1",
            )));
        }
        if request.unit_index == 0 {
            return Err(QueueError::Domain(DomainError::validation(
                "unit_index is 1-based",
            )));
        }

        let key = request.effective_key();
        if let Some(existing) = self
            .dedup
            .find_existing_item(&request.payment_intent_id, key.as_str())
            .await?
        {
            return Ok(EnqueueResult {
                queue_id: existing.queue_id,
                skipped: true,
                reason: Some("duplicate".to_string()),
            });
        }

        let item = QueueItem::new(
            request.customer_id,
            request.user_email,
            request.payment_intent_id,
            request.price_id,
            key,
            request.quantity,
            request.trial_end,
            request.payload,
        );
        let queue_id = self.queue.insert(item).await?;
        info!(%queue_id, "fulfillment job enqueued");

        Ok(EnqueueResult {
            queue_id,
            skipped: false,
            reason: None,
        })
    }

    /// Enqueue several units (e.g. one per license or per site) in order.
    ///
    /// Dedup applies per unit, so redelivering an event re-enqueues only the
    /// units that are actually missing.
    pub async fn enqueue_all(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<EnqueueResult>, QueueError> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.enqueue(request).await?);
        }
        Ok(results)
    }

    /// Status aggregate for the dashboard, optionally scoped to a customer.
    pub async fn status(&self, customer: Option<&CustomerId>) -> Result<QueueStats, QueueError> {
        Ok(self.queue.stats(customer).await?)
    }
}
