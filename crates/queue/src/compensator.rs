//! Compensating refunds for jobs that never converged.
//!
//! A terminally failed row older than the grace window gets the money back:
//! resolve the charge behind its payment intent, compute the per-unit
//! amount, refund, record it, and stamp the row. The stamp (plus the stored
//! refund record) is the idempotency guard; there is no refund-retry
//! counter, a failed refund simply leaves the row eligible for the next
//! pass.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use keymint_billing::{CreateRefundRequest, PaymentApi};
use keymint_core::{DomainError, RefundId};

use crate::error::QueueError;
use crate::store::QueueStore;
use crate::types::{QueueItem, REFUND_GRACE_WINDOW, REFUND_MARKER, RefundRecord};

/// Compensator tuning.
#[derive(Debug, Clone, Copy)]
pub struct CompensatorConfig {
    /// Failed rows younger than this are left alone (a human or a redeploy
    /// may still rescue them).
    pub grace_window: chrono::Duration,
    /// Upper bound on refunds attempted per pass.
    pub batch_limit: usize,
}

impl Default for CompensatorConfig {
    fn default() -> Self {
        Self {
            grace_window: REFUND_GRACE_WINDOW,
            batch_limit: 20,
        }
    }
}

/// Issues at-most-one refund per aged-out failed row.
pub struct Compensator {
    queue: Arc<dyn QueueStore>,
    payments: Arc<dyn PaymentApi>,
    config: CompensatorConfig,
}

impl Compensator {
    pub fn new(queue: Arc<dyn QueueStore>, payments: Arc<dyn PaymentApi>) -> Self {
        Self {
            queue,
            payments,
            config: CompensatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CompensatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Refund cutoff for a pass starting at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.config.grace_window
    }

    /// One compensation pass. Returns the number of refunds issued.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let cutoff = self.cutoff(now);
        let rows = self
            .queue
            .scan_failed_older_than(cutoff, self.config.batch_limit)
            .await?;

        let mut issued = 0;
        for item in rows {
            // The scan already filters marked rows; re-check anyway since the
            // row may have been refunded by a concurrent pass.
            if item.has_refund_marker() {
                continue;
            }
            if let Some(existing) = self.queue.refund_for(item.queue_id).await? {
                // Refund record exists but the marker write was lost; repair
                // the marker instead of paying twice.
                debug!(queue_id = %item.queue_id, refund_id = %existing.refund_id, "restoring missing refund marker");
                self.queue
                    .append_refund_marker(item.queue_id, &marker_note(&existing.refund_id))
                    .await?;
                continue;
            }

            match self.refund_one(&item, now).await {
                Ok(refund_id) => {
                    issued += 1;
                    info!(
                        queue_id = %item.queue_id,
                        refund_id = %refund_id,
                        license_key = %item.license_key,
                        "refund issued for failed fulfillment"
                    );
                }
                Err(e) => {
                    // Row stays eligible for the next pass.
                    warn!(queue_id = %item.queue_id, error = %e, "refund attempt failed");
                }
            }
        }
        Ok(issued)
    }

    async fn refund_one(
        &self,
        item: &QueueItem,
        now: DateTime<Utc>,
    ) -> Result<RefundId, QueueError> {
        let intent = self
            .payments
            .fetch_payment_intent(&item.payment_intent_id)
            .await?;
        let charge_id = intent.charge_id.clone().ok_or_else(|| {
            QueueError::Domain(DomainError::invariant(format!(
                "payment intent {} has no charge to refund",
                intent.id
            )))
        })?;

        // Per-unit amount from the price; fall back to an even split of the
        // charged total when the price lookup fails or carries no amount.
        let per_unit = match self.payments.fetch_price(&item.price_id).await {
            Ok(price) => price.unit_amount.unwrap_or_else(|| fallback_per_unit(intent.amount, item)),
            Err(e) => {
                debug!(queue_id = %item.queue_id, error = %e, "price lookup failed; using amount split");
                fallback_per_unit(intent.amount, item)
            }
        };
        let amount = per_unit * i64::from(item.payload.units(item.quantity));

        let mut metadata = BTreeMap::new();
        metadata.insert("queue_id".to_string(), item.queue_id.to_string());
        metadata.insert("license_key".to_string(), item.license_key.as_str().to_string());
        metadata.insert("reason".to_string(), "fulfillment_failed".to_string());

        let refund = self
            .payments
            .create_refund(CreateRefundRequest {
                charge_id,
                amount,
                metadata,
            })
            .await?;

        self.queue
            .insert_refund(RefundRecord {
                refund_id: refund.id.clone(),
                queue_id: item.queue_id,
                license_key: item.license_key.as_str().to_string(),
                amount,
                currency: intent.currency.clone(),
                status: refund.status.clone(),
                created_at: now,
            })
            .await?;
        self.queue
            .append_refund_marker(item.queue_id, &marker_note(&refund.id))
            .await?;

        Ok(refund.id)
    }
}

fn fallback_per_unit(total_amount: i64, item: &QueueItem) -> i64 {
    total_amount / i64::from(item.quantity.max(1))
}

fn marker_note(refund_id: &RefundId) -> String {
    format!("{REFUND_MARKER} {refund_id}]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryQueueStore, QueueStore};
    use crate::types::{LicenseKey, Payload, QueueItem};
    use chrono::Duration;
    use keymint_billing::{FakePaymentApi, PaymentIntent, Price};
    use keymint_core::{ChargeId, CustomerId, PaymentIntentId, PriceId};

    fn failed_item(age: Duration) -> QueueItem {
        let mut item = QueueItem::new(
            CustomerId::new("cus_1").unwrap(),
            "user@example.com",
            PaymentIntentId::new("pi_1").unwrap(),
            PriceId::new("price_1").unwrap(),
            LicenseKey::Final("KEY-1".to_string()),
            2,
            None,
            Payload::Quantity,
        );
        item.created_at = Utc::now() - age;
        item
    }

    fn payments_with_intent() -> FakePaymentApi {
        FakePaymentApi::new().with_payment_intent(PaymentIntent {
            id: PaymentIntentId::new("pi_1").unwrap(),
            charge_id: Some(ChargeId::new("ch_1").unwrap()),
            amount: 2000,
            currency: "usd".to_string(),
        })
    }

    async fn seed_failed(queue: &InMemoryQueueStore, age: Duration) -> keymint_core::QueueId {
        let item = failed_item(age);
        let id = queue.insert(item).await.unwrap();
        let now = Utc::now();
        queue.claim_batch(10, now).await.unwrap();
        queue.mark_failed(id, "external api down", now).await.unwrap();
        id
    }

    #[tokio::test]
    async fn young_failures_are_not_refunded() {
        let queue = Arc::new(InMemoryQueueStore::new());
        let payments = Arc::new(payments_with_intent());
        seed_failed(&queue, Duration::hours(1)).await;

        let compensator = Compensator::new(queue.clone(), payments.clone());
        assert_eq!(compensator.run_once(Utc::now()).await.unwrap(), 0);
        assert_eq!(payments.refunds_issued(), 0);
    }

    #[tokio::test]
    async fn aged_failure_is_refunded_exactly_once() {
        let queue = Arc::new(InMemoryQueueStore::new());
        let payments = Arc::new(payments_with_intent());
        let id = seed_failed(&queue, Duration::hours(13)).await;

        let compensator = Compensator::new(queue.clone(), payments.clone());
        assert_eq!(compensator.run_once(Utc::now()).await.unwrap(), 1);
        assert_eq!(payments.refunds_issued(), 1);

        let row = queue.get(id).await.unwrap().unwrap();
        assert!(row.has_refund_marker());
        assert!(row.error_message.unwrap().contains("external api down"));
        assert!(queue.refund_for(id).await.unwrap().is_some());

        // Second pass is a no-op.
        assert_eq!(compensator.run_once(Utc::now()).await.unwrap(), 0);
        assert_eq!(payments.refunds_issued(), 1);
    }

    #[tokio::test]
    async fn refund_amount_uses_price_unit_amount_when_available() {
        let queue = Arc::new(InMemoryQueueStore::new());
        let payments = Arc::new(payments_with_intent().with_price(Price {
            id: PriceId::new("price_1").unwrap(),
            unit_amount: Some(750),
            currency: "usd".to_string(),
        }));
        let id = seed_failed(&queue, Duration::hours(13)).await;

        let compensator = Compensator::new(queue.clone(), payments.clone());
        compensator.run_once(Utc::now()).await.unwrap();

        // Quantity payload with quantity 2: two units at 750.
        let record = queue.refund_for(id).await.unwrap().unwrap();
        assert_eq!(record.amount, 1500);
    }

    #[tokio::test]
    async fn refund_amount_falls_back_to_amount_split() {
        let queue = Arc::new(InMemoryQueueStore::new());
        // No price registered: lookup fails, split 2000 over quantity 2.
        let payments = Arc::new(payments_with_intent());
        let id = seed_failed(&queue, Duration::hours(13)).await;

        let compensator = Compensator::new(queue.clone(), payments.clone());
        compensator.run_once(Utc::now()).await.unwrap();

        let record = queue.refund_for(id).await.unwrap().unwrap();
        assert_eq!(record.amount, 2000);
    }

    #[tokio::test]
    async fn failed_refund_leaves_row_eligible() {
        let queue = Arc::new(InMemoryQueueStore::new());
        let payments = Arc::new(payments_with_intent());
        payments.always_fail_refunds();
        let id = seed_failed(&queue, Duration::hours(13)).await;

        let compensator = Compensator::new(queue.clone(), payments.clone());
        assert_eq!(compensator.run_once(Utc::now()).await.unwrap(), 0);

        let row = queue.get(id).await.unwrap().unwrap();
        assert!(!row.has_refund_marker());

        // Provider recovers; the next pass pays exactly once.
        payments.heal();
        assert_eq!(compensator.run_once(Utc::now()).await.unwrap(), 1);
        assert_eq!(payments.refunds_issued(), 1);
    }

    #[tokio::test]
    async fn orphaned_refund_record_repairs_marker_without_paying() {
        let queue = Arc::new(InMemoryQueueStore::new());
        let payments = Arc::new(payments_with_intent());
        let id = seed_failed(&queue, Duration::hours(13)).await;

        // A refund record exists but the marker write was lost.
        queue
            .insert_refund(RefundRecord {
                refund_id: RefundId::new("re_prior").unwrap(),
                queue_id: id,
                license_key: "KEY-1".to_string(),
                amount: 2000,
                currency: "usd".to_string(),
                status: "succeeded".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let compensator = Compensator::new(queue.clone(), payments.clone());
        assert_eq!(compensator.run_once(Utc::now()).await.unwrap(), 0);
        assert_eq!(payments.refunds_issued(), 0);

        let row = queue.get(id).await.unwrap().unwrap();
        assert!(row.has_refund_marker());
    }
}
