//! Queue persistence.
//!
//! The conditional claim update in `claim_batch` is the sole concurrency
//! control in the system: whoever flips a row from `pending` to `processing`
//! owns it until they write a terminal or requeue status. There is no lock
//! manager and no transaction spanning the external payment call.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use keymint_core::{CustomerId, PaymentIntentId, QueueId, SubscriptionId, SubscriptionItemId};

use crate::types::{
    LicenseKey, QueueItem, QueueStats, QueueStatus, RefundRecord, STALE_CLAIM_AFTER,
};

/// Queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueStoreError {
    #[error("queue item not found: {0}")]
    NotFound(QueueId),
    #[error("queue item already exists: {0}")]
    AlreadyExists(QueueId),
    #[error("invalid transition for {queue_id}: {current} -> {requested}")]
    InvalidTransition {
        queue_id: QueueId,
        current: &'static str,
        requested: &'static str,
    },
    #[error("refund already recorded for {0}")]
    RefundExists(QueueId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistence seam for queue rows and refund records.
///
/// `insert` deliberately does not dedup; callers run the deduplication check
/// first so the primitive stays cheap inside the caller's dedup window.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new item. The caller has already checked for duplicates.
    async fn insert(&self, item: QueueItem) -> Result<QueueId, QueueStoreError>;

    /// Fetch one item.
    async fn get(&self, queue_id: QueueId) -> Result<Option<QueueItem>, QueueStoreError>;

    /// Two-phase claim:
    ///
    /// (a) reap: any `processing` row whose `updated_at` is older than the
    ///     staleness threshold goes back to `pending` (reclaims work from
    ///     crashed passes);
    /// (b) claim: for each due pending row (oldest first, up to `limit`), a
    ///     conditional update `status='processing' WHERE status='pending'`.
    ///     Zero rows affected means the claim race was lost and the row is
    ///     skipped.
    ///
    /// Claimed rows come back with `attempts` already incremented.
    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueStoreError>;

    /// Terminal success. Persists the provisional→final key swap, the
    /// subscription linkage and `processed_at` in the same update that
    /// advances status. Only valid from `processing`.
    async fn mark_completed(
        &self,
        queue_id: QueueId,
        subscription_id: SubscriptionId,
        item_id: Option<SubscriptionItemId>,
        final_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError>;

    /// Terminal failure. Only valid from `processing`.
    async fn mark_failed(
        &self,
        queue_id: QueueId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError>;

    /// Back to `pending` with a future `next_retry_at`. Only valid from
    /// `processing`.
    async fn reschedule(
        &self,
        queue_id: QueueId,
        attempts: u32,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError>;

    /// Existing non-duplicate item for this `(payment_intent_id, license_key)`
    /// pair, over pending/processing/completed rows.
    async fn find_duplicate(
        &self,
        payment_intent_id: &PaymentIntentId,
        license_key: &str,
    ) -> Result<Option<QueueItem>, QueueStoreError>;

    /// Failed rows created before `cutoff` that do not yet carry the refund
    /// marker, oldest first.
    async fn scan_failed_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueStoreError>;

    /// Cheap existence check: any pending row due at `now` (or any stale
    /// `processing` row waiting to be reaped)?
    async fn has_runnable(&self, now: DateTime<Utc>) -> Result<bool, QueueStoreError>;

    /// Cheap existence check: any unrefunded failed row older than `cutoff`?
    async fn has_refundable(&self, cutoff: DateTime<Utc>) -> Result<bool, QueueStoreError>;

    /// Append a refund note to the row's `error_message`. The row stays
    /// `failed`; refunded rows are audit trail, never deleted.
    async fn append_refund_marker(
        &self,
        queue_id: QueueId,
        note: &str,
    ) -> Result<(), QueueStoreError>;

    /// Persist a refund record; at most one per queue item.
    async fn insert_refund(&self, record: RefundRecord) -> Result<(), QueueStoreError>;

    /// The refund record for a queue item, if one exists.
    async fn refund_for(&self, queue_id: QueueId) -> Result<Option<RefundRecord>, QueueStoreError>;

    /// Aggregate counts, optionally scoped to one customer.
    async fn stats(&self, customer: Option<&CustomerId>) -> Result<QueueStats, QueueStoreError>;
}

/// In-memory queue store for tests/dev.
///
/// Mirrors the conditional-update discipline of the durable store: the claim
/// re-checks `status == Pending` under the write lock and treats a miss as a
/// lost race, so concurrency tests exercise the same protocol.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    items: RwLock<HashMap<QueueId, QueueItem>>,
    refunds: RwLock<HashMap<QueueId, RefundRecord>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err<T>(_: T) -> QueueStoreError {
        QueueStoreError::Storage("queue store lock poisoned".to_string())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert(&self, item: QueueItem) -> Result<QueueId, QueueStoreError> {
        let mut items = self.items.write().map_err(Self::lock_err)?;
        if items.contains_key(&item.queue_id) {
            return Err(QueueStoreError::AlreadyExists(item.queue_id));
        }
        let id = item.queue_id;
        items.insert(id, item);
        Ok(id)
    }

    async fn get(&self, queue_id: QueueId) -> Result<Option<QueueItem>, QueueStoreError> {
        Ok(self
            .items
            .read()
            .map_err(Self::lock_err)?
            .get(&queue_id)
            .cloned())
    }

    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let mut items = self.items.write().map_err(Self::lock_err)?;

        // Phase (a): reap stale claims back to pending.
        for item in items.values_mut() {
            if item.claim_is_stale(now) {
                item.status = QueueStatus::Pending;
                item.updated_at = now;
            }
        }

        // Phase (b): claim due pending rows, oldest first. The status
        // re-check is the in-memory analogue of the conditional UPDATE.
        let mut candidates: Vec<(DateTime<Utc>, QueueId)> = items
            .values()
            .filter(|i| i.is_due(now))
            .map(|i| (i.created_at, i.queue_id))
            .collect();
        candidates.sort_by_key(|(created_at, _)| *created_at);
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(item) = items.get_mut(&id) {
                if item.status != QueueStatus::Pending {
                    // Lost the claim race.
                    continue;
                }
                item.status = QueueStatus::Processing;
                item.attempts += 1;
                item.updated_at = now;
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_completed(
        &self,
        queue_id: QueueId,
        subscription_id: SubscriptionId,
        item_id: Option<SubscriptionItemId>,
        final_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let mut items = self.items.write().map_err(Self::lock_err)?;
        let item = items
            .get_mut(&queue_id)
            .ok_or(QueueStoreError::NotFound(queue_id))?;
        if item.status != QueueStatus::Processing {
            return Err(QueueStoreError::InvalidTransition {
                queue_id,
                current: item.status.as_str(),
                requested: "completed",
            });
        }
        item.status = QueueStatus::Completed;
        item.subscription_id = Some(subscription_id);
        item.item_id = item_id;
        item.license_key = LicenseKey::Final(final_key.to_string());
        item.error_message = None;
        item.next_retry_at = None;
        item.processed_at = Some(now);
        item.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        queue_id: QueueId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let mut items = self.items.write().map_err(Self::lock_err)?;
        let item = items
            .get_mut(&queue_id)
            .ok_or(QueueStoreError::NotFound(queue_id))?;
        if item.status != QueueStatus::Processing {
            return Err(QueueStoreError::InvalidTransition {
                queue_id,
                current: item.status.as_str(),
                requested: "failed",
            });
        }
        item.status = QueueStatus::Failed;
        item.error_message = Some(error.to_string());
        item.next_retry_at = None;
        item.updated_at = now;
        Ok(())
    }

    async fn reschedule(
        &self,
        queue_id: QueueId,
        attempts: u32,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let mut items = self.items.write().map_err(Self::lock_err)?;
        let item = items
            .get_mut(&queue_id)
            .ok_or(QueueStoreError::NotFound(queue_id))?;
        if item.status != QueueStatus::Processing {
            return Err(QueueStoreError::InvalidTransition {
                queue_id,
                current: item.status.as_str(),
                requested: "pending",
            });
        }
        item.status = QueueStatus::Pending;
        item.attempts = attempts;
        item.error_message = Some(error.to_string());
        item.next_retry_at = Some(next_retry_at);
        item.updated_at = now;
        Ok(())
    }

    async fn find_duplicate(
        &self,
        payment_intent_id: &PaymentIntentId,
        license_key: &str,
    ) -> Result<Option<QueueItem>, QueueStoreError> {
        let items = self.items.read().map_err(Self::lock_err)?;
        Ok(items
            .values()
            .filter(|i| {
                &i.payment_intent_id == payment_intent_id
                    && i.license_key.as_str() == license_key
                    && matches!(
                        i.status,
                        QueueStatus::Pending | QueueStatus::Processing | QueueStatus::Completed
                    )
            })
            .min_by_key(|i| i.created_at)
            .cloned())
    }

    async fn scan_failed_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let items = self.items.read().map_err(Self::lock_err)?;
        let mut result: Vec<QueueItem> = items
            .values()
            .filter(|i| {
                i.status == QueueStatus::Failed
                    && i.created_at < cutoff
                    && !i.has_refund_marker()
            })
            .cloned()
            .collect();
        result.sort_by_key(|i| i.created_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn has_runnable(&self, now: DateTime<Utc>) -> Result<bool, QueueStoreError> {
        let items = self.items.read().map_err(Self::lock_err)?;
        Ok(items
            .values()
            .any(|i| i.is_due(now) || i.claim_is_stale(now)))
    }

    async fn has_refundable(&self, cutoff: DateTime<Utc>) -> Result<bool, QueueStoreError> {
        let items = self.items.read().map_err(Self::lock_err)?;
        Ok(items.values().any(|i| {
            i.status == QueueStatus::Failed && i.created_at < cutoff && !i.has_refund_marker()
        }))
    }

    async fn append_refund_marker(
        &self,
        queue_id: QueueId,
        note: &str,
    ) -> Result<(), QueueStoreError> {
        let mut items = self.items.write().map_err(Self::lock_err)?;
        let item = items
            .get_mut(&queue_id)
            .ok_or(QueueStoreError::NotFound(queue_id))?;
        item.error_message = Some(match item.error_message.take() {
            Some(existing) => format!("{existing} {note}"),
            None => note.to_string(),
        });
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_refund(&self, record: RefundRecord) -> Result<(), QueueStoreError> {
        let mut refunds = self.refunds.write().map_err(Self::lock_err)?;
        if refunds.contains_key(&record.queue_id) {
            return Err(QueueStoreError::RefundExists(record.queue_id));
        }
        refunds.insert(record.queue_id, record);
        Ok(())
    }

    async fn refund_for(
        &self,
        queue_id: QueueId,
    ) -> Result<Option<RefundRecord>, QueueStoreError> {
        Ok(self
            .refunds
            .read()
            .map_err(Self::lock_err)?
            .get(&queue_id)
            .cloned())
    }

    async fn stats(&self, customer: Option<&CustomerId>) -> Result<QueueStats, QueueStoreError> {
        let items = self.items.read().map_err(Self::lock_err)?;
        let mut stats = QueueStats::default();
        for item in items.values() {
            if let Some(c) = customer {
                if &item.customer_id != c {
                    continue;
                }
            }
            stats.total += 1;
            match item.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Processing => stats.processing += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Payload, REFUND_MARKER};
    use chrono::Duration;
    use keymint_core::PriceId;

    fn item(key: &str) -> QueueItem {
        QueueItem::new(
            CustomerId::new("cus_1").unwrap(),
            "user@example.com",
            PaymentIntentId::new("pi_1").unwrap(),
            PriceId::new("price_1").unwrap(),
            LicenseKey::Final(key.to_string()),
            1,
            None,
            Payload::Quantity,
        )
    }

    #[tokio::test]
    async fn insert_and_claim_increments_attempts() {
        let store = InMemoryQueueStore::new();
        let id = store.insert(item("KEY-1")).await.unwrap();

        let now = Utc::now();
        let claimed = store.claim_batch(10, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].queue_id, id);
        assert_eq!(claimed[0].status, QueueStatus::Processing);
        assert_eq!(claimed[0].attempts, 1);

        // Already processing; nothing further to claim.
        assert!(store.claim_batch(10, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_respects_next_retry_at() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let mut pending = item("KEY-1");
        pending.next_retry_at = Some(now + Duration::minutes(2));
        store.insert(pending).await.unwrap();

        assert!(store.claim_batch(10, now).await.unwrap().is_empty());
        assert!(!store.has_runnable(now).await.unwrap());

        let later = now + Duration::minutes(3);
        assert!(store.has_runnable(later).await.unwrap());
        assert_eq!(store.claim_batch(10, later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_order_is_created_at_ascending() {
        let store = InMemoryQueueStore::new();
        let mut first = item("KEY-1");
        first.created_at = Utc::now() - Duration::minutes(10);
        let first_id = first.queue_id;
        let second = item("KEY-2");
        store.insert(second).await.unwrap();
        store.insert(first).await.unwrap();

        let claimed = store.claim_batch(1, Utc::now()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].queue_id, first_id);
    }

    #[tokio::test]
    async fn stale_processing_rows_are_reaped() {
        let store = InMemoryQueueStore::new();
        let id = store.insert(item("KEY-1")).await.unwrap();

        let t0 = Utc::now();
        assert_eq!(store.claim_batch(10, t0).await.unwrap().len(), 1);

        // Within the staleness threshold: still owned, not claimable.
        let t1 = t0 + Duration::minutes(4);
        assert!(store.claim_batch(10, t1).await.unwrap().is_empty());

        // Past the threshold: reaped and reclaimed in one pass.
        let t2 = t0 + Duration::minutes(6);
        let reclaimed = store.claim_batch(10, t2).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].queue_id, id);
        assert_eq!(reclaimed[0].attempts, 2);
    }

    #[tokio::test]
    async fn completed_rows_are_immutable() {
        let store = InMemoryQueueStore::new();
        let id = store.insert(item("KEY-1")).await.unwrap();
        let now = Utc::now();
        store.claim_batch(10, now).await.unwrap();
        store
            .mark_completed(
                id,
                SubscriptionId::new("sub_1").unwrap(),
                Some(SubscriptionItemId::new("si_1").unwrap()),
                "KEY-1",
                now,
            )
            .await
            .unwrap();

        let err = store.mark_failed(id, "late failure", now).await.unwrap_err();
        assert!(matches!(err, QueueStoreError::InvalidTransition { .. }));

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);
        assert_eq!(stored.subscription_id.unwrap().as_str(), "sub_1");
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn mark_completed_persists_key_swap() {
        let store = InMemoryQueueStore::new();
        let mut provisional = item("ignored");
        provisional.license_key = LicenseKey::provisional(1);
        let id = provisional.queue_id;
        store.insert(provisional).await.unwrap();

        let now = Utc::now();
        store.claim_batch(10, now).await.unwrap();
        store
            .mark_completed(
                id,
                SubscriptionId::new("sub_1").unwrap(),
                Some(SubscriptionItemId::new("si_1").unwrap()),
                "KEY-FINAL-1",
                now,
            )
            .await
            .unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.license_key, LicenseKey::Final("KEY-FINAL-1".into()));
    }

    #[tokio::test]
    async fn find_duplicate_ignores_failed_rows() {
        let store = InMemoryQueueStore::new();
        let id = store.insert(item("KEY-1")).await.unwrap();
        let pi = PaymentIntentId::new("pi_1").unwrap();

        assert!(store.find_duplicate(&pi, "KEY-1").await.unwrap().is_some());
        assert!(store.find_duplicate(&pi, "KEY-2").await.unwrap().is_none());

        let now = Utc::now();
        store.claim_batch(10, now).await.unwrap();
        store.mark_failed(id, "boom", now).await.unwrap();
        assert!(store.find_duplicate(&pi, "KEY-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refund_records_are_unique_per_item() {
        let store = InMemoryQueueStore::new();
        let id = store.insert(item("KEY-1")).await.unwrap();

        let record = RefundRecord {
            refund_id: keymint_core::RefundId::new("re_1").unwrap(),
            queue_id: id,
            license_key: "KEY-1".to_string(),
            amount: 999,
            currency: "usd".to_string(),
            status: "succeeded".to_string(),
            created_at: Utc::now(),
        };
        store.insert_refund(record.clone()).await.unwrap();
        assert!(matches!(
            store.insert_refund(record).await,
            Err(QueueStoreError::RefundExists(_))
        ));
        assert!(store.refund_for(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn refund_marker_hides_rows_from_refund_scans() {
        let store = InMemoryQueueStore::new();
        let id = store.insert(item("KEY-1")).await.unwrap();
        let now = Utc::now();
        store.claim_batch(10, now).await.unwrap();
        store.mark_failed(id, "boom", now).await.unwrap();

        let cutoff = now + Duration::hours(1);
        assert!(store.has_refundable(cutoff).await.unwrap());
        assert_eq!(store.scan_failed_older_than(cutoff, 10).await.unwrap().len(), 1);

        store
            .append_refund_marker(id, &format!("{REFUND_MARKER} re_1]"))
            .await
            .unwrap();
        assert!(!store.has_refundable(cutoff).await.unwrap());
        assert!(store
            .scan_failed_older_than(cutoff, 10)
            .await
            .unwrap()
            .is_empty());

        // Row itself survives as audit trail.
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        assert!(stored.error_message.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn stats_counts_by_status_and_customer() {
        let store = InMemoryQueueStore::new();
        store.insert(item("KEY-1")).await.unwrap();
        store.insert(item("KEY-2")).await.unwrap();

        let mut other = item("KEY-3");
        other.customer_id = CustomerId::new("cus_2").unwrap();
        store.insert(other).await.unwrap();

        let all = store.stats(None).await.unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.pending, 3);

        let cus_1 = CustomerId::new("cus_1").unwrap();
        let scoped = store.stats(Some(&cus_1)).await.unwrap();
        assert_eq!(scoped.total, 2);
    }
}
