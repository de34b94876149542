//! Duplicate detection.
//!
//! Job execution is not transactional across the external payment call and
//! the local store, and delivery is at-least-once (event redelivery plus
//! crash-restart reaping). These store-backed checks are what turn "at least
//! once executed" into "at most once effective". Both layers are necessary:
//! the enqueue-time check defends against redelivered events, the
//! process-time check against two rows racing toward the same outcome.

use std::sync::Arc;

use tracing::debug;

use keymint_billing::AccountStore;
use keymint_core::{PaymentIntentId, SubscriptionId, SubscriptionItemId};

use crate::error::QueueError;
use crate::store::QueueStore;
use crate::types::QueueItem;

/// A subscription found to already fulfill a license key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingFulfillment {
    pub subscription_id: SubscriptionId,
    pub item_id: Option<SubscriptionItemId>,
}

/// Store-backed idempotency checks. Deliberately holds no in-process cache;
/// every check hits the stores so it is valid across restarts and instances.
pub struct Deduplicator {
    queue: Arc<dyn QueueStore>,
    accounts: Arc<dyn AccountStore>,
}

impl Deduplicator {
    pub fn new(queue: Arc<dyn QueueStore>, accounts: Arc<dyn AccountStore>) -> Self {
        Self { queue, accounts }
    }

    /// Enqueue-time check: an existing pending/processing/completed item for
    /// the same `(payment_intent_id, license_key)` pair makes a new insert a
    /// duplicate.
    pub async fn find_existing_item(
        &self,
        payment_intent_id: &PaymentIntentId,
        license_key: &str,
    ) -> Result<Option<QueueItem>, QueueError> {
        let existing = self
            .queue
            .find_duplicate(payment_intent_id, license_key)
            .await?;
        if let Some(item) = &existing {
            debug!(
                queue_id = %item.queue_id,
                payment_intent_id = %payment_intent_id,
                license_key,
                "enqueue dedup hit"
            );
        }
        Ok(existing)
    }

    /// Process-time check: is this license key already fulfilled by a
    /// subscription? Covers the attempt that succeeded externally but died
    /// before its queue row recorded success. Run once before starting work
    /// and once more immediately before the create call.
    pub async fn find_fulfilled(
        &self,
        license_key: &str,
    ) -> Result<Option<ExistingFulfillment>, QueueError> {
        let license = self.accounts.license_by_key(license_key).await?;
        Ok(license.and_then(|l| {
            l.subscription_id.map(|subscription_id| ExistingFulfillment {
                subscription_id,
                item_id: l.item_id,
            })
        }))
    }
}
