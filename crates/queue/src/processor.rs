//! Single-job execution.
//!
//! A claimed row runs to exactly one of: completed, pending-with-backoff, or
//! failed. Every failure inside the attempt (external call, local write,
//! verification) is converted into a row-state transition; only trouble
//! writing the transition itself propagates to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use keymint_billing::{
    AccountStore, CreateSubscriptionRequest, LicenseRecord, PaymentApi, PaymentRecord,
    SubscriptionRecord,
};
use keymint_core::{DomainError, SubscriptionId, SubscriptionItemId};

use crate::dedup::Deduplicator;
use crate::error::QueueError;
use crate::keys::KeyGenerator;
use crate::store::QueueStore;
use crate::types::{Payload, QueueItem, QueueStatus, RetryPolicy};

/// How a processing attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Fulfilled: subscription created, records written and verified.
    Completed,
    /// Fulfilled by an earlier attempt; reused the existing subscription.
    CompletedDuplicate,
    /// Attempt failed; row is pending again with a future `next_retry_at`.
    Rescheduled,
    /// Attempts exhausted; row is terminally failed.
    Failed,
}

/// What a successful attempt produced.
struct Fulfillment {
    subscription_id: SubscriptionId,
    item_id: Option<SubscriptionItemId>,
    final_key: String,
    reused: bool,
}

/// Executes one claimed queue item.
pub struct JobProcessor {
    queue: Arc<dyn QueueStore>,
    accounts: Arc<dyn AccountStore>,
    payments: Arc<dyn PaymentApi>,
    dedup: Deduplicator,
    keys: KeyGenerator,
}

impl JobProcessor {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        accounts: Arc<dyn AccountStore>,
        payments: Arc<dyn PaymentApi>,
    ) -> Self {
        let dedup = Deduplicator::new(queue.clone(), accounts.clone());
        Self {
            queue,
            accounts,
            payments,
            dedup,
            keys: KeyGenerator::default(),
        }
    }

    pub fn with_key_generator(mut self, keys: KeyGenerator) -> Self {
        self.keys = keys;
        self
    }

    /// Run one claimed item to a terminal-for-this-attempt outcome.
    ///
    /// The item must have been claimed through `claim_batch` (status
    /// `processing`, `attempts` already incremented).
    pub async fn process(&self, item: &QueueItem) -> Result<ProcessOutcome, QueueError> {
        if item.status != QueueStatus::Processing {
            return Err(QueueError::Domain(DomainError::invariant(format!(
                "process called on unclaimed row {} ({})",
                item.queue_id,
                item.status.as_str()
            ))));
        }

        debug!(
            queue_id = %item.queue_id,
            attempt = item.attempts,
            license_key = %item.license_key,
            "processing queue item"
        );

        match self.attempt(item).await {
            Ok(fulfillment) => {
                let now = Utc::now();
                self.queue
                    .mark_completed(
                        item.queue_id,
                        fulfillment.subscription_id.clone(),
                        fulfillment.item_id.clone(),
                        &fulfillment.final_key,
                        now,
                    )
                    .await?;

                // Best-effort audit record; never fails the job.
                if !fulfillment.reused {
                    let audit = PaymentRecord {
                        payment_intent_id: item.payment_intent_id.clone(),
                        customer_id: item.customer_id.clone(),
                        description: format!(
                            "fulfilled {} as {}",
                            fulfillment.final_key, fulfillment.subscription_id
                        ),
                        created_at: now,
                    };
                    if let Err(e) = self.accounts.record_payment(audit).await {
                        warn!(queue_id = %item.queue_id, error = %e, "audit record write failed");
                    }
                }

                info!(
                    queue_id = %item.queue_id,
                    subscription_id = %fulfillment.subscription_id,
                    reused = fulfillment.reused,
                    "queue item completed"
                );
                Ok(if fulfillment.reused {
                    ProcessOutcome::CompletedDuplicate
                } else {
                    ProcessOutcome::Completed
                })
            }
            Err(e) => {
                let error = e.to_string();
                let now = Utc::now();
                let policy = RetryPolicy::new(item.max_attempts);

                if policy.should_retry(item.attempts) {
                    let next_retry_at = policy.next_retry_at(now, item.attempts);
                    self.queue
                        .reschedule(item.queue_id, item.attempts, &error, next_retry_at, now)
                        .await?;
                    warn!(
                        queue_id = %item.queue_id,
                        attempt = item.attempts,
                        error = %error,
                        next_retry_at = %next_retry_at,
                        "queue item rescheduled"
                    );
                    Ok(ProcessOutcome::Rescheduled)
                } else {
                    self.queue.mark_failed(item.queue_id, &error, now).await?;
                    warn!(
                        queue_id = %item.queue_id,
                        attempts = item.attempts,
                        error = %error,
                        "queue item terminally failed"
                    );
                    Ok(ProcessOutcome::Failed)
                }
            }
        }
    }

    /// One fulfillment attempt. Any `Err` here is an attempt failure and
    /// feeds the retry policy, never the caller.
    async fn attempt(&self, item: &QueueItem) -> Result<Fulfillment, QueueError> {
        // Dedup (a): an earlier attempt may have fulfilled this key and died
        // before recording success on the queue row.
        if let Some(existing) = self.dedup.find_fulfilled(item.license_key.as_str()).await? {
            debug!(
                queue_id = %item.queue_id,
                subscription_id = %existing.subscription_id,
                "license already fulfilled; reusing subscription"
            );
            return Ok(Fulfillment {
                subscription_id: existing.subscription_id,
                item_id: existing.item_id,
                final_key: item.license_key.as_str().to_string(),
                reused: true,
            });
        }

        // Assign the final key exactly once; provisional placeholders are
        // swapped for a collision-checked key.
        let final_key = if item.license_key.is_final() {
            item.license_key.clone()
        } else {
            self.keys.generate_unique(self.accounts.as_ref()).await?
        };

        // Dedup (b): final re-check immediately before the external create,
        // closing the race window since check (a).
        if let Some(existing) = self.dedup.find_fulfilled(final_key.as_str()).await? {
            return Ok(Fulfillment {
                subscription_id: existing.subscription_id,
                item_id: existing.item_id,
                final_key: final_key.as_str().to_string(),
                reused: true,
            });
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("queue_id".to_string(), item.queue_id.to_string());
        metadata.insert("license_key".to_string(), final_key.as_str().to_string());
        metadata.insert(
            "payment_intent_id".to_string(),
            item.payment_intent_id.to_string(),
        );
        if let Payload::Site { site_domain } = &item.payload {
            metadata.insert("site_domain".to_string(), site_domain.clone());
        }

        let subscription = self
            .payments
            .create_subscription(CreateSubscriptionRequest {
                customer_id: item.customer_id.clone(),
                price_id: item.price_id.clone(),
                quantity: item.payload.subscription_quantity(item.quantity),
                trial_end: item.trial_end,
                metadata,
            })
            .await?;

        let now = Utc::now();
        self.accounts
            .put_subscription(SubscriptionRecord {
                subscription_id: subscription.id.clone(),
                item_id: subscription.item_id.clone(),
                customer_id: item.customer_id.clone(),
                user_email: item.user_email.clone(),
                price_id: item.price_id.clone(),
                quantity: item.payload.subscription_quantity(item.quantity),
                status: subscription.status.clone(),
                current_period_start: subscription.current_period_start,
                current_period_end: subscription.current_period_end,
                created_at: now,
            })
            .await?;
        self.accounts
            .put_license(LicenseRecord {
                license_key: final_key.as_str().to_string(),
                customer_id: item.customer_id.clone(),
                user_email: item.user_email.clone(),
                subscription_id: Some(subscription.id.clone()),
                item_id: Some(subscription.item_id.clone()),
                status: "active".to_string(),
                created_at: now,
            })
            .await?;

        // Verify after write: both records must be independently re-readable
        // before the job may be called done. A failed verification is a
        // failure even though the external subscription now exists; the next
        // attempt's dedup check finds it and avoids a second create.
        let stored_subscription = self.accounts.subscription(&subscription.id).await?;
        let stored_license = self.accounts.license_by_key(final_key.as_str()).await?;
        let verified = stored_subscription.is_some()
            && stored_license
                .map_or(false, |l| l.subscription_id.as_ref() == Some(&subscription.id));
        if !verified {
            return Err(QueueError::Domain(DomainError::invariant(format!(
                "write verification failed for {} ({})",
                item.queue_id,
                final_key.as_str()
            ))));
        }

        Ok(Fulfillment {
            subscription_id: subscription.id,
            item_id: Some(subscription.item_id),
            final_key: final_key.as_str().to_string(),
            reused: false,
        })
    }
}
