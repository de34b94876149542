//! Core queue item types and policies.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use keymint_core::{
    CustomerId, PaymentIntentId, PriceId, QueueId, RefundId, SubscriptionId, SubscriptionItemId,
};

/// How long a `processing` row may sit without an update before the claim is
/// considered abandoned and the row is reaped back to `pending`.
pub const STALE_CLAIM_AFTER: Duration = Duration::minutes(5);

/// How long a terminally failed row must age before it becomes refundable.
pub const REFUND_GRACE_WINDOW: Duration = Duration::hours(12);

/// Marker appended to `error_message` once a refund has been issued for a
/// row. Its presence (or a stored refund record) is what makes the
/// compensator idempotent.
pub const REFUND_MARKER: &str = "[refund-issued";

/// Queue item lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be claimed (or waiting out a retry backoff).
    Pending,
    /// Exclusively owned by one processing pass.
    Processing,
    /// Fulfilled; the row is immutable from here on.
    Completed,
    /// Attempts exhausted; visible to the compensator after the grace window.
    Failed,
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

/// Two-phase license key.
///
/// A `Provisional` key is a cheap placeholder (`L1`, `L2`, …) assigned at
/// enqueue time when real key generation is deferred. The `Final` key is
/// assigned exactly once during processing, uniqueness-checked against the
/// account store, and the swap is persisted in the same update that marks
/// the row completed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "phase", content = "key", rename_all = "snake_case")]
pub enum LicenseKey {
    Provisional(String),
    Final(String),
}

impl LicenseKey {
    /// Placeholder for the `index`-th unit of a payment (1-based).
    pub fn provisional(index: u32) -> Self {
        Self::Provisional(format!("L{index}"))
    }

    pub fn is_final(&self) -> bool {
        matches!(self, LicenseKey::Final(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            LicenseKey::Provisional(k) | LicenseKey::Final(k) => k,
        }
    }
}

impl std::fmt::Display for LicenseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-flavor payload. The two queue flavors (seat-quantity purchases and
/// per-site purchases) share claim/retry/reap logic and differ only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// One subscription carrying `quantity` seats.
    Quantity,
    /// One subscription (quantity 1) bound to a site.
    Site { site_domain: String },
}

impl Payload {
    /// Seats to request on the downstream subscription.
    pub fn subscription_quantity(&self, item_quantity: u32) -> u32 {
        match self {
            Payload::Quantity => item_quantity,
            Payload::Site { .. } => 1,
        }
    }

    /// Units of the original purchase this job covers (refund math).
    pub fn units(&self, item_quantity: u32) -> u32 {
        match self {
            Payload::Quantity => item_quantity,
            Payload::Site { .. } => 1,
        }
    }
}

/// One row of fulfillment work: turns a slice of a successful payment into a
/// subscription plus license key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: QueueId,
    pub customer_id: CustomerId,
    pub user_email: String,
    /// External reference to the payment event that funded this job; part of
    /// the dedup identity together with `license_key`.
    pub payment_intent_id: PaymentIntentId,
    pub price_id: PriceId,
    pub license_key: LicenseKey,
    /// Quantity of the original purchase.
    pub quantity: u32,
    pub trial_end: Option<DateTime<Utc>>,
    pub payload: Payload,
    pub status: QueueStatus,
    /// Number of processing attempts started so far. Only ever increases.
    pub attempts: u32,
    pub max_attempts: u32,
    pub error_message: Option<String>,
    /// Earliest time this row may be claimed again.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub subscription_id: Option<SubscriptionId>,
    pub item_id: Option<SubscriptionItemId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Default attempt budget.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    pub fn new(
        customer_id: CustomerId,
        user_email: impl Into<String>,
        payment_intent_id: PaymentIntentId,
        price_id: PriceId,
        license_key: LicenseKey,
        quantity: u32,
        trial_end: Option<DateTime<Utc>>,
        payload: Payload,
    ) -> Self {
        let now = Utc::now();
        Self {
            queue_id: QueueId::new(),
            customer_id,
            user_email: user_email.into(),
            payment_intent_id,
            price_id,
            license_key,
            quantity,
            trial_end,
            payload,
            status: QueueStatus::Pending,
            attempts: 0,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            error_message: None,
            next_retry_at: None,
            subscription_id: None,
            item_id: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Whether the row may be claimed at `now` (pending and past backoff).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Pending
            && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Whether a `processing` claim on this row has gone stale at `now`.
    pub fn claim_is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Processing && self.updated_at + STALE_CLAIM_AFTER < now
    }

    /// Whether the row already carries the refund marker.
    pub fn has_refund_marker(&self) -> bool {
        self.error_message
            .as_deref()
            .map_or(false, |m| m.contains(REFUND_MARKER))
    }
}

/// Retry policy: bounded attempts with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempt budget (attempts are 1-indexed once a claim starts).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: QueueItem::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Backoff before the next attempt: `2^attempts` minutes, so roughly
    /// 2, 4, 8 minutes after attempts 1, 2, 3.
    pub fn delay_after_attempt(&self, attempts: u32) -> Duration {
        let capped = attempts.min(16);
        Duration::minutes(1i64 << capped)
    }

    /// Whether another attempt is allowed after `attempts` have run.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub fn next_retry_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        now + self.delay_after_attempt(attempts)
    }
}

/// Aggregate row counts for the dashboard status endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Refund audit record; at most one per queue item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub refund_id: RefundId,
    pub queue_id: QueueId,
    pub license_key: String,
    /// Amount refunded, in minor currency units.
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Request to enqueue one unit of fulfillment work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub customer_id: CustomerId,
    pub user_email: String,
    pub payment_intent_id: PaymentIntentId,
    pub price_id: PriceId,
    /// Real license key when the caller already has one; `None` defers key
    /// generation and gets a provisional placeholder.
    pub license_key: Option<String>,
    pub quantity: u32,
    pub trial_end: Option<DateTime<Utc>>,
    pub payload: Payload,
    /// Position of this unit within its payment (1-based); names the
    /// provisional placeholder when `license_key` is deferred.
    pub unit_index: u32,
}

impl EnqueueRequest {
    pub fn new(
        customer_id: CustomerId,
        user_email: impl Into<String>,
        payment_intent_id: PaymentIntentId,
        price_id: PriceId,
        quantity: u32,
        payload: Payload,
    ) -> Self {
        Self {
            customer_id,
            user_email: user_email.into(),
            payment_intent_id,
            price_id,
            license_key: None,
            quantity,
            trial_end: None,
            payload,
            unit_index: 1,
        }
    }

    pub fn with_license_key(mut self, key: impl Into<String>) -> Self {
        self.license_key = Some(key.into());
        self
    }

    pub fn with_trial_end(mut self, at: DateTime<Utc>) -> Self {
        self.trial_end = Some(at);
        self
    }

    pub fn with_unit_index(mut self, index: u32) -> Self {
        self.unit_index = index;
        self
    }

    /// The license key this request will enqueue under.
    pub fn effective_key(&self) -> LicenseKey {
        match &self.license_key {
            Some(k) => LicenseKey::Final(k.clone()),
            None => LicenseKey::provisional(self.unit_index),
        }
    }
}

/// Outcome of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueResult {
    pub queue_id: QueueId,
    /// True when an equivalent item already existed and no row was inserted.
    pub skipped: bool,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn backoff_follows_two_to_the_attempts_minutes() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after_attempt(1), Duration::minutes(2));
        assert_eq!(policy.delay_after_attempt(2), Duration::minutes(4));
        assert_eq!(policy.delay_after_attempt(3), Duration::minutes(8));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::new(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    proptest! {
        #[test]
        fn backoff_is_strictly_monotonic(attempts in 1u32..16) {
            let policy = RetryPolicy::default();
            prop_assert!(
                policy.delay_after_attempt(attempts) < policy.delay_after_attempt(attempts + 1)
            );
        }

        #[test]
        fn next_retry_is_always_in_the_future(attempts in 1u32..32) {
            let policy = RetryPolicy::default();
            let now = Utc::now();
            prop_assert!(policy.next_retry_at(now, attempts) > now);
        }
    }

    #[test]
    fn provisional_keys_are_indexed() {
        assert_eq!(LicenseKey::provisional(1).as_str(), "L1");
        assert_eq!(LicenseKey::provisional(7).as_str(), "L7");
        assert!(!LicenseKey::provisional(1).is_final());
        assert!(LicenseKey::Final("KEY-AAAA".into()).is_final());
    }

    #[test]
    fn due_and_staleness_checks() {
        let now = Utc::now();
        let mut item = QueueItem::new(
            CustomerId::new("cus_1").unwrap(),
            "user@example.com",
            PaymentIntentId::new("pi_1").unwrap(),
            PriceId::new("price_1").unwrap(),
            LicenseKey::provisional(1),
            1,
            None,
            Payload::Quantity,
        );
        assert!(item.is_due(now));

        item.next_retry_at = Some(now + Duration::minutes(2));
        assert!(!item.is_due(now));
        assert!(item.is_due(now + Duration::minutes(3)));

        item.status = QueueStatus::Processing;
        item.updated_at = now;
        assert!(!item.claim_is_stale(now + Duration::minutes(4)));
        assert!(item.claim_is_stale(now + Duration::minutes(6)));
    }

    #[test]
    fn refund_marker_detection() {
        let mut item = QueueItem::new(
            CustomerId::new("cus_1").unwrap(),
            "user@example.com",
            PaymentIntentId::new("pi_1").unwrap(),
            PriceId::new("price_1").unwrap(),
            LicenseKey::Final("KEY-1".into()),
            1,
            None,
            Payload::Quantity,
        );
        assert!(!item.has_refund_marker());
        item.error_message = Some(format!("create failed {REFUND_MARKER} re_1]"));
        assert!(item.has_refund_marker());
    }

    #[test]
    fn site_payload_requests_a_single_seat() {
        let site = Payload::Site {
            site_domain: "example.com".into(),
        };
        assert_eq!(site.subscription_quantity(5), 1);
        assert_eq!(site.units(5), 1);
        assert_eq!(Payload::Quantity.subscription_quantity(5), 5);
        assert_eq!(Payload::Quantity.units(5), 5);
    }
}
