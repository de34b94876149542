//! End-to-end flows over the in-memory stores: enqueue through fulfillment,
//! retry exhaustion through compensation, and claim exclusivity under
//! concurrent runners.

use std::sync::Arc;

use chrono::{Duration, Utc};

use keymint_billing::{
    AccountStore, FakePaymentApi, InMemoryAccountStore, LicenseRecord, PaymentIntent,
    SubscriptionRecord,
};
use keymint_core::{ChargeId, CustomerId, PaymentIntentId, PriceId, SubscriptionId,
    SubscriptionItemId};

use crate::compensator::Compensator;
use crate::processor::{JobProcessor, ProcessOutcome};
use crate::service::FulfillmentQueue;
use crate::store::{InMemoryQueueStore, QueueStore};
use crate::types::{EnqueueRequest, Payload, QueueStatus};

struct World {
    queue: Arc<InMemoryQueueStore>,
    accounts: Arc<InMemoryAccountStore>,
    payments: Arc<FakePaymentApi>,
    service: FulfillmentQueue,
    processor: JobProcessor,
    compensator: Compensator,
}

fn world() -> World {
    let queue = Arc::new(InMemoryQueueStore::new());
    let accounts = Arc::new(InMemoryAccountStore::new());
    let payments = Arc::new(FakePaymentApi::new().with_payment_intent(PaymentIntent {
        id: PaymentIntentId::new("pi_1").unwrap(),
        charge_id: Some(ChargeId::new("ch_1").unwrap()),
        amount: 4900,
        currency: "usd".to_string(),
    }));
    let service = FulfillmentQueue::new(queue.clone(), accounts.clone());
    let processor = JobProcessor::new(queue.clone(), accounts.clone(), payments.clone());
    let compensator = Compensator::new(queue.clone(), payments.clone());
    World {
        queue,
        accounts,
        payments,
        service,
        processor,
        compensator,
    }
}

fn request(key: &str) -> EnqueueRequest {
    EnqueueRequest::new(
        CustomerId::new("cus_1").unwrap(),
        "user@example.com",
        PaymentIntentId::new("pi_1").unwrap(),
        PriceId::new("price_1").unwrap(),
        1,
        Payload::Quantity,
    )
    .with_license_key(key)
}

/// Happy path: enqueue, process, verify, and shrug off a redelivery.
#[tokio::test]
async fn purchase_flows_from_enqueue_to_fulfillment() {
    let w = world();

    let enqueued = w.service.enqueue(request("KEY-AAAA")).await.unwrap();
    assert!(!enqueued.skipped);

    let claimed = w.queue.claim_batch(10, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let outcome = w.processor.process(&claimed[0]).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Completed);

    let row = w.queue.get(enqueued.queue_id).await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Completed);
    let subscription_id = row.subscription_id.clone().unwrap();
    assert!(w.accounts.subscription(&subscription_id).await.unwrap().is_some());
    let license = w
        .accounts
        .license_by_key("KEY-AAAA")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(license.subscription_id, Some(subscription_id));

    // Redelivered event: dedup points at the completed row, nothing re-runs.
    let redelivered = w.service.enqueue(request("KEY-AAAA")).await.unwrap();
    assert!(redelivered.skipped);
    assert_eq!(redelivered.queue_id, enqueued.queue_id);
    assert_eq!(w.payments.create_calls(), 1);
}

/// A job that never succeeds walks through its retries, fails terminally,
/// waits out the grace window, and is refunded exactly once.
#[tokio::test]
async fn exhausted_job_is_refunded_after_grace_window() {
    let w = world();
    w.payments.always_fail_creates();

    let enqueued = w.service.enqueue(request("KEY-BBBB")).await.unwrap();

    for attempt in 1..=3i64 {
        // Backoff is minutes; an hour per attempt clears it comfortably.
        let later = Utc::now() + Duration::hours(attempt);
        let claimed = w.queue.claim_batch(10, later).await.unwrap();
        assert_eq!(claimed.len(), 1);
        w.processor.process(&claimed[0]).await.unwrap();
    }

    let row = w.queue.get(enqueued.queue_id).await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Failed);
    assert_eq!(row.attempts, 3);

    // Inside the grace window: no refund yet.
    let soon = Utc::now() + Duration::hours(1);
    assert_eq!(w.compensator.run_once(soon).await.unwrap(), 0);
    assert_eq!(w.payments.refunds_issued(), 0);

    // Past the window: exactly one refund, and the row is stamped.
    let later = Utc::now() + Duration::hours(13);
    assert_eq!(w.compensator.run_once(later).await.unwrap(), 1);
    assert_eq!(w.payments.refunds_issued(), 1);

    let row = w.queue.get(enqueued.queue_id).await.unwrap().unwrap();
    assert!(row.has_refund_marker());
    let record = w.queue.refund_for(enqueued.queue_id).await.unwrap().unwrap();
    assert_eq!(record.amount, 4900);

    // Further passes never pay again.
    assert_eq!(w.compensator.run_once(later + Duration::hours(1)).await.unwrap(), 0);
    assert_eq!(w.payments.refunds_issued(), 1);
}

/// Two runners racing for the same row: the conditional claim lets exactly
/// one of them own it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_claims_never_share_a_row() {
    let w = world();
    w.service.enqueue(request("KEY-CCCC")).await.unwrap();

    let now = Utc::now();
    let (a, b) = tokio::join!(w.queue.claim_batch(10, now), w.queue.claim_batch(10, now));
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.len() + b.len(), 1);

    let winner = a.into_iter().chain(b).next().unwrap();
    assert_eq!(winner.status, QueueStatus::Processing);
    assert_eq!(winner.attempts, 1);
}

/// A worker that died after writing the account records but before marking
/// the row: the stale claim is reaped and the retry reuses the existing
/// subscription instead of creating a second one.
#[tokio::test]
async fn crashed_worker_retry_reuses_prior_fulfillment() {
    let w = world();
    let enqueued = w.service.enqueue(request("KEY-DDDD")).await.unwrap();

    // First attempt claims the row and writes everything, then "crashes"
    // before mark_completed.
    let start = Utc::now();
    let claimed = w.queue.claim_batch(10, start).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let now = Utc::now();
    w.accounts
        .put_subscription(SubscriptionRecord {
            subscription_id: SubscriptionId::new("sub_prior").unwrap(),
            item_id: SubscriptionItemId::new("si_prior").unwrap(),
            customer_id: CustomerId::new("cus_1").unwrap(),
            user_email: "user@example.com".to_string(),
            price_id: PriceId::new("price_1").unwrap(),
            quantity: 1,
            status: "active".to_string(),
            current_period_start: now,
            current_period_end: now + Duration::days(30),
            created_at: now,
        })
        .await
        .unwrap();
    w.accounts
        .put_license(LicenseRecord {
            license_key: "KEY-DDDD".to_string(),
            customer_id: CustomerId::new("cus_1").unwrap(),
            user_email: "user@example.com".to_string(),
            subscription_id: Some(SubscriptionId::new("sub_prior").unwrap()),
            item_id: Some(SubscriptionItemId::new("si_prior").unwrap()),
            status: "active".to_string(),
            created_at: now,
        })
        .await
        .unwrap();

    // The row sits in processing past the staleness threshold, then a later
    // pass reaps and reclaims it.
    let after_crash = start + Duration::minutes(6);
    let reclaimed = w.queue.claim_batch(10, after_crash).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].attempts, 2);

    let outcome = w.processor.process(&reclaimed[0]).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::CompletedDuplicate);
    assert_eq!(w.payments.create_calls(), 0);

    let row = w.queue.get(enqueued.queue_id).await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Completed);
    assert_eq!(row.subscription_id.unwrap().as_str(), "sub_prior");
}
