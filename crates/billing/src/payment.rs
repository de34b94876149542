//! Payment-provider API seam.
//!
//! The provider owns subscriptions, payment intents, prices and refunds. All
//! calls can fail transiently (timeout, 5xx, rate limit) or permanently
//! (validation-type 4xx); callers retry both identically up to their attempt
//! budget and rely on the provider's own idempotency for blind retries.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use keymint_core::{ChargeId, CustomerId, PaymentIntentId, PriceId, RefundId, SubscriptionId, SubscriptionItemId};

/// Error from the payment provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaymentApiError {
    /// Request timed out before the provider answered.
    #[error("payment api timeout: {0}")]
    Timeout(String),

    /// Provider-side failure (5xx).
    #[error("payment api unavailable: {0}")]
    Unavailable(String),

    /// Provider asked us to slow down (429).
    #[error("payment api rate limited")]
    RateLimited,

    /// The provider rejected the request (4xx validation-type error).
    #[error("payment api rejected request: {0}")]
    Rejected(String),

    /// The referenced object does not exist at the provider.
    #[error("payment api object not found: {0}")]
    NotFound(String),
}

impl PaymentApiError {
    /// Whether the failure is worth retrying on its own merits.
    ///
    /// The queue currently retries transient and permanent failures the same
    /// way (max_attempts is the universal backstop); this classification is
    /// kept so a fail-fast policy stays a local change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PaymentApiError::Timeout(_)
                | PaymentApiError::Unavailable(_)
                | PaymentApiError::RateLimited
        )
    }
}

/// Request to create a subscription for a customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub customer_id: CustomerId,
    pub price_id: PriceId,
    pub quantity: u32,
    pub trial_end: Option<DateTime<Utc>>,
    /// Free-form metadata forwarded to the provider (license key, queue id).
    pub metadata: BTreeMap<String, String>,
}

/// A subscription as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSubscription {
    pub id: SubscriptionId,
    pub item_id: SubscriptionItemId,
    pub status: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
}

/// A payment intent (the event that funded a fulfillment job).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: PaymentIntentId,
    /// The charge backing this intent; refunds are issued against it.
    pub charge_id: Option<ChargeId>,
    /// Total amount in minor currency units.
    pub amount: i64,
    pub currency: String,
}

/// A price object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub id: PriceId,
    /// Per-unit amount in minor currency units, if the price carries one.
    pub unit_amount: Option<i64>,
    pub currency: String,
}

/// Request to refund part of a charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRefundRequest {
    pub charge_id: ChargeId,
    /// Amount in minor currency units.
    pub amount: i64,
    pub metadata: BTreeMap<String, String>,
}

/// A refund as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub id: RefundId,
    pub status: String,
}

/// Client seam to the external payment provider.
#[async_trait]
pub trait PaymentApi: Send + Sync {
    async fn create_subscription(
        &self,
        req: CreateSubscriptionRequest,
    ) -> Result<PaymentSubscription, PaymentApiError>;

    async fn fetch_payment_intent(
        &self,
        id: &PaymentIntentId,
    ) -> Result<PaymentIntent, PaymentApiError>;

    async fn fetch_price(&self, id: &PriceId) -> Result<Price, PaymentApiError>;

    async fn create_refund(&self, req: CreateRefundRequest) -> Result<Refund, PaymentApiError>;
}

/// Scripted failure behavior for [`FakePaymentApi`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureScript {
    None,
    /// Fail the next N subscription creates, then succeed.
    FailNextCreates(u32),
    /// Every subscription create fails.
    AlwaysFailCreates,
    /// Every refund fails.
    AlwaysFailRefunds,
}

#[derive(Debug, Default)]
struct FakeState {
    payment_intents: HashMap<String, PaymentIntent>,
    prices: HashMap<String, Price>,
    subscriptions: Vec<PaymentSubscription>,
    refunds: Vec<Refund>,
    create_calls: u32,
    refund_calls: u32,
}

/// In-memory payment provider for tests/dev.
///
/// Supports scripting failures so crash/retry/refund paths can be exercised
/// without a network.
#[derive(Debug)]
pub struct FakePaymentApi {
    state: Mutex<FakeState>,
    script: Mutex<FailureScript>,
}

impl FakePaymentApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            script: Mutex::new(FailureScript::None),
        }
    }

    /// Register a payment intent the fake will serve.
    pub fn with_payment_intent(self, intent: PaymentIntent) -> Self {
        self.state
            .lock()
            .unwrap()
            .payment_intents
            .insert(intent.id.as_str().to_string(), intent);
        self
    }

    /// Register a price the fake will serve.
    pub fn with_price(self, price: Price) -> Self {
        self.state
            .lock()
            .unwrap()
            .prices
            .insert(price.id.as_str().to_string(), price);
        self
    }

    /// Fail the next `n` subscription creates with a transient error.
    pub fn fail_next_creates(&self, n: u32) {
        *self.script.lock().unwrap() = FailureScript::FailNextCreates(n);
    }

    /// Fail every subscription create.
    pub fn always_fail_creates(&self) {
        *self.script.lock().unwrap() = FailureScript::AlwaysFailCreates;
    }

    /// Fail every refund.
    pub fn always_fail_refunds(&self) {
        *self.script.lock().unwrap() = FailureScript::AlwaysFailRefunds;
    }

    /// Clear any failure script.
    pub fn heal(&self) {
        *self.script.lock().unwrap() = FailureScript::None;
    }

    /// Number of subscription-create calls observed (including failed ones).
    pub fn create_calls(&self) -> u32 {
        self.state.lock().unwrap().create_calls
    }

    /// Number of successful refunds issued.
    pub fn refunds_issued(&self) -> usize {
        self.state.lock().unwrap().refunds.len()
    }

    /// Subscriptions successfully created so far.
    pub fn subscriptions_created(&self) -> Vec<PaymentSubscription> {
        self.state.lock().unwrap().subscriptions.clone()
    }
}

impl Default for FakePaymentApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentApi for FakePaymentApi {
    async fn create_subscription(
        &self,
        req: CreateSubscriptionRequest,
    ) -> Result<PaymentSubscription, PaymentApiError> {
        {
            let mut state = self.state.lock().unwrap();
            state.create_calls += 1;
        }

        let mut script = self.script.lock().unwrap();
        match *script {
            FailureScript::FailNextCreates(0) => {
                *script = FailureScript::None;
            }
            FailureScript::FailNextCreates(n) => {
                *script = FailureScript::FailNextCreates(n - 1);
                return Err(PaymentApiError::Unavailable(
                    "scripted create failure".to_string(),
                ));
            }
            FailureScript::AlwaysFailCreates => {
                return Err(PaymentApiError::Unavailable(
                    "scripted create failure".to_string(),
                ));
            }
            FailureScript::None | FailureScript::AlwaysFailRefunds => {}
        }
        drop(script);

        let now = Utc::now();
        let period_start = req.trial_end.unwrap_or(now);
        let sub = PaymentSubscription {
            id: SubscriptionId::new(format!("sub_{}", Uuid::now_v7().simple()))
                .map_err(|e| PaymentApiError::Rejected(e.to_string()))?,
            item_id: SubscriptionItemId::new(format!("si_{}", Uuid::now_v7().simple()))
                .map_err(|e| PaymentApiError::Rejected(e.to_string()))?,
            status: if req.trial_end.is_some() {
                "trialing".to_string()
            } else {
                "active".to_string()
            },
            current_period_start: period_start,
            current_period_end: period_start + Duration::days(30),
        };

        self.state.lock().unwrap().subscriptions.push(sub.clone());
        Ok(sub)
    }

    async fn fetch_payment_intent(
        &self,
        id: &PaymentIntentId,
    ) -> Result<PaymentIntent, PaymentApiError> {
        self.state
            .lock()
            .unwrap()
            .payment_intents
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| PaymentApiError::NotFound(id.to_string()))
    }

    async fn fetch_price(&self, id: &PriceId) -> Result<Price, PaymentApiError> {
        self.state
            .lock()
            .unwrap()
            .prices
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| PaymentApiError::NotFound(id.to_string()))
    }

    async fn create_refund(&self, req: CreateRefundRequest) -> Result<Refund, PaymentApiError> {
        {
            let mut state = self.state.lock().unwrap();
            state.refund_calls += 1;
        }

        if *self.script.lock().unwrap() == FailureScript::AlwaysFailRefunds {
            return Err(PaymentApiError::Unavailable(
                "scripted refund failure".to_string(),
            ));
        }

        if req.amount <= 0 {
            return Err(PaymentApiError::Rejected(format!(
                "refund amount must be positive, got {}",
                req.amount
            )));
        }

        let refund = Refund {
            id: RefundId::new(format!("re_{}", Uuid::now_v7().simple()))
                .map_err(|e| PaymentApiError::Rejected(e.to_string()))?,
            status: "succeeded".to_string(),
        };
        self.state.lock().unwrap().refunds.push(refund.clone());
        Ok(refund)
    }
}
