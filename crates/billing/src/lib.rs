//! `keymint-billing` — seams to the external payment provider and the
//! account/billing store.
//!
//! The fulfillment queue only ever talks to these traits. The in-memory
//! implementations here exist for tests/dev; production wires real adapters.

pub mod accounts;
pub mod payment;

pub use accounts::{
    AccountStore, AccountStoreError, InMemoryAccountStore, LicenseRecord, PaymentRecord,
    SubscriptionRecord,
};
pub use payment::{
    CreateRefundRequest, CreateSubscriptionRequest, FakePaymentApi, PaymentApi, PaymentApiError,
    PaymentIntent, PaymentSubscription, Price, Refund,
};
