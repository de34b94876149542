//! Account/billing store seam.
//!
//! Subscription and License rows are the durable outputs of fulfillment; the
//! queue writes them and then re-reads them to confirm the write. Payment
//! records are best-effort audit entries.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use keymint_core::{CustomerId, PaymentIntentId, PriceId, SubscriptionId, SubscriptionItemId};

/// Account-store error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccountStoreError {
    #[error("license key already exists: {0}")]
    DuplicateLicenseKey(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// A durable subscription row owned by the account store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub subscription_id: SubscriptionId,
    pub item_id: SubscriptionItemId,
    pub customer_id: CustomerId,
    pub user_email: String,
    pub price_id: PriceId,
    pub quantity: u32,
    pub status: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A durable license row linking a key to its subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub license_key: String,
    pub customer_id: CustomerId,
    pub user_email: String,
    /// Set once fulfillment created (or found) the backing subscription.
    pub subscription_id: Option<SubscriptionId>,
    pub item_id: Option<SubscriptionItemId>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Best-effort payment/audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_intent_id: PaymentIntentId,
    pub customer_id: CustomerId,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Read/write seam to the account/billing store.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Upsert a subscription row.
    async fn put_subscription(&self, rec: SubscriptionRecord) -> Result<(), AccountStoreError>;

    /// Upsert a license row keyed by `license_key`.
    async fn put_license(&self, rec: LicenseRecord) -> Result<(), AccountStoreError>;

    /// Fetch a subscription row (used for read-after-write verification).
    async fn subscription(
        &self,
        id: &SubscriptionId,
    ) -> Result<Option<SubscriptionRecord>, AccountStoreError>;

    /// Fetch the license row for a key, if any.
    async fn license_by_key(&self, key: &str) -> Result<Option<LicenseRecord>, AccountStoreError>;

    /// Whether any license row carries this key (final-key uniqueness check).
    async fn license_key_exists(&self, key: &str) -> Result<bool, AccountStoreError> {
        Ok(self.license_by_key(key).await?.is_some())
    }

    /// Append a best-effort audit record. Failures here never fail a job.
    async fn record_payment(&self, rec: PaymentRecord) -> Result<(), AccountStoreError>;
}

/// In-memory account store for tests/dev.
///
/// `fail_writes` simulates the account store going down after the external
/// create succeeded (the local-persistence-failure retry path).
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    subscriptions: RwLock<HashMap<String, SubscriptionRecord>>,
    licenses: RwLock<HashMap<String, LicenseRecord>>,
    payments: RwLock<Vec<PaymentRecord>>,
    fail_writes: AtomicBool,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn payments_recorded(&self) -> usize {
        self.payments.read().unwrap().len()
    }

    pub fn licenses_stored(&self) -> usize {
        self.licenses.read().unwrap().len()
    }

    pub fn subscriptions_stored(&self) -> usize {
        self.subscriptions.read().unwrap().len()
    }

    fn check_writable(&self) -> Result<(), AccountStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AccountStoreError::Storage(
                "account store unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn lock_err<T>(_: std::sync::PoisonError<T>) -> AccountStoreError {
        AccountStoreError::Storage("account store lock poisoned".to_string())
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn put_subscription(&self, rec: SubscriptionRecord) -> Result<(), AccountStoreError> {
        self.check_writable()?;
        self.subscriptions
            .write()
            .map_err(Self::lock_err)?
            .insert(rec.subscription_id.as_str().to_string(), rec);
        Ok(())
    }

    async fn put_license(&self, rec: LicenseRecord) -> Result<(), AccountStoreError> {
        self.check_writable()?;
        self.licenses
            .write()
            .map_err(Self::lock_err)?
            .insert(rec.license_key.clone(), rec);
        Ok(())
    }

    async fn subscription(
        &self,
        id: &SubscriptionId,
    ) -> Result<Option<SubscriptionRecord>, AccountStoreError> {
        Ok(self
            .subscriptions
            .read()
            .map_err(Self::lock_err)?
            .get(id.as_str())
            .cloned())
    }

    async fn license_by_key(&self, key: &str) -> Result<Option<LicenseRecord>, AccountStoreError> {
        Ok(self.licenses.read().map_err(Self::lock_err)?.get(key).cloned())
    }

    async fn record_payment(&self, rec: PaymentRecord) -> Result<(), AccountStoreError> {
        self.check_writable()?;
        self.payments.write().map_err(Self::lock_err)?.push(rec);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn license(key: &str, sub: Option<&str>) -> LicenseRecord {
        LicenseRecord {
            license_key: key.to_string(),
            customer_id: CustomerId::new("cus_1").unwrap(),
            user_email: "user@example.com".to_string(),
            subscription_id: sub.map(|s| SubscriptionId::new(s).unwrap()),
            item_id: None,
            status: "active".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn license_round_trip() {
        let store = InMemoryAccountStore::new();
        store.put_license(license("KEY-1", Some("sub_1"))).await.unwrap();

        let found = store.license_by_key("KEY-1").await.unwrap().unwrap();
        assert_eq!(found.subscription_id.unwrap().as_str(), "sub_1");
        assert!(store.license_key_exists("KEY-1").await.unwrap());
        assert!(!store.license_key_exists("KEY-2").await.unwrap());
    }

    #[tokio::test]
    async fn fail_writes_rejects_all_mutations() {
        let store = InMemoryAccountStore::new();
        store.set_fail_writes(true);

        assert!(store.put_license(license("KEY-1", None)).await.is_err());
        assert_eq!(store.licenses_stored(), 0);

        store.set_fail_writes(false);
        assert!(store.put_license(license("KEY-1", None)).await.is_ok());
    }
}
