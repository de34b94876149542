//! License key generation.
//!
//! Enqueue hands out cheap provisional placeholders (`L1`, `L2`, …, see
//! [`LicenseKey::provisional`]); the real key is minted here during
//! processing, uniqueness-checked against the account store with a bounded
//! collision budget.

use uuid::Uuid;

use keymint_billing::AccountStore;

use crate::error::QueueError;
use crate::types::LicenseKey;

/// Generates collision-checked final license keys.
#[derive(Debug, Clone, Copy)]
pub struct KeyGenerator {
    /// How many candidate keys to try before giving up.
    pub max_collision_retries: u32,
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self {
            max_collision_retries: 5,
        }
    }
}

impl KeyGenerator {
    /// Mint a key that no existing license carries.
    ///
    /// The uniqueness check is store-backed, not cached: a process-local
    /// "already seen" set would not survive restarts or multiple instances.
    pub async fn generate_unique(
        &self,
        accounts: &dyn AccountStore,
    ) -> Result<LicenseKey, QueueError> {
        for _ in 0..self.max_collision_retries {
            let candidate = Self::candidate();
            if !accounts.license_key_exists(&candidate).await? {
                return Ok(LicenseKey::Final(candidate));
            }
        }
        Err(QueueError::KeyGenerationExhausted(
            self.max_collision_retries,
        ))
    }

    /// `KEY-XXXX-XXXX-XXXX-XXXX` from the random tail of a UUIDv7.
    fn candidate() -> String {
        let hex = Uuid::now_v7().simple().to_string().to_uppercase();
        let tail = &hex[hex.len() - 16..];
        format!(
            "KEY-{}-{}-{}-{}",
            &tail[0..4],
            &tail[4..8],
            &tail[8..12],
            &tail[12..16]
        )
    }
}
