//! Queue-layer error type.

use thiserror::Error;

use keymint_billing::{AccountStoreError, PaymentApiError};
use keymint_core::DomainError;

use crate::store::QueueStoreError;

/// Error surfaced by queue operations.
///
/// Per-job processing failures never cross the runner boundary as errors;
/// they become row-state transitions. What does propagate is store-level
/// trouble (the queue itself unreachable) and enqueue-time validation.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] QueueStoreError),

    #[error(transparent)]
    Accounts(#[from] AccountStoreError),

    #[error(transparent)]
    Payment(#[from] PaymentApiError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Final-key generation kept colliding with existing licenses.
    #[error("license key generation exhausted after {0} attempts")]
    KeyGenerationExhausted(u32),
}
