//! Asynchronous fulfillment queue.
//!
//! Payment events are acknowledged immediately and the actual work — license
//! key issuance, subscription creation, account writes — happens later, in
//! periodic batch passes over a persisted queue. The moving parts:
//!
//! - [`FulfillmentQueue`]: enqueue surface with enqueue-time dedup.
//! - [`QueueStore`]: persistence seam; [`InMemoryQueueStore`] for tests and
//!   dev, [`PostgresQueueStore`] for production.
//! - [`JobProcessor`]: processes one claimed job end to end.
//! - [`Runner`]: claims batches, drives the processor and the compensator.
//! - [`Compensator`]: refunds purchases whose fulfillment never converged.
//!
//! Concurrency control is a single conditional update: a row moves from
//! `pending` to `processing` only if it is still `pending` at that instant,
//! so overlapping runners cannot both own it. Everything else (dedup layers,
//! refund markers) exists to keep retries and redeliveries idempotent.

pub mod compensator;
pub mod dedup;
pub mod error;
pub mod keys;
pub mod postgres;
pub mod processor;
pub mod runner;
pub mod service;
pub mod store;
pub mod types;

pub use compensator::{Compensator, CompensatorConfig};
pub use dedup::{Deduplicator, ExistingFulfillment};
pub use error::QueueError;
pub use keys::KeyGenerator;
pub use postgres::PostgresQueueStore;
pub use processor::{JobProcessor, ProcessOutcome};
pub use runner::{PassSummary, Runner, RunnerConfig, RunnerHandle};
pub use service::FulfillmentQueue;
pub use store::{InMemoryQueueStore, QueueStore, QueueStoreError};
pub use types::{
    EnqueueRequest, EnqueueResult, LicenseKey, Payload, QueueItem, QueueStats, QueueStatus,
    RefundRecord, RetryPolicy, REFUND_GRACE_WINDOW, REFUND_MARKER, STALE_CLAIM_AFTER,
};

#[cfg(test)]
mod integration_tests;
