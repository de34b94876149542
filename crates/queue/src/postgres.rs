//! Postgres-backed queue store.
//!
//! The conditional claim update is expressed directly in SQL: a row is owned
//! by whoever gets `rows_affected == 1` from
//! `UPDATE ... SET status = 'processing' WHERE queue_id = $1 AND status = 'pending'`.
//! The update is atomic at the storage layer, so a second claimant affects
//! zero rows and discards the candidate. No advisory locks, no
//! `SELECT FOR UPDATE`.
//!
//! ## Error mapping
//!
//! | SQLx error | PostgreSQL code | QueueStoreError | Scenario |
//! |------------|-----------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `AlreadyExists` | duplicate insert slipped past the caller's dedup window |
//! | Database (other) | any other | `Storage` | constraint/connection trouble |
//! | RowNotFound / pool errors | n/a | `Storage` | network failures, closed pool |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use keymint_core::{
    CustomerId, PaymentIntentId, PriceId, QueueId, RefundId, SubscriptionId, SubscriptionItemId,
};

use crate::store::{QueueStore, QueueStoreError};
use crate::types::{
    LicenseKey, Payload, QueueItem, QueueStats, QueueStatus, RefundRecord, STALE_CLAIM_AFTER,
};

/// DDL for the queue tables. Applied by [`PostgresQueueStore::ensure_schema`];
/// kept here so deployments without a migration runner can bootstrap.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS fulfillment_queue (
    queue_id UUID PRIMARY KEY,
    customer_id TEXT NOT NULL,
    user_email TEXT NOT NULL,
    payment_intent_id TEXT NOT NULL,
    price_id TEXT NOT NULL,
    license_key TEXT NOT NULL,
    key_is_final BOOLEAN NOT NULL,
    quantity BIGINT NOT NULL,
    trial_end TIMESTAMPTZ,
    payload JSONB NOT NULL,
    status TEXT NOT NULL,
    attempts BIGINT NOT NULL DEFAULT 0,
    max_attempts BIGINT NOT NULL,
    error_message TEXT,
    next_retry_at TIMESTAMPTZ,
    subscription_id TEXT,
    item_id TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    processed_at TIMESTAMPTZ
);

-- Backstop for the caller-side dedup check: at most one live row per
-- (payment_intent_id, license_key) pair. Failed rows are excluded so a
-- refunded purchase can be re-fulfilled deliberately.
CREATE UNIQUE INDEX IF NOT EXISTS fulfillment_queue_dedup
    ON fulfillment_queue (payment_intent_id, license_key)
    WHERE status <> 'failed';

CREATE INDEX IF NOT EXISTS fulfillment_queue_claim
    ON fulfillment_queue (status, next_retry_at, created_at);

CREATE TABLE IF NOT EXISTS fulfillment_refunds (
    queue_id UUID PRIMARY KEY REFERENCES fulfillment_queue (queue_id),
    refund_id TEXT NOT NULL,
    license_key TEXT NOT NULL,
    amount BIGINT NOT NULL,
    currency TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
"#;

const ITEM_COLUMNS: &str = "queue_id, customer_id, user_email, payment_intent_id, price_id, \
     license_key, key_is_final, quantity, trial_end, payload, status, attempts, max_attempts, \
     error_message, next_retry_at, subscription_id, item_id, created_at, updated_at, processed_at";

/// Durable queue store over PostgreSQL.
///
/// Thread-safe via the SQLx connection pool; every mutation is a single
/// statement so no explicit transactions are needed.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the queue tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), QueueStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Current status of a row, to tell NotFound from InvalidTransition when
    /// a guarded update affected zero rows.
    async fn status_of(&self, queue_id: QueueId) -> Result<Option<QueueStatus>, QueueStoreError> {
        let row = sqlx::query("SELECT status FROM fulfillment_queue WHERE queue_id = $1")
            .bind(queue_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("status_of", e))?;
        row.map(|r| {
            let status: String = r.try_get("status").map_err(decode_error)?;
            status
                .parse::<QueueStatus>()
                .map_err(QueueStoreError::Storage)
        })
        .transpose()
    }

    fn transition_error(
        queue_id: QueueId,
        current: Option<QueueStatus>,
        requested: &'static str,
    ) -> QueueStoreError {
        match current {
            None => QueueStoreError::NotFound(queue_id),
            Some(status) => QueueStoreError::InvalidTransition {
                queue_id,
                current: status.as_str(),
                requested,
            },
        }
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    async fn insert(&self, item: QueueItem) -> Result<QueueId, QueueStoreError> {
        let payload = serde_json::to_value(&item.payload)
            .map_err(|e| QueueStoreError::Storage(format!("payload encode: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO fulfillment_queue (
                queue_id, customer_id, user_email, payment_intent_id, price_id,
                license_key, key_is_final, quantity, trial_end, payload, status,
                attempts, max_attempts, error_message, next_retry_at,
                subscription_id, item_id, created_at, updated_at, processed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(item.queue_id.as_uuid())
        .bind(item.customer_id.as_str())
        .bind(&item.user_email)
        .bind(item.payment_intent_id.as_str())
        .bind(item.price_id.as_str())
        .bind(item.license_key.as_str())
        .bind(item.license_key.is_final())
        .bind(i64::from(item.quantity))
        .bind(item.trial_end)
        .bind(payload)
        .bind(item.status.as_str())
        .bind(i64::from(item.attempts))
        .bind(i64::from(item.max_attempts))
        .bind(&item.error_message)
        .bind(item.next_retry_at)
        .bind(item.subscription_id.as_ref().map(|s| s.as_str()))
        .bind(item.item_id.as_ref().map(|s| s.as_str()))
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(item.processed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_insert_error(item.queue_id, e))?;

        Ok(item.queue_id)
    }

    async fn get(&self, queue_id: QueueId) -> Result<Option<QueueItem>, QueueStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM fulfillment_queue WHERE queue_id = $1"
        ))
        .bind(queue_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| row_to_item(&r)).transpose()
    }

    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        // Phase (a): reap stale claims from crashed/timed-out passes.
        let stale_cutoff = now - STALE_CLAIM_AFTER;
        sqlx::query(
            r#"
            UPDATE fulfillment_queue
            SET status = 'pending', updated_at = $1
            WHERE status = 'processing' AND updated_at < $2
            "#,
        )
        .bind(now)
        .bind(stale_cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch.reap", e))?;

        // Phase (b): candidates in creation order, then the conditional
        // claim per row. Losing the race (zero rows) just skips the row.
        let candidates = sqlx::query(
            r#"
            SELECT queue_id FROM fulfillment_queue
            WHERE status = 'pending'
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch.select", e))?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let queue_id: uuid::Uuid = candidate.try_get("queue_id").map_err(decode_error)?;
            let row = sqlx::query(&format!(
                r#"
                UPDATE fulfillment_queue
                SET status = 'processing', attempts = attempts + 1, updated_at = $2
                WHERE queue_id = $1 AND status = 'pending'
                RETURNING {ITEM_COLUMNS}
                "#
            ))
            .bind(queue_id)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch.claim", e))?;

            if let Some(row) = row {
                claimed.push(row_to_item(&row)?);
            }
        }
        Ok(claimed)
    }

    async fn mark_completed(
        &self,
        queue_id: QueueId,
        subscription_id: SubscriptionId,
        item_id: Option<SubscriptionItemId>,
        final_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE fulfillment_queue
            SET status = 'completed',
                subscription_id = $2,
                item_id = $3,
                license_key = $4,
                key_is_final = TRUE,
                error_message = NULL,
                next_retry_at = NULL,
                processed_at = $5,
                updated_at = $5
            WHERE queue_id = $1 AND status = 'processing'
            "#,
        )
        .bind(queue_id.as_uuid())
        .bind(subscription_id.as_str())
        .bind(item_id.as_ref().map(|s| s.as_str()))
        .bind(final_key)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_completed", e))?;

        if result.rows_affected() == 0 {
            let current = self.status_of(queue_id).await?;
            return Err(Self::transition_error(queue_id, current, "completed"));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        queue_id: QueueId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE fulfillment_queue
            SET status = 'failed', error_message = $2, next_retry_at = NULL, updated_at = $3
            WHERE queue_id = $1 AND status = 'processing'
            "#,
        )
        .bind(queue_id.as_uuid())
        .bind(error)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        if result.rows_affected() == 0 {
            let current = self.status_of(queue_id).await?;
            return Err(Self::transition_error(queue_id, current, "failed"));
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        queue_id: QueueId,
        attempts: u32,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE fulfillment_queue
            SET status = 'pending', attempts = $2, error_message = $3,
                next_retry_at = $4, updated_at = $5
            WHERE queue_id = $1 AND status = 'processing'
            "#,
        )
        .bind(queue_id.as_uuid())
        .bind(i64::from(attempts))
        .bind(error)
        .bind(next_retry_at)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule", e))?;

        if result.rows_affected() == 0 {
            let current = self.status_of(queue_id).await?;
            return Err(Self::transition_error(queue_id, current, "pending"));
        }
        Ok(())
    }

    async fn find_duplicate(
        &self,
        payment_intent_id: &PaymentIntentId,
        license_key: &str,
    ) -> Result<Option<QueueItem>, QueueStoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM fulfillment_queue
            WHERE payment_intent_id = $1
              AND license_key = $2
              AND status IN ('pending', 'processing', 'completed')
            ORDER BY created_at ASC
            LIMIT 1
            "#
        ))
        .bind(payment_intent_id.as_str())
        .bind(license_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_duplicate", e))?;

        row.map(|r| row_to_item(&r)).transpose()
    }

    async fn scan_failed_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM fulfillment_queue
            WHERE status = 'failed'
              AND created_at < $1
              AND strpos(coalesce(error_message, ''), $2) = 0
            ORDER BY created_at ASC
            LIMIT $3
            "#
        ))
        .bind(cutoff)
        .bind(crate::types::REFUND_MARKER)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("scan_failed_older_than", e))?;

        rows.iter().map(row_to_item).collect()
    }

    async fn has_runnable(&self, now: DateTime<Utc>) -> Result<bool, QueueStoreError> {
        let stale_cutoff = now - STALE_CLAIM_AFTER;
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM fulfillment_queue
                WHERE (status = 'pending'
                       AND (next_retry_at IS NULL OR next_retry_at <= $1))
                   OR (status = 'processing' AND updated_at < $2)
            ) AS runnable
            "#,
        )
        .bind(now)
        .bind(stale_cutoff)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_runnable", e))?;
        row.try_get("runnable").map_err(decode_error)
    }

    async fn has_refundable(&self, cutoff: DateTime<Utc>) -> Result<bool, QueueStoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM fulfillment_queue
                WHERE status = 'failed'
                  AND created_at < $1
                  AND strpos(coalesce(error_message, ''), $2) = 0
            ) AS refundable
            "#,
        )
        .bind(cutoff)
        .bind(crate::types::REFUND_MARKER)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_refundable", e))?;
        row.try_get("refundable").map_err(decode_error)
    }

    async fn append_refund_marker(
        &self,
        queue_id: QueueId,
        note: &str,
    ) -> Result<(), QueueStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE fulfillment_queue
            SET error_message = CASE
                    WHEN error_message IS NULL THEN $2
                    ELSE error_message || ' ' || $2
                END,
                updated_at = $3
            WHERE queue_id = $1
            "#,
        )
        .bind(queue_id.as_uuid())
        .bind(note)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_refund_marker", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueStoreError::NotFound(queue_id));
        }
        Ok(())
    }

    async fn insert_refund(&self, record: RefundRecord) -> Result<(), QueueStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO fulfillment_refunds (
                queue_id, refund_id, license_key, amount, currency, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (queue_id) DO NOTHING
            "#,
        )
        .bind(record.queue_id.as_uuid())
        .bind(record.refund_id.as_str())
        .bind(&record.license_key)
        .bind(record.amount)
        .bind(&record.currency)
        .bind(&record.status)
        .bind(record.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_refund", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueStoreError::RefundExists(record.queue_id));
        }
        Ok(())
    }

    async fn refund_for(
        &self,
        queue_id: QueueId,
    ) -> Result<Option<RefundRecord>, QueueStoreError> {
        let row = sqlx::query(
            r#"
            SELECT queue_id, refund_id, license_key, amount, currency, status, created_at
            FROM fulfillment_refunds
            WHERE queue_id = $1
            "#,
        )
        .bind(queue_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("refund_for", e))?;

        row.map(|r| row_to_refund(&r)).transpose()
    }

    async fn stats(&self, customer: Option<&CustomerId>) -> Result<QueueStats, QueueStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM fulfillment_queue
            WHERE $1::text IS NULL OR customer_id = $1
            GROUP BY status
            "#,
        )
        .bind(customer.map(|c| c.as_str()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let count: i64 = row.try_get("count").map_err(decode_error)?;
            let count = usize::try_from(count).unwrap_or(0);
            stats.total += count;
            match status.parse::<QueueStatus>().map_err(QueueStoreError::Storage)? {
                QueueStatus::Pending => stats.pending += count,
                QueueStatus::Processing => stats.processing += count,
                QueueStatus::Completed => stats.completed += count,
                QueueStatus::Failed => stats.failed += count,
            }
        }
        Ok(stats)
    }
}

fn row_to_item(row: &PgRow) -> Result<QueueItem, QueueStoreError> {
    let queue_id: uuid::Uuid = row.try_get("queue_id").map_err(decode_error)?;
    let customer_id: String = row.try_get("customer_id").map_err(decode_error)?;
    let payment_intent_id: String = row.try_get("payment_intent_id").map_err(decode_error)?;
    let price_id: String = row.try_get("price_id").map_err(decode_error)?;
    let license_key: String = row.try_get("license_key").map_err(decode_error)?;
    let key_is_final: bool = row.try_get("key_is_final").map_err(decode_error)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let subscription_id: Option<String> = row.try_get("subscription_id").map_err(decode_error)?;
    let item_id: Option<String> = row.try_get("item_id").map_err(decode_error)?;

    Ok(QueueItem {
        queue_id: QueueId::from_uuid(queue_id),
        customer_id: CustomerId::new(customer_id).map_err(invalid_column)?,
        user_email: row.try_get("user_email").map_err(decode_error)?,
        payment_intent_id: PaymentIntentId::new(payment_intent_id).map_err(invalid_column)?,
        price_id: PriceId::new(price_id).map_err(invalid_column)?,
        license_key: if key_is_final {
            LicenseKey::Final(license_key)
        } else {
            LicenseKey::Provisional(license_key)
        },
        quantity: get_u32(row, "quantity")?,
        trial_end: row.try_get("trial_end").map_err(decode_error)?,
        payload: serde_json::from_value::<Payload>(payload)
            .map_err(|e| QueueStoreError::Storage(format!("payload decode: {e}")))?,
        status: status.parse().map_err(QueueStoreError::Storage)?,
        attempts: get_u32(row, "attempts")?,
        max_attempts: get_u32(row, "max_attempts")?,
        error_message: row.try_get("error_message").map_err(decode_error)?,
        next_retry_at: row.try_get("next_retry_at").map_err(decode_error)?,
        subscription_id: subscription_id
            .map(SubscriptionId::new)
            .transpose()
            .map_err(invalid_column)?,
        item_id: item_id
            .map(SubscriptionItemId::new)
            .transpose()
            .map_err(invalid_column)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
        processed_at: row.try_get("processed_at").map_err(decode_error)?,
    })
}

fn row_to_refund(row: &PgRow) -> Result<RefundRecord, QueueStoreError> {
    let queue_id: uuid::Uuid = row.try_get("queue_id").map_err(decode_error)?;
    let refund_id: String = row.try_get("refund_id").map_err(decode_error)?;
    Ok(RefundRecord {
        refund_id: RefundId::new(refund_id).map_err(invalid_column)?,
        queue_id: QueueId::from_uuid(queue_id),
        license_key: row.try_get("license_key").map_err(decode_error)?,
        amount: row.try_get("amount").map_err(decode_error)?,
        currency: row.try_get("currency").map_err(decode_error)?,
        status: row.try_get("status").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn get_u32(row: &PgRow, column: &str) -> Result<u32, QueueStoreError> {
    let value: i64 = row.try_get(column).map_err(decode_error)?;
    u32::try_from(value)
        .map_err(|_| QueueStoreError::Storage(format!("column {column} out of range: {value}")))
}

fn decode_error(e: sqlx::Error) -> QueueStoreError {
    QueueStoreError::Storage(format!("row decode: {e}"))
}

fn invalid_column(e: keymint_core::DomainError) -> QueueStoreError {
    QueueStoreError::Storage(format!("invalid stored identifier: {e}"))
}

fn map_insert_error(queue_id: QueueId, e: sqlx::Error) -> QueueStoreError {
    if let sqlx::Error::Database(db) = &e {
        // 23505: unique violation (primary key or the dedup backstop index).
        if db.code().as_deref() == Some("23505") {
            return QueueStoreError::AlreadyExists(queue_id);
        }
    }
    map_sqlx_error("insert", e)
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> QueueStoreError {
    QueueStoreError::Storage(format!("{operation}: {e}"))
}
