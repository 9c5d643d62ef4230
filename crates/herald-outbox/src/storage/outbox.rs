//! Repository for outbox entry operations.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers never hand
//! out the same row twice, and attempt counters are incremented in the
//! UPDATE itself rather than read-modify-write from application code.
//! Finalizing updates carry a claim-token guard: a row reclaimed by another
//! worker after the TTL expired cannot be clobbered by the original, slower
//! worker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use herald_core::{
    error::Result,
    models::{EventId, OutboxEntry, OutboxStatus},
};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const ENTRY_COLUMNS: &str = "id, event_id, status, attempts, last_error, available_at, \
                             claim_token, claimed_at, updated_at";

/// Repository for outbox entry persistence.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a pending outbox row within the publishing transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO outbox (event_id, status, attempts, available_at, updated_at)
            VALUES ($1, 'pending', 0, $2, $2)
            RETURNING id
            ",
        )
        .bind(event_id)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;

        Ok(id)
    }

    /// Claims up to `batch_size` eligible entries for processing.
    ///
    /// Eligible rows are `pending` or `failed` entries whose backoff gate
    /// has passed, plus `claimed` entries whose claim is older than the TTL
    /// (abandoned by a crashed worker). Rows locked by a concurrent claim
    /// are skipped, not waited on. The selected rows move to `claimed` with
    /// a fresh token and an atomic attempt increment.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_batch(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
        reclaim_before: DateTime<Utc>,
        claim_token: Uuid,
    ) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r"
            SELECT id FROM outbox
            WHERE (status IN ('pending', 'failed') AND available_at <= $1)
               OR (status = 'claimed' AND claimed_at <= $2)
            ORDER BY available_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(reclaim_before)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let claimed: Vec<i64> = sqlx::query_scalar(
            r"
            UPDATE outbox
            SET status = 'claimed',
                claimed_at = $1,
                claim_token = $2,
                attempts = attempts + 1,
                updated_at = $1
            WHERE id = ANY($3)
            RETURNING id
            ",
        )
        .bind(now)
        .bind(claim_token)
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(claimed)
    }

    /// Loads an outbox entry by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, id: i64) -> Result<Option<OutboxEntry>> {
        let entry = sqlx::query_as::<_, OutboxEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Finalizes an entry as processed, clearing error and claim state.
    ///
    /// Guarded by the claim token read when the entry was loaded; returns
    /// false when the row was reclaimed in the meantime and the transition
    /// was not applied.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_processed(
        &self,
        id: i64,
        claim_token: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET status = 'processed',
                last_error = NULL,
                claim_token = NULL,
                claimed_at = NULL,
                updated_at = $2
            WHERE id = $1 AND claim_token IS NOT DISTINCT FROM $3
            ",
        )
        .bind(id)
        .bind(now)
        .bind(claim_token)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records a retryable failure, gating the next attempt on `available_at`.
    ///
    /// Token-guarded like [`Repository::mark_processed`].
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(
        &self,
        id: i64,
        attempts: i32,
        last_error: &str,
        available_at: DateTime<Utc>,
        claim_token: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET status = 'failed',
                attempts = $2,
                last_error = $3,
                available_at = $4,
                claim_token = NULL,
                claimed_at = NULL,
                updated_at = $5
            WHERE id = $1 AND claim_token IS NOT DISTINCT FROM $6
            ",
        )
        .bind(id)
        .bind(attempts)
        .bind(last_error)
        .bind(available_at)
        .bind(now)
        .bind(claim_token)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Moves an entry to the terminal `dead_letter` state.
    ///
    /// Token-guarded like [`Repository::mark_processed`].
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_dead_letter(
        &self,
        id: i64,
        attempts: i32,
        last_error: &str,
        claim_token: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET status = 'dead_letter',
                attempts = $2,
                last_error = $3,
                claim_token = NULL,
                claimed_at = NULL,
                updated_at = $4
            WHERE id = $1 AND claim_token IS NOT DISTINCT FROM $5
            ",
        )
        .bind(id)
        .bind(attempts)
        .bind(last_error)
        .bind(now)
        .bind(claim_token)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns a `failed` or `dead_letter` entry to `pending` for replay.
    ///
    /// Manual recovery path: attempts and error state are reset so the
    /// entry is claimed like fresh work.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reset_for_retry(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET status = 'pending',
                attempts = 0,
                last_error = NULL,
                available_at = $2,
                claim_token = NULL,
                claimed_at = NULL,
                updated_at = $2
            WHERE id = $1 AND status IN ('failed', 'dead_letter')
            ",
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Finds all outbox entries for an event.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_event(&self, event_id: &EventId) -> Result<Vec<OutboxEntry>> {
        let entries = sqlx::query_as::<_, OutboxEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox WHERE event_id = $1 ORDER BY id ASC"
        ))
        .bind(event_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
    }

    /// Counts entries in the given status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self, status: OutboxStatus) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE status = $1")
            .bind(status)
            .fetch_one(&*self.pool)
            .await?;

        Ok(count.0)
    }

    /// Finds entries in the given status for inspection, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_status(
        &self,
        status: OutboxStatus,
        limit: Option<i64>,
    ) -> Result<Vec<OutboxEntry>> {
        let entries = sqlx::query_as::<_, OutboxEntry>(&format!(
            r"
            SELECT {ENTRY_COLUMNS} FROM outbox
            WHERE status = $1
            ORDER BY available_at ASC
            LIMIT $2
            "
        ))
        .bind(status)
        .bind(limit.unwrap_or(100))
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
    }
}
