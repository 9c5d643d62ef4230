//! Repository for per-handler delivery attempt operations.
//!
//! One row per (event, registration) pair, keyed by the idempotency key.
//! The `completed` status is what makes handler side effects at-most-once:
//! routing checks it before every invocation, across outbox retries and
//! stale-claim reclaims.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use herald_core::{
    error::Result,
    models::{AttemptStatus, DeliveryAttempt, EventId},
};
use sqlx::PgPool;

const ATTEMPT_COLUMNS: &str = "idempotency_key, event_id, handler_registration_id, status, \
                               attempts, last_error, last_traceback, updated_at";

/// Repository for delivery attempt persistence.
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

    /// Fetches the attempt row for the key, creating a pending row if none
    /// exists.
    ///
    /// Concurrent callers race on the insert; `ON CONFLICT DO NOTHING` plus
    /// the follow-up select make the operation idempotent.
    ///
    /// # Errors
    ///
    /// Returns error if either statement fails.
    pub async fn get_or_create(
        &self,
        idempotency_key: &str,
        event_id: &EventId,
        handler_registration_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAttempt> {
        sqlx::query(
            r"
            INSERT INTO delivery_attempts (
                idempotency_key, event_id, handler_registration_id,
                status, attempts, updated_at
            ) VALUES ($1, $2, $3, 'pending', 0, $4)
            ON CONFLICT (idempotency_key) DO NOTHING
            ",
        )
        .bind(idempotency_key)
        .bind(event_id)
        .bind(handler_registration_id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        let attempt = sqlx::query_as::<_, DeliveryAttempt>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts WHERE idempotency_key = $1"
        ))
        .bind(idempotency_key)
        .fetch_one(&*self.pool)
        .await?;

        Ok(attempt)
    }

    /// Marks the attempt running and bumps its counter database-side.
    ///
    /// Returns the attempt number this invocation represents (1-based).
    ///
    /// # Errors
    ///
    /// Returns error if the update fails or the row is missing.
    pub async fn mark_running(&self, idempotency_key: &str, now: DateTime<Utc>) -> Result<i32> {
        let attempts = sqlx::query_scalar(
            r"
            UPDATE delivery_attempts
            SET status = 'running', attempts = attempts + 1, updated_at = $2
            WHERE idempotency_key = $1
            RETURNING attempts
            ",
        )
        .bind(idempotency_key)
        .bind(now)
        .fetch_one(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Marks the attempt completed and clears error state.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_completed(&self, idempotency_key: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r"
            UPDATE delivery_attempts
            SET status = 'completed', last_error = NULL, last_traceback = NULL, updated_at = $2
            WHERE idempotency_key = $1
            ",
        )
        .bind(idempotency_key)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Records a failure with the error message and full chain.
    ///
    /// `status` is `failed` for retryable outcomes or `dead_letter` once the
    /// registration's retry budget is spent.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(
        &self,
        idempotency_key: &str,
        status: AttemptStatus,
        last_error: &str,
        last_traceback: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE delivery_attempts
            SET status = $2, last_error = $3, last_traceback = $4, updated_at = $5
            WHERE idempotency_key = $1
            ",
        )
        .bind(idempotency_key)
        .bind(status)
        .bind(last_error)
        .bind(last_traceback)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Loads the attempt row for a key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, idempotency_key: &str) -> Result<Option<DeliveryAttempt>> {
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts WHERE idempotency_key = $1"
        ))
        .bind(idempotency_key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(attempt)
    }

    /// Finds all attempts recorded for an event.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_event(&self, event_id: &EventId) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(&format!(
            r"
            SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
            WHERE event_id = $1
            ORDER BY idempotency_key ASC
            "
        ))
        .bind(event_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }
}
