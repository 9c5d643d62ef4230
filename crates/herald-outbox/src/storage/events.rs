//! Repository for event row operations.
//!
//! Event rows are immutable once written; the unique primary key on
//! `event_id` is the global deduplication guard for `publish`.

use std::sync::Arc;

use herald_core::{
    error::Result,
    models::{EventId, JsonMap, WorkflowEvent},
};
use sqlx::{PgPool, Postgres, Row, Transaction};

/// Repository for event persistence.
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

    /// Inserts an event row within the publishing transaction.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateEvent` when the event id already exists, or a
    /// database error for other failures.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &WorkflowEvent,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO events (
                event_id, event_type, event_name, source, occurred_at, payload, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.event_name)
        .bind(&event.source)
        .bind(event.occurred_at)
        .bind(sqlx::types::Json(&event.payload))
        .bind(sqlx::types::Json(&event.metadata))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Loads an event and reconstructs the domain value.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, event_id: &EventId) -> Result<Option<WorkflowEvent>> {
        let row = sqlx::query(
            r"
            SELECT event_id, event_type, event_name, source, occurred_at, payload, metadata
            FROM events
            WHERE event_id = $1
            ",
        )
        .bind(event_id)
        .fetch_optional(&*self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: sqlx::types::Json<JsonMap> = row.try_get("payload")?;
        let metadata: sqlx::types::Json<JsonMap> = row.try_get("metadata")?;

        Ok(Some(WorkflowEvent {
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            event_name: row.try_get("event_name")?,
            payload: payload.0,
            source: row.try_get("source")?,
            occurred_at: row.try_get("occurred_at")?,
            metadata: metadata.0,
        }))
    }

    /// Counts all persisted events with the given id (0 or 1).
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_id(&self, event_id: &EventId) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events WHERE event_id = $1")
            .bind(event_id)
            .fetch_one(&*self.pool)
            .await?;

        Ok(count.0)
    }
}
