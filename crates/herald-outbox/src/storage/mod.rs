//! Database access layer implementing the repository pattern for the
//! transactional outbox.
//!
//! Repositories translate between domain models and the relational schema.
//! All SQL lives here; the registry and worker layers never issue queries
//! directly.

use std::sync::Arc;

use herald_core::error::Result;
use sqlx::PgPool;

pub mod delivery_attempts;
pub mod events;
pub mod outbox;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for event rows.
    pub events: Arc<events::Repository>,

    /// Repository for outbox entries.
    pub outbox: Arc<outbox::Repository>,

    /// Repository for per-handler delivery attempts.
    pub delivery_attempts: Arc<delivery_attempts::Repository>,
}

impl Storage {
    /// Creates a storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            events: Arc::new(events::Repository::new(pool.clone())),
            outbox: Arc::new(outbox::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool)),
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.events.pool()
    }

    /// Verifies database connectivity with a trivial query.
    ///
    /// # Errors
    ///
    /// Returns a database error when the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool()).await?;
        Ok(())
    }
}

/// Creates the outbox schema if it does not exist.
///
/// Idempotent; safe to run at every startup and from test setup.
///
/// # Errors
///
/// Returns a database error when DDL execution fails.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS events (
            event_id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            event_name TEXT,
            source TEXT,
            occurred_at TIMESTAMPTZ NOT NULL,
            payload JSONB NOT NULL,
            metadata JSONB NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS outbox (
            id BIGSERIAL PRIMARY KEY,
            event_id TEXT NOT NULL REFERENCES events(event_id),
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            available_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            claim_token UUID,
            claimed_at TIMESTAMPTZ,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS delivery_attempts (
            idempotency_key TEXT PRIMARY KEY,
            event_id TEXT NOT NULL REFERENCES events(event_id),
            handler_registration_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_traceback TEXT,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_outbox_claimable
        ON outbox(status, available_at)
        WHERE status IN ('pending', 'failed', 'claimed')
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_delivery_attempts_event
        ON delivery_attempts(event_id)
        ",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        // Lazy pools defer connection; real database coverage lives in the
        // integration tests.
        let pool = PgPool::connect_lazy("postgresql://localhost/herald").unwrap();
        let _storage = Storage::new(pool);
    }
}
