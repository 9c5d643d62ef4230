//! Shared setup for outbox integration tests.
//!
//! Tests run against a real PostgreSQL instance named by
//! `HERALD_TEST_DATABASE_URL` (falling back to `DATABASE_URL`) and skip
//! cleanly when neither is set. Each call creates a dedicated schema and
//! pins the pool's `search_path` to it, so concurrently running tests never
//! claim each other's outbox entries.

use sqlx::{postgres::PgPoolOptions, Executor, PgPool};

/// Connects to the test database, creates an isolated schema, and ensures
/// the outbox tables exist in it.
///
/// Returns `None` (test skipped) when no test database is configured or
/// reachable.
pub async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("HERALD_TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()?;

    let schema = format!("herald_test_{}", uuid::Uuid::new_v4().simple());

    let admin = match PgPool::connect(&url).await {
        Ok(pool) => pool,
        Err(connect_error) => {
            eprintln!("skipping: test database unreachable: {connect_error}");
            return None;
        },
    };
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&admin)
        .await
        .expect("schema creation should succeed");
    admin.close().await;

    let pool = PgPoolOptions::new()
        .after_connect(move |conn, _meta| {
            let statement = format!("SET search_path TO {schema}");
            Box::pin(async move {
                conn.execute(statement.as_str()).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .expect("pool connection should succeed");

    herald_outbox::storage::run_migrations(&pool).await.expect("migrations should succeed");
    Some(pool)
}

/// Generates a collision-free identifier with a readable prefix.
pub fn unique_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}
