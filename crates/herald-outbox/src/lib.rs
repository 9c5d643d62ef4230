//! Database-backed transactional outbox registry for Herald.
//!
//! This crate implements the production registry: events and their outbox
//! rows are persisted in one transaction, then delivered to registered
//! handlers by workers that claim work with `FOR UPDATE SKIP LOCKED` and
//! record per-handler idempotent delivery attempts.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   publish    ┌────────────────┐   claim/process   ┌─────────────┐
//! │ Producer │ ───────────▶ │ events + outbox│ ◀──────────────── │ Worker Pool │
//! └──────────┘   (one tx)   │  (PostgreSQL)  │                   └─────────────┘
//!                           └────────────────┘                          │
//!                                    ▲                                  ▼
//!                           ┌────────────────┐                  ┌─────────────┐
//!                           │ delivery       │ ◀─────────────── │ Handlers    │
//!                           │ attempts       │   idempotency    └─────────────┘
//!                           └────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **At-least-once to the registry**: duplicate `event_id`s collapse on
//!   the unique constraint and report `false` to the producer.
//! - **At-most-once-effective per handler**: a `completed` delivery-attempt
//!   row suppresses re-invocation across retries and stale-claim reclaims.
//! - **Lock-free work distribution**: `FOR UPDATE SKIP LOCKED` claiming
//!   with database-side attempt increments.
//! - **Crash recovery**: claims older than the configured TTL become
//!   reclaimable; finalizing updates are guarded by the claim token.

pub mod queue;
pub mod registry;
pub mod storage;
pub mod worker;

use std::sync::Arc;

use herald_core::{EventRegistry, MemoryRegistry, RegistryError, RegistryMode};
use sqlx::PgPool;

pub use queue::{NoOpTaskQueue, TaskQueue};
pub use registry::{OutboxRegistry, PostCommitHooks};
pub use storage::Storage;
pub use worker::{OutboxWorker, WorkerConfig, WorkerPool, WorkerStats};

/// Default number of concurrent outbox workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default interval between polls when no work is available.
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 1;

/// Builds the registry selected by the configuration.
///
/// `dev` mode yields the in-memory registry; `production` mode requires a
/// database pool and yields the outbox registry, optionally wired to a task
/// queue for async dispatch.
///
/// # Errors
///
/// Returns a configuration error when production mode is requested without
/// a pool, or when the configuration fails validation.
pub fn build_registry(
    config: herald_core::RegistryConfig,
    pool: Option<PgPool>,
    task_queue: Option<Arc<dyn TaskQueue>>,
) -> herald_core::Result<Arc<dyn EventRegistry>> {
    config.validate()?;

    match config.mode {
        RegistryMode::Dev => Ok(Arc::new(MemoryRegistry::new())),
        RegistryMode::Production => {
            let pool = pool.ok_or_else(|| {
                RegistryError::Configuration(
                    "production registry requires a database pool".to_string(),
                )
            })?;
            let mut registry = OutboxRegistry::new(pool, config);
            if let Some(queue) = task_queue {
                registry = registry.with_task_queue(queue);
            }
            Ok(Arc::new(registry))
        },
    }
}
