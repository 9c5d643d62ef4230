//! The database-backed outbox registry.
//!
//! `publish` persists the event and its outbox row in one transaction, so
//! an event is durable exactly when its delivery obligation is. Workers
//! drive delivery through `claim_outbox_batch` and `process_outbox_entry`;
//! per-handler delivery attempts keep side effects at-most-once across
//! retries and reclaims.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use herald_core::{
    error::{RegistryError, Result},
    handler::HandlerRegistration,
    models::{AttemptStatus, OutboxEntry, OutboxStatus, WorkflowEvent},
    registry::EventRegistry,
    router::Router,
    RegistryConfig,
};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{queue::TaskQueue, storage::Storage};

/// Error recorded when matched handlers exist but none completed.
const UNHANDLED_ERROR: &str = "handler did not complete";

/// Callbacks to run after the publishing transaction commits.
///
/// Models deferred dispatch as an explicit transaction-scoped list the
/// publisher drains after a successful commit. Nothing runs on rollback or
/// when the publish short-circuits as a duplicate.
#[derive(Default)]
pub struct PostCommitHooks {
    hooks: Vec<BoxFuture<'static, anyhow::Result<()>>>,
}

impl PostCommitHooks {
    /// Creates an empty hook list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook.
    pub fn push(&mut self, hook: BoxFuture<'static, anyhow::Result<()>>) {
        self.hooks.push(hook);
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// True when no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs every hook in registration order, logging failures.
    pub async fn drain(self) {
        for hook in self.hooks {
            if let Err(error) = hook.await {
                warn!(error = %error, "post-commit hook failed");
            }
        }
    }
}

/// Production registry persisting events through the transactional outbox.
pub struct OutboxRegistry {
    storage: Storage,
    router: Router,
    config: RegistryConfig,
    task_queue: Option<Arc<dyn TaskQueue>>,
}

impl OutboxRegistry {
    /// Creates a registry over the given pool and configuration.
    pub fn new(pool: PgPool, config: RegistryConfig) -> Self {
        Self { storage: Storage::new(pool), router: Router::new(), config, task_queue: None }
    }

    /// Wires the external task queue used for async dispatch.
    pub fn with_task_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.task_queue = Some(queue);
        self
    }

    /// Installs a registry-level dead-letter fallback.
    ///
    /// Replaces the routing core, so call before registering handlers.
    pub fn with_dead_letter_fallback(
        mut self,
        fallback: Arc<dyn herald_core::handler::DeadLetterHandler>,
    ) -> Self {
        self.router = Router::with_fallback(fallback);
        self
    }

    /// Returns the storage layer, mainly for operational tooling and tests.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Claims up to `batch_size` outbox entries for processing.
    ///
    /// Defaults to the configured batch size. Claimed entries move to
    /// `claimed` under a fresh token with their attempt counters bumped
    /// database-side; callers process each returned id with
    /// [`OutboxRegistry::process_outbox_entry`].
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_outbox_batch(&self, batch_size: Option<usize>) -> Result<Vec<i64>> {
        let limit = batch_size.unwrap_or(self.config.outbox_batch_size);
        let now = Utc::now();
        let ttl = chrono::Duration::seconds(
            i64::try_from(self.config.outbox_claim_ttl_seconds).unwrap_or(i64::MAX),
        );
        let claim_token = Uuid::new_v4();

        let claimed =
            self.storage.outbox.claim_batch(limit, now, now - ttl, claim_token).await?;

        if !claimed.is_empty() {
            debug!(claimed = claimed.len(), %claim_token, "claimed outbox batch");
        }

        Ok(claimed)
    }

    /// Processes one outbox entry through registered handlers.
    ///
    /// Idempotent: missing or already-processed entries return false. A
    /// stale claim (the entry was reclaimed by another worker while this
    /// one ran) also returns false without overwriting the newer claim's
    /// state.
    ///
    /// # Errors
    ///
    /// Returns error only for storage failures; handler failures are
    /// captured as row state.
    pub async fn process_outbox_entry(&self, outbox_id: i64) -> Result<bool> {
        let Some(entry) = self.storage.outbox.find(outbox_id).await? else {
            debug!(outbox_id, "outbox entry not found");
            return Ok(false);
        };
        if entry.status == OutboxStatus::Processed {
            debug!(outbox_id, "outbox entry already processed");
            return Ok(false);
        }

        let Some(event) = self.storage.events.find(&entry.event_id).await? else {
            warn!(outbox_id, event_id = %entry.event_id, "outbox entry references missing event");
            return Ok(false);
        };

        // Captured before routing to distinguish "no subscribers" from
        // "handlers present but none completed".
        let has_handlers = self.router.has_handlers(&event);

        let outcome =
            if has_handlers { self.route_recorded(&event).await } else { Ok(false) };

        let now = Utc::now();
        match outcome {
            Err(error) => {
                self.fail_entry(&entry, &error.to_string(), now).await?;
                Ok(false)
            },
            Ok(handled) => {
                if !handled && has_handlers {
                    self.fail_entry(&entry, UNHANDLED_ERROR, now).await?;
                    return Ok(false);
                }

                let finalized =
                    self.storage.outbox.mark_processed(entry.id, entry.claim_token, now).await?;
                if !finalized {
                    warn!(
                        outbox_id,
                        "stale claim: entry was reclaimed before this worker finished"
                    );
                    return Ok(false);
                }

                debug!(outbox_id, event_id = %entry.event_id, "outbox entry processed");
                Ok(true)
            },
        }
    }

    /// Returns a `failed` or `dead_letter` entry to `pending` for replay.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reset_for_retry(&self, outbox_id: i64) -> Result<bool> {
        let reset = self.storage.outbox.reset_for_retry(outbox_id, Utc::now()).await?;
        if reset {
            info!(outbox_id, "outbox entry reset for replay");
        }
        Ok(reset)
    }

    /// Records a failed processing attempt on the outbox row.
    ///
    /// The claim step already incremented `attempts` for claimed entries;
    /// direct and inline invocations increment here instead. Entries whose
    /// total attempts exceed `max_retries` dead-letter when enabled,
    /// otherwise the linear backoff gates the next claim.
    async fn fail_entry(
        &self,
        entry: &OutboxEntry,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let attempts = if entry.status == OutboxStatus::Claimed {
            entry.attempts
        } else {
            entry.attempts + 1
        };

        let exhausted = attempts > i32::try_from(self.config.max_retries).unwrap_or(i32::MAX);
        let applied = if exhausted && self.config.dead_letter_enabled {
            let applied = self
                .storage
                .outbox
                .mark_dead_letter(entry.id, attempts, error, entry.claim_token, now)
                .await?;
            if applied {
                warn!(
                    outbox_id = entry.id,
                    event_id = %entry.event_id,
                    attempts,
                    error,
                    "outbox entry dead-lettered"
                );
            }
            applied
        } else {
            let backoff = chrono::Duration::from_std(self.config.backoff_for(attempts))
                .unwrap_or_else(|_| chrono::Duration::zero());
            let applied = self
                .storage
                .outbox
                .mark_failed(entry.id, attempts, error, now + backoff, entry.claim_token, now)
                .await?;
            if applied {
                debug!(
                    outbox_id = entry.id,
                    event_id = %entry.event_id,
                    attempts,
                    error,
                    "outbox entry failed, retry scheduled"
                );
            }
            applied
        };

        if !applied {
            warn!(
                outbox_id = entry.id,
                "stale claim: failure not recorded, entry was reclaimed"
            );
        }

        Ok(())
    }

    /// Routes an event while recording per-handler delivery attempts.
    ///
    /// Replaces the in-process retry wrapper of the plain router: retries
    /// happen across outbox claims, and the attempt rows carry the counts.
    /// A `completed` row short-circuits without invoking the handler. The
    /// first handler failure propagates so the outbox layer records it;
    /// already-completed registrations stay untouched on the rerun.
    async fn route_recorded(&self, event: &WorkflowEvent) -> Result<bool> {
        let matched = self.router.matches(event);
        let mut any_completed = false;

        for registration in matched {
            if self.execute_recorded(event, &registration).await? {
                any_completed = true;
            }
        }

        Ok(any_completed)
    }

    /// Runs one registration with delivery-attempt bookkeeping.
    ///
    /// Returns whether the registration counts as completed for this event.
    async fn execute_recorded(
        &self,
        event: &WorkflowEvent,
        registration: &Arc<HandlerRegistration>,
    ) -> Result<bool> {
        let now = Utc::now();
        let key = registration.idempotency_key(&event.event_id);

        if let Some(validator) = &registration.validator {
            if let Err(validation_error) = validator(event) {
                warn!(
                    event_id = %event.event_id,
                    registration_id = %registration.registration_id,
                    error = %validation_error,
                    "validator rejected event, dead-lettering without retry"
                );
                self.storage
                    .delivery_attempts
                    .get_or_create(&key, &event.event_id, &registration.registration_id, now)
                    .await?;
                let status = self.exhausted_status();
                self.storage
                    .delivery_attempts
                    .mark_failed(
                        &key,
                        status,
                        &validation_error.to_string(),
                        &format!("{validation_error:?}"),
                        now,
                    )
                    .await?;
                self.router.dispatch_dead_letter(event, registration, &validation_error).await;
                return Ok(false);
            }
        }

        if let Some(when) = &registration.when {
            if !when(event) {
                debug!(
                    event_id = %event.event_id,
                    registration_id = %registration.registration_id,
                    "guard predicate declined event"
                );
                return Ok(false);
            }
        }

        let attempt = self
            .storage
            .delivery_attempts
            .get_or_create(&key, &event.event_id, &registration.registration_id, now)
            .await?;
        match attempt.status {
            AttemptStatus::Completed => {
                debug!(
                    event_id = %event.event_id,
                    registration_id = %registration.registration_id,
                    "delivery already completed, skipping handler"
                );
                return Ok(true);
            },
            AttemptStatus::DeadLetter => {
                // Terminal: the handler's retry budget is spent even though
                // the outbox row may retry for other registrations.
                return Ok(false);
            },
            AttemptStatus::Pending | AttemptStatus::Running | AttemptStatus::Failed => {},
        }

        let attempts = self.storage.delivery_attempts.mark_running(&key, now).await?;

        match registration.handler.handle(event).await {
            Ok(()) => {
                self.storage.delivery_attempts.mark_completed(&key, Utc::now()).await?;
                debug!(
                    event_id = %event.event_id,
                    registration_id = %registration.registration_id,
                    attempts,
                    "handler completed"
                );
                Ok(true)
            },
            Err(handler_error) => {
                let budget_spent =
                    attempts > i32::try_from(registration.retries).unwrap_or(i32::MAX);
                let exhausted = budget_spent || !registration.is_retryable(&handler_error);
                let status =
                    if exhausted { self.exhausted_status() } else { AttemptStatus::Failed };
                self.storage
                    .delivery_attempts
                    .mark_failed(
                        &key,
                        status,
                        &handler_error.to_string(),
                        &format!("{handler_error:?}"),
                        Utc::now(),
                    )
                    .await?;

                if status == AttemptStatus::DeadLetter {
                    self.router.dispatch_dead_letter(event, registration, &handler_error).await;
                }

                Err(RegistryError::HandlerFailed {
                    registration_id: registration.registration_id.clone(),
                    source: handler_error,
                })
            },
        }
    }

    /// Terminal status for an attempt whose retry budget is spent.
    fn exhausted_status(&self) -> AttemptStatus {
        if self.config.dead_letter_enabled {
            AttemptStatus::DeadLetter
        } else {
            AttemptStatus::Failed
        }
    }
}

#[async_trait]
impl EventRegistry for OutboxRegistry {
    fn register(&self, registration: HandlerRegistration) {
        self.router.register(registration);
    }

    async fn publish(&self, event: WorkflowEvent) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.storage.pool().begin().await?;

        if let Err(error) = self.storage.events.create_in_tx(&mut tx, &event).await {
            if error.is_duplicate() {
                tx.rollback().await?;
                debug!(event_id = %event.event_id, "duplicate event ignored");
                return Ok(false);
            }
            return Err(error);
        }

        let outbox_id = self.storage.outbox.create_in_tx(&mut tx, &event.event_id, now).await?;

        let mut hooks = PostCommitHooks::new();
        if self.config.async_enabled {
            if let Some(queue) = self.task_queue.clone() {
                hooks.push(Box::pin(async move { queue.enqueue_outbox_batch().await }));
            }
        }

        tx.commit().await?;
        info!(event_id = %event.event_id, outbox_id, "event published");
        hooks.drain().await;

        if self.config.async_enabled {
            // Deferred: the task queue (or a polling worker) picks the entry
            // up; callers must not assume synchronous handling.
            return Ok(false);
        }

        self.process_outbox_entry(outbox_id).await
    }

    async fn publish_sync(&self, event: WorkflowEvent) -> Result<bool> {
        Ok(self.router.route(&event).await)
    }
}
