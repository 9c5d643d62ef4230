//! Integration tests for the transactional outbox registry.
//!
//! Exercises the delivery guarantees against a real PostgreSQL instance:
//! publish-side deduplication, claim/process lifecycle transitions, exact
//! retry accounting, dead-lettering, claim-TTL reclaim, and the per-handler
//! idempotency that keeps side effects at-most-once.

mod common;

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use common::{test_pool, unique_id};
use herald_core::{
    dead_letter_fn, handler_fn, AttemptStatus, EventId, EventRegistry, HandlerRegistration,
    OutboxStatus, RegistryConfig, WorkflowEvent,
};
use herald_outbox::OutboxRegistry;

fn fast_config() -> RegistryConfig {
    // Zero backoff keeps failed entries immediately reclaimable so tests can
    // drive the retry lifecycle without sleeping.
    RegistryConfig {
        async_enabled: true,
        retry_backoff_seconds: 0,
        ..Default::default()
    }
}

fn counting_handler(counter: Arc<AtomicU32>) -> Arc<dyn herald_core::EventHandler> {
    handler_fn(move |_event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

fn failing_handler(counter: Arc<AtomicU32>) -> Arc<dyn herald_core::EventHandler> {
    handler_fn(move |_event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("downstream unavailable")
        }
    })
}

/// Claims and processes everything currently eligible, returning how many
/// entries were claimed.
async fn drain_once(registry: &OutboxRegistry) -> usize {
    let claimed = registry.claim_outbox_batch(None).await.expect("claim should succeed");
    let count = claimed.len();
    for outbox_id in claimed {
        registry.process_outbox_entry(outbox_id).await.expect("process should not error");
    }
    count
}

async fn outbox_entry_for(
    registry: &OutboxRegistry,
    event_id: &EventId,
) -> herald_core::OutboxEntry {
    let entries = registry
        .storage()
        .outbox
        .find_by_event(event_id)
        .await
        .expect("outbox lookup should succeed");
    assert_eq!(entries.len(), 1, "expected exactly one outbox entry per event");
    entries.into_iter().next().expect("entry exists")
}

#[tokio::test]
async fn duplicate_publish_persists_one_event_and_one_execution() {
    let Some(pool) = test_pool().await else { return };
    let registry = OutboxRegistry::new(
        pool,
        RegistryConfig { retry_backoff_seconds: 0, ..Default::default() },
    );

    let calls = Arc::new(AtomicU32::new(0));
    registry.register(HandlerRegistration::new(
        "order.created",
        unique_id("dedup-sub"),
        counting_handler(calls.clone()),
    ));

    let event_id = unique_id("evt");
    let event = WorkflowEvent::new(event_id.as_str(), "order.created");

    assert!(registry.publish(event.clone()).await.expect("first publish"));
    assert!(!registry.publish(event).await.expect("second publish is a no-op"));

    let event_count = registry
        .storage()
        .events
        .count_by_id(&EventId::new(event_id))
        .await
        .expect("count query");
    assert_eq!(event_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scenario_no_subscribers_marks_entry_processed() {
    let Some(pool) = test_pool().await else { return };
    let registry = OutboxRegistry::new(pool, RegistryConfig::default());

    let event_id = EventId::new(unique_id("evt"));
    let event = WorkflowEvent::new(event_id.clone(), "order.created");

    assert!(registry.publish(event).await.expect("publish"));

    let entry = outbox_entry_for(&registry, &event_id).await;
    assert_eq!(entry.status, OutboxStatus::Processed);
    assert!(entry.last_error.is_none());
    assert!(entry.claim_token.is_none());
}

#[tokio::test]
async fn scenario_handler_succeeds_on_third_attempt() {
    let Some(pool) = test_pool().await else { return };
    let registry = OutboxRegistry::new(pool, fast_config());

    let calls = Arc::new(AtomicU32::new(0));
    let attempts = calls.clone();
    let registration_id = unique_id("third-time");
    registry.register(
        HandlerRegistration::new(
            "order.created",
            registration_id.clone(),
            handler_fn(move |_event| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("not yet");
                    }
                    Ok(())
                }
            }),
        )
        .with_retries(2),
    );

    let event_id = EventId::new(unique_id("evt"));
    let event = WorkflowEvent::new(event_id.clone(), "order.created");

    // Async mode: publish defers, the worker contract drives delivery.
    assert!(!registry.publish(event).await.expect("publish defers"));

    for _round in 0..3 {
        assert_eq!(drain_once(&registry).await, 1);
    }

    let entry = outbox_entry_for(&registry, &event_id).await;
    assert_eq!(entry.status, OutboxStatus::Processed);
    assert_eq!(entry.attempts, 3);

    let key = format!("{event_id}:{registration_id}");
    let attempt = registry
        .storage()
        .delivery_attempts
        .find(&key)
        .await
        .expect("attempt lookup")
        .expect("attempt row exists");
    assert_eq!(attempt.status, AttemptStatus::Completed);
    assert_eq!(attempt.attempts, 3);
    assert!(attempt.last_error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn always_failing_handler_dead_letters_after_exact_attempt_count() {
    let Some(pool) = test_pool().await else { return };
    let config = RegistryConfig { max_retries: 2, ..fast_config() };
    let registry = OutboxRegistry::new(pool, config);

    let calls = Arc::new(AtomicU32::new(0));
    registry.register(
        HandlerRegistration::new(
            "order.created",
            unique_id("always-failing"),
            failing_handler(calls.clone()),
        )
        .with_retries(2),
    );

    let event_id = EventId::new(unique_id("evt"));
    assert!(!registry
        .publish(WorkflowEvent::new(event_id.clone(), "order.created"))
        .await
        .expect("publish defers"));

    // 1 initial attempt + 2 retries, then the entry stops being claimable.
    for _round in 0..3 {
        assert_eq!(drain_once(&registry).await, 1);
    }
    assert_eq!(drain_once(&registry).await, 0);

    let entry = outbox_entry_for(&registry, &event_id).await;
    assert_eq!(entry.status, OutboxStatus::DeadLetter);
    assert_eq!(entry.attempts, 3);
    assert!(entry.last_error.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn dead_letter_disabled_leaves_entry_failed_indefinitely() {
    let Some(pool) = test_pool().await else { return };
    let config = RegistryConfig { max_retries: 1, dead_letter_enabled: false, ..fast_config() };
    let registry = OutboxRegistry::new(pool, config);

    registry.register(
        HandlerRegistration::new(
            "order.created",
            unique_id("doomed"),
            failing_handler(Arc::new(AtomicU32::new(0))),
        )
        .with_retries(10),
    );

    let event_id = EventId::new(unique_id("evt"));
    assert!(!registry
        .publish(WorkflowEvent::new(event_id.clone(), "order.created"))
        .await
        .expect("publish defers"));

    // Well past the retry budget; without dead-lettering the entry keeps
    // returning to failed and stays claimable.
    for _round in 0..4 {
        assert_eq!(drain_once(&registry).await, 1);
    }

    let entry = outbox_entry_for(&registry, &event_id).await;
    assert_eq!(entry.status, OutboxStatus::Failed);
    assert!(entry.attempts >= 4);
}

#[tokio::test]
async fn stale_claim_becomes_reclaimable_after_ttl() {
    let Some(pool) = test_pool().await else { return };
    let registry = OutboxRegistry::new(pool.clone(), fast_config());

    let event_id = EventId::new(unique_id("evt"));
    registry.register(HandlerRegistration::new(
        "order.created",
        unique_id("slow-sub"),
        counting_handler(Arc::new(AtomicU32::new(0))),
    ));
    assert!(!registry
        .publish(WorkflowEvent::new(event_id.clone(), "order.created"))
        .await
        .expect("publish defers"));

    let claimed = registry.claim_outbox_batch(None).await.expect("first claim");
    assert_eq!(claimed.len(), 1);
    let outbox_id = claimed[0];

    // A live claim is invisible to other claimers.
    assert!(registry.claim_outbox_batch(None).await.expect("second claim").is_empty());

    // Simulate a crashed worker by backdating the claim past the TTL.
    sqlx::query("UPDATE outbox SET claimed_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(outbox_id)
        .execute(&pool)
        .await
        .expect("backdate claim");

    let reclaimed = registry.claim_outbox_batch(None).await.expect("reclaim");
    assert_eq!(reclaimed, vec![outbox_id]);

    let entry = outbox_entry_for(&registry, &event_id).await;
    assert_eq!(entry.status, OutboxStatus::Claimed);
    assert_eq!(entry.attempts, 2);
}

#[tokio::test]
async fn finalization_requires_matching_claim_token() {
    let Some(pool) = test_pool().await else { return };
    let registry = OutboxRegistry::new(pool, fast_config());

    let event_id = EventId::new(unique_id("evt"));
    registry.register(HandlerRegistration::new(
        "order.created",
        unique_id("guarded-sub"),
        counting_handler(Arc::new(AtomicU32::new(0))),
    ));
    assert!(!registry
        .publish(WorkflowEvent::new(event_id.clone(), "order.created"))
        .await
        .expect("publish defers"));

    let claimed = registry.claim_outbox_batch(None).await.expect("claim");
    let outbox_id = claimed[0];
    let entry = outbox_entry_for(&registry, &event_id).await;
    let held_token = entry.claim_token.expect("claimed entries carry a token");

    // A worker holding a stale token cannot finalize the entry.
    let stale = registry
        .storage()
        .outbox
        .mark_processed(outbox_id, Some(uuid::Uuid::new_v4()), chrono::Utc::now())
        .await
        .expect("update runs");
    assert!(!stale);
    assert_eq!(outbox_entry_for(&registry, &event_id).await.status, OutboxStatus::Claimed);

    // The rightful holder can.
    let finalized = registry
        .storage()
        .outbox
        .mark_processed(outbox_id, Some(held_token), chrono::Utc::now())
        .await
        .expect("update runs");
    assert!(finalized);
    assert_eq!(outbox_entry_for(&registry, &event_id).await.status, OutboxStatus::Processed);
}

#[tokio::test]
async fn concurrent_claimers_receive_disjoint_batches() {
    let Some(pool) = test_pool().await else { return };
    let registry = Arc::new(OutboxRegistry::new(pool, fast_config()));

    let mut published = Vec::new();
    for _ in 0..20 {
        let event_id = EventId::new(unique_id("evt"));
        registry
            .publish(WorkflowEvent::new(event_id.clone(), "order.created"))
            .await
            .expect("publish defers");
        published.push(event_id);
    }

    let claimers: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.claim_outbox_batch(Some(5)).await })
        })
        .collect();

    let mut all_claimed = Vec::new();
    for claimer in claimers {
        let claimed = claimer.await.expect("task join").expect("claim succeeds");
        all_claimed.extend(claimed);
    }

    let mut deduped = all_claimed.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(deduped.len(), all_claimed.len(), "no id may be claimed twice");
}

#[tokio::test]
async fn completed_handler_is_not_reinvoked_on_outbox_retry() {
    let Some(pool) = test_pool().await else { return };
    let config = RegistryConfig { max_retries: 3, ..fast_config() };
    let registry = OutboxRegistry::new(pool, config);

    let healthy_calls = Arc::new(AtomicU32::new(0));
    let failing_calls = Arc::new(AtomicU32::new(0));
    let healthy_id = unique_id("healthy");
    let failing_id = unique_id("failing");

    registry.register(HandlerRegistration::new(
        "order.created",
        healthy_id.clone(),
        counting_handler(healthy_calls.clone()),
    ));
    registry.register(HandlerRegistration::new(
        "order.created",
        failing_id.clone(),
        failing_handler(failing_calls.clone()),
    ));

    let event_id = EventId::new(unique_id("evt"));
    assert!(!registry
        .publish(WorkflowEvent::new(event_id.clone(), "order.created"))
        .await
        .expect("publish defers"));

    // Round 1: healthy completes, failing dead-letters (zero retries), the
    // entry records a failure.
    assert_eq!(drain_once(&registry).await, 1);
    assert_eq!(outbox_entry_for(&registry, &event_id).await.status, OutboxStatus::Failed);

    // Round 2: the completed attempt suppresses re-invocation, the
    // dead-lettered one is terminal, and the entry finishes as processed.
    assert_eq!(drain_once(&registry).await, 1);
    assert_eq!(outbox_entry_for(&registry, &event_id).await.status, OutboxStatus::Processed);

    assert_eq!(healthy_calls.load(Ordering::SeqCst), 1, "completed handler ran exactly once");
    assert_eq!(failing_calls.load(Ordering::SeqCst), 1, "dead-lettered handler ran exactly once");

    let healthy_attempt = registry
        .storage()
        .delivery_attempts
        .find(&format!("{event_id}:{healthy_id}"))
        .await
        .expect("lookup")
        .expect("row exists");
    assert_eq!(healthy_attempt.status, AttemptStatus::Completed);
    assert_eq!(healthy_attempt.attempts, 1);

    let failing_attempt = registry
        .storage()
        .delivery_attempts
        .find(&format!("{event_id}:{failing_id}"))
        .await
        .expect("lookup")
        .expect("row exists");
    assert_eq!(failing_attempt.status, AttemptStatus::DeadLetter);
    assert!(failing_attempt.last_traceback.is_some());
}

#[tokio::test]
async fn validator_failure_dead_letters_without_invoking_handler() {
    let Some(pool) = test_pool().await else { return };
    let registry = OutboxRegistry::new(pool, RegistryConfig::default());

    let handler_calls = Arc::new(AtomicU32::new(0));
    let dead_letters = Arc::new(AtomicU32::new(0));
    let registration_id = unique_id("strict");

    let dead_counter = dead_letters.clone();
    registry.register(
        HandlerRegistration::new(
            "order.created",
            registration_id.clone(),
            counting_handler(handler_calls.clone()),
        )
        .with_retries(5)
        .with_validator(|event| {
            anyhow::ensure!(event.payload.contains_key("total"), "missing total");
            Ok(())
        })
        .with_dead_letter_handler(dead_letter_fn(move |_event, _registration, _error| {
            let dead_counter = dead_counter.clone();
            async move {
                dead_counter.fetch_add(1, Ordering::SeqCst);
            }
        })),
    );

    let event_id = EventId::new(unique_id("evt"));
    let published = registry
        .publish(WorkflowEvent::new(event_id.clone(), "order.created"))
        .await
        .expect("publish");
    assert!(!published, "nothing completed, so the publish reports unhandled");

    assert_eq!(handler_calls.load(Ordering::SeqCst), 0, "handler never ran");
    assert_eq!(dead_letters.load(Ordering::SeqCst), 1, "dead-letter handler ran immediately");

    let attempt = registry
        .storage()
        .delivery_attempts
        .find(&format!("{event_id}:{registration_id}"))
        .await
        .expect("lookup")
        .expect("row exists");
    assert_eq!(attempt.status, AttemptStatus::DeadLetter);
    assert_eq!(attempt.attempts, 0, "no retry was consumed");
}

#[tokio::test]
async fn operator_replay_reenables_processing() {
    let Some(pool) = test_pool().await else { return };
    let config = RegistryConfig { max_retries: 0, ..fast_config() };
    let registry = OutboxRegistry::new(pool, config);

    let healthy_again = Arc::new(AtomicBool::new(false));
    let gate = healthy_again.clone();
    registry.register(
        HandlerRegistration::new(
            "order.created",
            unique_id("recovering"),
            handler_fn(move |_event| {
                let gate = gate.clone();
                async move {
                    anyhow::ensure!(gate.load(Ordering::SeqCst), "dependency down");
                    Ok(())
                }
            }),
        )
        .with_retries(5),
    );

    let event_id = EventId::new(unique_id("evt"));
    assert!(!registry
        .publish(WorkflowEvent::new(event_id.clone(), "order.created"))
        .await
        .expect("publish defers"));

    // First attempt exhausts the zero-retry budget and dead-letters.
    assert_eq!(drain_once(&registry).await, 1);
    let entry = outbox_entry_for(&registry, &event_id).await;
    assert_eq!(entry.status, OutboxStatus::DeadLetter);
    assert_eq!(drain_once(&registry).await, 0, "dead-lettered entries are not claimable");

    // Operator fixes the dependency and replays the entry.
    healthy_again.store(true, Ordering::SeqCst);
    assert!(registry.reset_for_retry(entry.id).await.expect("replay reset"));

    assert_eq!(drain_once(&registry).await, 1);
    assert_eq!(outbox_entry_for(&registry, &event_id).await.status, OutboxStatus::Processed);
}

#[tokio::test]
async fn inline_publish_reports_successful_handling() {
    let Some(pool) = test_pool().await else { return };
    let registry = OutboxRegistry::new(pool, RegistryConfig::default());

    let calls = Arc::new(AtomicU32::new(0));
    let registration_id = unique_id("inline");
    registry.register(HandlerRegistration::new(
        "order.created",
        registration_id.clone(),
        counting_handler(calls.clone()),
    ));

    let event_id = EventId::new(unique_id("evt"));
    assert!(registry
        .publish(WorkflowEvent::new(event_id.clone(), "order.created"))
        .await
        .expect("publish"));

    let entry = outbox_entry_for(&registry, &event_id).await;
    assert_eq!(entry.status, OutboxStatus::Processed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let attempt = registry
        .storage()
        .delivery_attempts
        .find(&format!("{event_id}:{registration_id}"))
        .await
        .expect("lookup")
        .expect("row exists");
    assert_eq!(attempt.status, AttemptStatus::Completed);
    assert_eq!(attempt.attempts, 1);
}

#[tokio::test]
async fn publish_sync_routes_without_persisting() {
    let Some(pool) = test_pool().await else { return };
    let registry = OutboxRegistry::new(pool, RegistryConfig::default());

    let calls = Arc::new(AtomicU32::new(0));
    registry.register(HandlerRegistration::new(
        "order.created",
        unique_id("sync-sub"),
        counting_handler(calls.clone()),
    ));

    let event_id = EventId::new(unique_id("evt"));
    assert!(registry
        .publish_sync(WorkflowEvent::new(event_id.clone(), "order.created"))
        .await
        .expect("publish_sync"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let event_count =
        registry.storage().events.count_by_id(&event_id).await.expect("count query");
    assert_eq!(event_count, 0, "publish_sync must not persist the event");

    let entries = registry
        .storage()
        .outbox
        .find_by_event(&event_id)
        .await
        .expect("outbox lookup");
    assert!(entries.is_empty());
}
