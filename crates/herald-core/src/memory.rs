//! Single-process in-memory registry for development and testing.
//!
//! Deduplicates by event id in a mutex-guarded set and routes synchronously
//! on the publishing task. No durability and no cross-process dedup; the
//! production path is the database-backed outbox registry.

use std::{
    collections::HashSet,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;

use crate::{
    error::Result,
    handler::{DeadLetterHandler, HandlerRegistration},
    models::{EventId, WorkflowEvent},
    registry::EventRegistry,
    router::Router,
};

/// In-memory event registry.
///
/// The dedup set is the only state guarded by the mutex; handler execution
/// happens after the lock is released, so a slow handler never blocks
/// publication of other events.
pub struct MemoryRegistry {
    router: Router,
    seen: Mutex<HashSet<EventId>>,
}

impl MemoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { router: Router::new(), seen: Mutex::new(HashSet::new()) }
    }

    /// Creates an empty registry with a registry-level dead-letter fallback.
    pub fn with_dead_letter_fallback(fallback: std::sync::Arc<dyn DeadLetterHandler>) -> Self {
        Self { router: Router::with_fallback(fallback), seen: Mutex::new(HashSet::new()) }
    }

    /// Returns the routing core, mainly for inspection in tests.
    pub fn router(&self) -> &Router {
        &self.router
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventRegistry for MemoryRegistry {
    fn register(&self, registration: HandlerRegistration) {
        self.router.register(registration);
    }

    async fn publish(&self, event: WorkflowEvent) -> Result<bool> {
        {
            let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
            if !seen.insert(event.event_id.clone()) {
                tracing::debug!(event_id = %event.event_id, "duplicate event ignored");
                return Ok(false);
            }
        }

        Ok(self.router.route(&event).await)
    }

    async fn publish_sync(&self, event: WorkflowEvent) -> Result<bool> {
        Ok(self.router.route(&event).await)
    }
}
