//! Routing and retry core shared by every registry implementation.
//!
//! The router matches events to registrations through two maps: dotted type
//! strings against `event_type` and bare names against `event_name`. Both
//! are consulted per event and their matches unioned in registration order.
//! `route` then drives each match through the validator / guard / retry /
//! dead-letter pipeline in-process; the database registry reuses the
//! matching and dead-letter dispatch while recording per-handler attempts
//! itself.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use tracing::{debug, error, warn};

use crate::{
    handler::{DeadLetterHandler, HandlerRegistration},
    models::WorkflowEvent,
};

#[derive(Default)]
struct RegistrationMaps {
    by_type: HashMap<String, Vec<Arc<HandlerRegistration>>>,
    by_name: HashMap<String, Vec<Arc<HandlerRegistration>>>,
}

/// Outcome of executing one matched registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Skipped,
    DeadLettered,
}

/// Matches events to registrations and executes them with retry and
/// dead-letter semantics.
pub struct Router {
    maps: RwLock<RegistrationMaps>,
    fallback_dead_letter: Option<Arc<dyn DeadLetterHandler>>,
}

impl Router {
    /// Creates an empty router with no registry-level dead-letter fallback.
    pub fn new() -> Self {
        Self { maps: RwLock::new(RegistrationMaps::default()), fallback_dead_letter: None }
    }

    /// Creates an empty router with a registry-level dead-letter fallback,
    /// used when a dead-lettered registration has no handler of its own.
    pub fn with_fallback(fallback: Arc<dyn DeadLetterHandler>) -> Self {
        Self {
            maps: RwLock::new(RegistrationMaps::default()),
            fallback_dead_letter: Some(fallback),
        }
    }

    /// Appends a registration to the type or name map, keyed by whether the
    /// event key contains a dot.
    pub fn register(&self, registration: HandlerRegistration) {
        let registration = Arc::new(registration);
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        let bucket = if registration.is_type_key() {
            maps.by_type.entry(registration.event_key.clone()).or_default()
        } else {
            maps.by_name.entry(registration.event_key.clone()).or_default()
        };
        bucket.push(registration);
    }

    /// Collects registrations matching the event's type and name, in
    /// registration order (type matches first, then name matches).
    pub fn matches(&self, event: &WorkflowEvent) -> Vec<Arc<HandlerRegistration>> {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched = Vec::new();
        if let Some(registrations) = maps.by_type.get(&event.event_type) {
            matched.extend(registrations.iter().cloned());
        }
        if let Some(name) = &event.event_name {
            if let Some(registrations) = maps.by_name.get(name) {
                matched.extend(registrations.iter().cloned());
            }
        }
        matched
    }

    /// True when at least one registration matches the event.
    pub fn has_handlers(&self, event: &WorkflowEvent) -> bool {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        if maps.by_type.get(&event.event_type).is_some_and(|r| !r.is_empty()) {
            return true;
        }
        event
            .event_name
            .as_ref()
            .and_then(|name| maps.by_name.get(name))
            .is_some_and(|r| !r.is_empty())
    }

    /// Routes an event through every matched registration.
    ///
    /// Returns true iff at least one registration completed successfully;
    /// skipped and dead-lettered registrations do not count.
    pub async fn route(&self, event: &WorkflowEvent) -> bool {
        let matched = self.matches(event);
        let mut any_completed = false;

        for registration in matched {
            match self.execute(event, &registration).await {
                Outcome::Completed => any_completed = true,
                Outcome::Skipped | Outcome::DeadLettered => {},
            }
        }

        any_completed
    }

    /// Runs one registration: validator, guard, then up to `retries + 1`
    /// handler attempts with the `retry_on` gate deciding whether a failure
    /// is worth another try.
    async fn execute(
        &self,
        event: &WorkflowEvent,
        registration: &Arc<HandlerRegistration>,
    ) -> Outcome {
        if let Some(validator) = &registration.validator {
            if let Err(validation_error) = validator(event) {
                warn!(
                    event_id = %event.event_id,
                    registration_id = %registration.registration_id,
                    error = %validation_error,
                    "validator rejected event, dead-lettering without retry"
                );
                self.dispatch_dead_letter(event, registration, &validation_error).await;
                return Outcome::DeadLettered;
            }
        }

        if let Some(when) = &registration.when {
            if !when(event) {
                debug!(
                    event_id = %event.event_id,
                    registration_id = %registration.registration_id,
                    "guard predicate declined event"
                );
                return Outcome::Skipped;
            }
        }

        let max_attempts = registration.retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match registration.handler.handle(event).await {
                Ok(()) => {
                    debug!(
                        event_id = %event.event_id,
                        registration_id = %registration.registration_id,
                        attempt,
                        "handler completed"
                    );
                    return Outcome::Completed;
                },
                Err(handler_error) => {
                    let retry =
                        attempt < max_attempts && registration.is_retryable(&handler_error);
                    if retry {
                        debug!(
                            event_id = %event.event_id,
                            registration_id = %registration.registration_id,
                            attempt,
                            error = %handler_error,
                            "handler failed, retrying"
                        );
                        continue;
                    }

                    warn!(
                        event_id = %event.event_id,
                        registration_id = %registration.registration_id,
                        attempt,
                        error = %handler_error,
                        "handler failed, retries exhausted"
                    );
                    self.dispatch_dead_letter(event, registration, &handler_error).await;
                    return Outcome::DeadLettered;
                },
            }
        }
    }

    /// Sends a dead-lettered event to the registration's handler, falling
    /// back to the registry-level handler, else logging.
    pub async fn dispatch_dead_letter(
        &self,
        event: &WorkflowEvent,
        registration: &HandlerRegistration,
        cause: &anyhow::Error,
    ) {
        if let Some(handler) = &registration.dead_letter_handler {
            handler.on_dead_letter(event, &registration.registration_id, cause).await;
        } else if let Some(fallback) = &self.fallback_dead_letter {
            fallback.on_dead_letter(event, &registration.registration_id, cause).await;
        } else {
            error!(
                event_id = %event.event_id,
                registration_id = %registration.registration_id,
                error = %cause,
                "event dead-lettered with no dead-letter handler configured"
            );
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
