//! Handler traits and registration descriptors.
//!
//! Handlers implement [`EventHandler`]; everything else on a registration
//! (validator, `when` predicate, retry policy, dead-letter handler) is
//! optional. Registration identity is an explicit caller-supplied string so
//! the same logical handler maps to the same idempotency keys across process
//! restarts.

use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;

use crate::models::{EventId, WorkflowEvent};

/// Handler invoked for events matching a registration.
///
/// Errors are opaque `anyhow` values so handlers can attach context freely;
/// the full chain is persisted alongside failed delivery attempts.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Executes the handler for one event.
    async fn handle(&self, event: &WorkflowEvent) -> anyhow::Result<()>;
}

/// Receiver for events that exhausted their retry policy or failed
/// validation.
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    /// Called once per dead-lettered (event, registration) pair.
    ///
    /// Must not block routing of the remaining registrations; failures here
    /// should be logged by the implementation, not propagated.
    async fn on_dead_letter(
        &self,
        event: &WorkflowEvent,
        registration_id: &str,
        error: &anyhow::Error,
    );
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(WorkflowEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &WorkflowEvent) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

/// Wraps an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(WorkflowEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

struct FnDeadLetterHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> DeadLetterHandler for FnDeadLetterHandler<F>
where
    F: Fn(WorkflowEvent, String, String) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn on_dead_letter(
        &self,
        event: &WorkflowEvent,
        registration_id: &str,
        error: &anyhow::Error,
    ) {
        (self.f)(event.clone(), registration_id.to_string(), error.to_string()).await;
    }
}

/// Wraps an async closure as a [`DeadLetterHandler`].
///
/// The closure receives the event, the registration id, and the rendered
/// error message.
pub fn dead_letter_fn<F, Fut>(f: F) -> Arc<dyn DeadLetterHandler>
where
    F: Fn(WorkflowEvent, String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnDeadLetterHandler { f })
}

/// Validator run before the handler; any error dead-letters the event for
/// this registration without consuming a retry.
pub type EventValidator = Arc<dyn Fn(&WorkflowEvent) -> anyhow::Result<()> + Send + Sync>;

/// Predicate deciding whether a matched registration should run at all.
pub type EventPredicate = Arc<dyn Fn(&WorkflowEvent) -> bool + Send + Sync>;

/// Predicate deciding whether a handler error is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// A handler subscription held by a registry.
///
/// `event_key` is either a dotted type string (`order.created`, matched
/// against `event_type`) or a bare name (matched against `event_name`).
/// Registrations are append-only and matched in registration order.
#[derive(Clone)]
pub struct HandlerRegistration {
    /// Dotted type string or bare event name this registration subscribes to.
    pub event_key: String,

    /// Stable identity for this registration.
    ///
    /// Combined with the event id to form delivery-attempt idempotency keys,
    /// so it must be reproducible across process restarts for the same
    /// logical handler.
    pub registration_id: String,

    /// The handler to invoke.
    pub handler: Arc<dyn EventHandler>,

    /// Optional validator run before the handler.
    pub validator: Option<EventValidator>,

    /// Optional guard predicate; false skips the registration silently.
    pub when: Option<EventPredicate>,

    /// Retries after the initial attempt (total attempts = retries + 1).
    pub retries: u32,

    /// Optional retry gate consulted per failure; defaults to always retry.
    pub retry_on: Option<RetryPredicate>,

    /// Optional registration-specific dead-letter handler.
    pub dead_letter_handler: Option<Arc<dyn DeadLetterHandler>>,
}

impl HandlerRegistration {
    /// Creates a registration with no validator, guard, or retries.
    pub fn new(
        event_key: impl Into<String>,
        registration_id: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            event_key: event_key.into(),
            registration_id: registration_id.into(),
            handler,
            validator: None,
            when: None,
            retries: 0,
            retry_on: None,
            dead_letter_handler: None,
        }
    }

    /// Sets the validator.
    pub fn with_validator(
        mut self,
        validator: impl Fn(&WorkflowEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Sets the `when` guard predicate.
    pub fn with_when(
        mut self,
        when: impl Fn(&WorkflowEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.when = Some(Arc::new(when));
        self
    }

    /// Sets the retry count (attempts beyond the first).
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the retry gate predicate.
    pub fn with_retry_on(
        mut self,
        retry_on: impl Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_on = Some(Arc::new(retry_on));
        self
    }

    /// Sets the registration-specific dead-letter handler.
    pub fn with_dead_letter_handler(mut self, handler: Arc<dyn DeadLetterHandler>) -> Self {
        self.dead_letter_handler = Some(handler);
        self
    }

    /// True when the key subscribes by dotted event type rather than name.
    pub fn is_type_key(&self) -> bool {
        self.event_key.contains('.')
    }

    /// Idempotency key for this registration applied to one event.
    pub fn idempotency_key(&self, event_id: &EventId) -> String {
        format!("{}:{}", event_id, self.registration_id)
    }

    /// True when a failure should be retried, per the `retry_on` gate.
    pub fn is_retryable(&self, error: &anyhow::Error) -> bool {
        self.retry_on.as_ref().map_or(true, |gate| gate(error))
    }
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("event_key", &self.event_key)
            .field("registration_id", &self.registration_id)
            .field("retries", &self.retries)
            .field("has_validator", &self.validator.is_some())
            .field("has_when", &self.when.is_some())
            .field("has_dead_letter_handler", &self.dead_letter_handler.is_some())
            .finish()
    }
}
