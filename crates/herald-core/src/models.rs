//! Core domain models and strongly-typed identifiers.
//!
//! Defines workflow events, outbox entries, delivery attempts, and the
//! status enums that drive the delivery lifecycle. Includes database
//! serialization traits so the same types flow between application code and
//! the relational store without translation layers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Opaque JSON mapping used for event payloads and metadata.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Producer-supplied event identifier and global deduplication key.
///
/// Wraps an arbitrary string so callers can reuse identifiers from upstream
/// systems (order numbers, message ids, UUIDs). Publishing the same id twice
/// is a no-op; the second publish returns `false`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    /// Creates an event id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Immutable domain event published through a registry.
///
/// Events carry a hierarchical dotted `event_type` (e.g. `order.created`)
/// for broad subscription and an optional `event_name` alias for exact-match
/// subscription. Both keys are consulted during routing and their matches
/// unioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Globally unique, producer-supplied identifier.
    pub event_id: EventId,

    /// Hierarchical dotted type string used for subscription by type.
    pub event_type: String,

    /// Optional exact-match alias checked against name registrations.
    pub event_name: Option<String>,

    /// Opaque key/value payload.
    pub payload: JsonMap,

    /// Logical origin of the event (service or module name).
    pub source: Option<String>,

    /// When the underlying domain occurrence happened.
    pub occurred_at: DateTime<Utc>,

    /// Opaque key/value metadata (trace ids, actor, tenancy).
    pub metadata: JsonMap,
}

impl WorkflowEvent {
    /// Creates an event with the given id and dotted type.
    ///
    /// Remaining fields start empty; use the `with_*` constructors to fill
    /// them in.
    pub fn new(event_id: impl Into<EventId>, event_type: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            event_name: None,
            payload: JsonMap::new(),
            source: None,
            occurred_at: Utc::now(),
            metadata: JsonMap::new(),
        }
    }

    /// Sets the exact-match event name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = Some(name.into());
        self
    }

    /// Sets the payload mapping.
    pub fn with_payload(mut self, payload: JsonMap) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the event source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the occurrence timestamp.
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Sets the metadata mapping.
    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Outbox entry lifecycle status.
///
/// Entries progress through these states while the event they reference is
/// delivered to handlers:
///
/// ```text
/// pending -> claimed -> processed
///         |          -> failed -> claimed (retry)
///         |          -> dead_letter (retries exhausted)
/// ```
///
/// `processed` and `dead_letter` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for a worker, eligible once `available_at` has passed.
    Pending,

    /// A worker holds this entry. Stale claims become reclaimable after the
    /// claim TTL elapses.
    Claimed,

    /// Routed to completion. Terminal.
    Processed,

    /// Last processing attempt failed; eligible again at `available_at`.
    Failed,

    /// Retry policy exhausted. Terminal until an operator resets the entry.
    DeadLetter,
}

impl OutboxStatus {
    /// True for states that never transition again without operator action.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::DeadLetter)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Claimed => write!(f, "claimed"),
            Self::Processed => write!(f, "processed"),
            Self::Failed => write!(f, "failed"),
            Self::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

impl sqlx::Type<PgDb> for OutboxStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for OutboxStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            _ => Err(format!("invalid outbox status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for OutboxStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Persisted outbox row linking an event to its delivery state.
///
/// Created `pending` in the same transaction as the event row, then driven
/// through its lifecycle by workers claiming and processing batches.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEntry {
    /// Surrogate primary key, returned by `claim_outbox_batch`.
    pub id: i64,

    /// Event this entry delivers.
    pub event_id: EventId,

    /// Current lifecycle status.
    pub status: OutboxStatus,

    /// Total delivery attempts, incremented database-side at claim time.
    pub attempts: i32,

    /// Error message from the most recent failed attempt.
    pub last_error: Option<String>,

    /// Earliest time the entry is eligible for claiming (backoff gate).
    pub available_at: DateTime<Utc>,

    /// Token identifying the claim under which a worker holds this entry.
    ///
    /// Finalizing updates must match this token; a mismatch means the entry
    /// was reclaimed after the claim TTL expired.
    pub claim_token: Option<Uuid>,

    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,

    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// Per-handler delivery attempt status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Row created but the handler has not run yet.
    Pending,

    /// Handler invocation in progress.
    Running,

    /// Handler finished successfully. The handler is never invoked again
    /// for this idempotency key.
    Completed,

    /// Handler raised; eligible to run again on the next outbox attempt.
    Failed,

    /// Handler retries exhausted. Terminal.
    DeadLetter,
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

impl sqlx::Type<PgDb> for AttemptStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AttemptStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            _ => Err(format!("invalid attempt status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for AttemptStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Persisted record of one handler's execution for one event.
///
/// The `idempotency_key` (`event_id:registration_id`) is unique, and a
/// `completed` row suppresses any further invocation of that handler for
/// that event. This is the mechanism that keeps handler side effects
/// at-most-once across outbox retries and stale-claim reclaims.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    /// Unique key: `event_id` + `:` + `handler_registration_id`.
    pub idempotency_key: String,

    /// Event being delivered.
    pub event_id: EventId,

    /// Stable identity of the handler registration.
    pub handler_registration_id: String,

    /// Current attempt status.
    pub status: AttemptStatus,

    /// Times the handler has been invoked for this key.
    pub attempts: i32,

    /// Error message from the most recent failure.
    pub last_error: Option<String>,

    /// Full error chain from the most recent failure.
    pub last_traceback: Option<String>,

    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_round_trips_through_string() {
        let id = EventId::new("order-2041");
        assert_eq!(id.as_str(), "order-2041");
        assert_eq!(id.to_string(), "order-2041");
        assert_eq!(EventId::from("order-2041"), id);
    }

    #[test]
    fn event_builder_fills_optional_fields() {
        let mut payload = JsonMap::new();
        payload.insert("total".to_string(), serde_json::json!(125));

        let event = WorkflowEvent::new("evt-1", "order.created")
            .with_name("order_created")
            .with_source("checkout")
            .with_payload(payload.clone());

        assert_eq!(event.event_id.as_str(), "evt-1");
        assert_eq!(event.event_type, "order.created");
        assert_eq!(event.event_name.as_deref(), Some("order_created"));
        assert_eq!(event.source.as_deref(), Some("checkout"));
        assert_eq!(event.payload, payload);
        assert!(event.metadata.is_empty());
    }

    #[test]
    fn outbox_status_display_matches_stored_values() {
        assert_eq!(OutboxStatus::Pending.to_string(), "pending");
        assert_eq!(OutboxStatus::Claimed.to_string(), "claimed");
        assert_eq!(OutboxStatus::Processed.to_string(), "processed");
        assert_eq!(OutboxStatus::Failed.to_string(), "failed");
        assert_eq!(OutboxStatus::DeadLetter.to_string(), "dead_letter");
    }

    #[test]
    fn terminal_statuses_identified() {
        assert!(OutboxStatus::Processed.is_terminal());
        assert!(OutboxStatus::DeadLetter.is_terminal());
        assert!(!OutboxStatus::Pending.is_terminal());
        assert!(!OutboxStatus::Claimed.is_terminal());
        assert!(!OutboxStatus::Failed.is_terminal());
    }

    #[test]
    fn attempt_status_display_matches_stored_values() {
        assert_eq!(AttemptStatus::Running.to_string(), "running");
        assert_eq!(AttemptStatus::Completed.to_string(), "completed");
        assert_eq!(AttemptStatus::DeadLetter.to_string(), "dead_letter");
    }
}
