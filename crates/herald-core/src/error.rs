//! Error types and result handling for registry operations.
//!
//! Defines the failure taxonomy shared by both registries. Duplicate events
//! and handler failures are deliberately benign: `publish` reports them
//! through its boolean result and persisted row state rather than bubbling
//! them to the producer.

use thiserror::Error;

/// Result type alias using [`RegistryError`].
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Error type for registry and outbox operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An event with this `event_id` was already published.
    ///
    /// Raised internally from the unique constraint on the events table and
    /// swallowed by `publish`, which returns `false` instead.
    #[error("duplicate event: {0}")]
    DuplicateEvent(String),

    /// A registration's validator rejected the event.
    #[error("validation failed for registration {registration_id}: {source}")]
    Validation {
        /// Registration whose validator rejected the event.
        registration_id: String,
        /// The validator's error.
        #[source]
        source: anyhow::Error,
    },

    /// A handler raised during execution.
    #[error("handler {registration_id} failed: {source}")]
    HandlerFailed {
        /// Registration whose handler raised.
        registration_id: String,
        /// The handler's error, with its full chain preserved.
        #[source]
        source: anyhow::Error,
    },

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::DuplicateEvent(format!("unique constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl RegistryError {
    /// True for errors that indicate an already-published event.
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateEvent(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: RegistryError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn duplicate_is_identified() {
        let err = RegistryError::DuplicateEvent("evt-1".to_string());
        assert!(err.is_duplicate());
        assert!(!RegistryError::Configuration("x".to_string()).is_duplicate());
    }

    #[test]
    fn handler_failure_preserves_source_chain() {
        let inner = anyhow::anyhow!("connection reset").context("publishing invoice");
        let err = RegistryError::HandlerFailed {
            registration_id: "billing-sync".to_string(),
            source: inner,
        };
        let rendered = format!("{err}");
        assert!(rendered.contains("billing-sync"));
        assert!(rendered.contains("publishing invoice"));
    }
}
