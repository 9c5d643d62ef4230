//! Core domain models, routing, and registries for the Herald event system.
//!
//! Provides the immutable [`WorkflowEvent`] value, handler registration
//! descriptors, the shared routing/retry core, and the in-memory registry
//! used for development and testing. The production database-backed registry
//! lives in `herald-outbox` and builds on the same routing core.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handler;
pub mod memory;
pub mod models;
pub mod registry;
pub mod router;

pub use config::{RegistryConfig, RegistryMode};
pub use error::{RegistryError, Result};
pub use handler::{
    dead_letter_fn, handler_fn, DeadLetterHandler, EventHandler, HandlerRegistration,
};
pub use memory::MemoryRegistry;
pub use models::{
    AttemptStatus, DeliveryAttempt, EventId, JsonMap, OutboxEntry, OutboxStatus, WorkflowEvent,
};
pub use registry::{EventRegistry, RegistrySlot};
pub use router::Router;
