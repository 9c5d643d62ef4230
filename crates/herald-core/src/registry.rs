//! Registry trait and explicit lifecycle management.
//!
//! Applications depend on [`EventRegistry`] rather than a concrete
//! implementation, and own a [`RegistrySlot`] constructed at startup instead
//! of a process-wide mutable global. Replacing or tearing down the active
//! registry is an explicit operation on the slot.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::{
    error::{RegistryError, Result},
    handler::HandlerRegistration,
    models::WorkflowEvent,
};

/// Common surface of every registry implementation.
#[async_trait]
pub trait EventRegistry: Send + Sync {
    /// Appends a handler registration.
    fn register(&self, registration: HandlerRegistration);

    /// Publishes an event for reliable handling.
    ///
    /// Returns `false` for duplicates, deferred (async-mode) publishes, and
    /// events no registration completed; duplicate ids and handler failures
    /// never surface as errors.
    async fn publish(&self, event: WorkflowEvent) -> Result<bool>;

    /// Routes the event synchronously, bypassing persistence and deferral.
    async fn publish_sync(&self, event: WorkflowEvent) -> Result<bool>;
}

/// Holder for the application's active registry.
///
/// The slot is a plain value: construct it at startup, `install` the
/// registry built from configuration, hand clones of the `Arc` to whoever
/// needs to publish, and `clear` at shutdown. Tests build their own slots.
pub struct RegistrySlot {
    inner: RwLock<Option<Arc<dyn EventRegistry>>>,
}

impl RegistrySlot {
    /// Creates an empty slot.
    pub fn empty() -> Self {
        Self { inner: RwLock::new(None) }
    }

    /// Installs a registry into an empty slot.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a registry is already installed;
    /// use [`RegistrySlot::replace`] to swap deliberately.
    pub fn install(&self, registry: Arc<dyn EventRegistry>) -> Result<()> {
        let mut slot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(RegistryError::Configuration(
                "registry already installed; use replace to swap".to_string(),
            ));
        }
        *slot = Some(registry);
        Ok(())
    }

    /// Swaps the active registry, returning the previous one if any.
    pub fn replace(&self, registry: Arc<dyn EventRegistry>) -> Option<Arc<dyn EventRegistry>> {
        let mut slot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        slot.replace(registry)
    }

    /// Returns the active registry.
    pub fn current(&self) -> Option<Arc<dyn EventRegistry>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Removes and returns the active registry.
    pub fn clear(&self) -> Option<Arc<dyn EventRegistry>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl Default for RegistrySlot {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegistry;

    #[test]
    fn install_rejects_second_registry() {
        let slot = RegistrySlot::empty();
        assert!(slot.current().is_none());

        slot.install(Arc::new(MemoryRegistry::new())).expect("first install succeeds");
        assert!(slot.current().is_some());

        let err = slot.install(Arc::new(MemoryRegistry::new())).unwrap_err();
        assert!(matches!(err, RegistryError::Configuration(_)));
    }

    #[test]
    fn replace_returns_previous_registry() {
        let slot = RegistrySlot::empty();
        assert!(slot.replace(Arc::new(MemoryRegistry::new())).is_none());
        assert!(slot.replace(Arc::new(MemoryRegistry::new())).is_some());
    }

    #[test]
    fn clear_empties_the_slot() {
        let slot = RegistrySlot::empty();
        slot.install(Arc::new(MemoryRegistry::new())).expect("install succeeds");
        assert!(slot.clear().is_some());
        assert!(slot.current().is_none());
        assert!(slot.clear().is_none());
    }
}
