//! Per-bus handler registries.
//!
//! Each bus instance owns its registry; there is no process-wide state.

use crate::envelope::{validate_name, EnvelopeKind};
use crate::error::BusError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Maps a name to exactly one handler (commands, queries).
pub struct HandlerRegistry<H: ?Sized> {
    kind: EnvelopeKind,
    handlers: DashMap<String, Arc<H>>,
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub fn new(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            handlers: DashMap::new(),
        }
    }

    /// Register the handler for `name`.
    ///
    /// A second registration for the same name is rejected with
    /// [`BusError::DuplicateHandler`]; the first handler stays in place.
    pub fn register(&self, name: &str, handler: Arc<H>) -> Result<(), BusError> {
        validate_name(name)?;
        match self.handlers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(BusError::DuplicateHandler {
                kind: self.kind,
                name: name.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    /// Look up the handler for `name`.
    pub fn get(&self, name: &str) -> Result<Arc<H>, BusError> {
        self.handlers
            .get(name)
            .map(|handler| Arc::clone(handler.value()))
            .ok_or_else(|| BusError::HandlerNotFound {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    /// Remove the handler for `name`, returning it if present.
    pub fn remove(&self, name: &str) -> Option<Arc<H>> {
        self.handlers.remove(name).map(|(_, handler)| handler)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered names, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }
}

/// Maps a name to an ordered list of handlers (events).
///
/// Registration is additive: the same handler registered twice runs twice.
pub struct HandlerList<H: ?Sized> {
    handlers: DashMap<String, Vec<Arc<H>>>,
}

impl<H: ?Sized> HandlerList<H> {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Append a handler for `name` and return how many are now registered.
    pub fn append(&self, name: &str, handler: Arc<H>) -> Result<usize, BusError> {
        validate_name(name)?;
        let mut entry = self.handlers.entry(name.to_string()).or_default();
        entry.push(handler);
        Ok(entry.len())
    }

    /// Copy of the handlers for `name`, in registration order.
    ///
    /// The map lock is released before the caller runs anything.
    pub fn snapshot(&self, name: &str) -> Vec<Arc<H>> {
        self.handlers
            .get(name)
            .map(|handlers| handlers.value().clone())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers.get(name).map(|h| h.len()).unwrap_or(0)
    }

    /// Drop every handler for `name`.
    pub fn remove(&self, name: &str) -> usize {
        self.handlers.remove(name).map(|(_, h)| h.len()).unwrap_or(0)
    }

    /// Drop one registration of `handler` for `name`, leaving the others.
    pub fn remove_handler(&self, name: &str, handler: &Arc<H>) -> bool {
        let removed = match self.handlers.get_mut(name) {
            Some(mut handlers) => match handlers.iter().position(|h| Arc::ptr_eq(h, handler)) {
                Some(index) => {
                    handlers.remove(index);
                    true
                }
                None => false,
            },
            None => false,
        };
        self.handlers.remove_if(name, |_, handlers| handlers.is_empty());
        removed
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl<H: ?Sized> Default for HandlerList<H> {
    fn default() -> Self {
        Self::new()
    }
}
