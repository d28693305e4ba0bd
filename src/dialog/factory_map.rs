//! Concurrent registry of dialog handler factories.
//!
//! Maps dialog types to the factories that build their handlers, and
//! separately remembers every type that was ever registered. The
//! distinction is load-bearing for dispatch: a type that was never
//! registered signals a protocol bug or version mismatch, while a type
//! that was registered once but has since been deregistered is a benign
//! race with service shutdown.
//!
//! Registration and dispatch run on different threads with no external
//! locking; both maps are concurrent structures. When several threads
//! `put`/`remove` the same type concurrently, the last writer wins -
//! in-flight `get` calls observe either the old or the new factory,
//! never a torn state.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use super::factory::ResponderDialogFactory;

/// Dispatch classification for an inbound dialog type.
pub enum DialogDispatch<S> {
    /// Type is registered; dispatch through this factory.
    Active(Arc<dyn ResponderDialogFactory<S>>),
    /// Type was registered once but is currently deregistered.
    Inactive,
    /// Type was never registered.
    Unknown,
}

/// Concurrent map from dialog type to handler factory.
pub struct DialogFactoryMap<S> {
    /// Currently dispatchable factories.
    active: DashMap<u16, Arc<dyn ResponderDialogFactory<S>>>,
    /// Every type ever registered; grows monotonically.
    known: DashSet<u16>,
}

impl<S> DialogFactoryMap<S> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            active: DashMap::new(),
            known: DashSet::new(),
        }
    }

    /// Register or overwrite the factory for a dialog type.
    ///
    /// Returns the previously active factory, if any. The type joins
    /// the known set permanently.
    pub fn put(
        &self,
        dialog_type: u16,
        factory: Arc<dyn ResponderDialogFactory<S>>,
    ) -> Option<Arc<dyn ResponderDialogFactory<S>>> {
        // Known before active: a concurrent get must never see a type
        // as active but unknown.
        self.known.insert(dialog_type);
        self.active.insert(dialog_type, factory)
    }

    /// Get the active factory for a dialog type.
    pub fn get(&self, dialog_type: u16) -> Option<Arc<dyn ResponderDialogFactory<S>>> {
        self.active.get(&dialog_type).map(|e| e.value().clone())
    }

    /// Deregister a dialog type (e.g. on service shutdown).
    ///
    /// The type stays in the known set.
    pub fn remove(&self, dialog_type: u16) -> Option<Arc<dyn ResponderDialogFactory<S>>> {
        self.active.remove(&dialog_type).map(|(_, f)| f)
    }

    /// Whether this type was ever registered.
    pub fn is_known(&self, dialog_type: u16) -> bool {
        self.known.contains(&dialog_type)
    }

    /// Whether this type is currently dispatchable.
    pub fn is_active(&self, dialog_type: u16) -> bool {
        self.active.contains_key(&dialog_type)
    }

    /// Classify an inbound dialog type for dispatch.
    pub fn classify(&self, dialog_type: u16) -> DialogDispatch<S> {
        if let Some(factory) = self.get(dialog_type) {
            return DialogDispatch::Active(factory);
        }
        if self.is_known(dialog_type) {
            return DialogDispatch::Inactive;
        }
        DialogDispatch::Unknown
    }

    /// Snapshot of the active factories.
    pub fn active_factories(&self) -> Vec<Arc<dyn ResponderDialogFactory<S>>> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    /// Snapshot of the active dialog types.
    pub fn active_dialog_types(&self) -> Vec<u16> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    /// Whether any dialog type is still active (shutdown-gate query).
    pub fn has_active_dialog_types(&self) -> bool {
        !self.active.is_empty()
    }

    /// Render the active types for logs, e.g. `[1,2,3]`.
    ///
    /// Sorted for stable log output; not parsed by anything.
    pub fn describe_active_dialog_types(&self) -> String {
        let mut types = self.active_dialog_types();
        types.sort_unstable();
        let joined = types
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("[{joined}]")
    }
}

impl<S> Default for DialogFactoryMap<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> std::fmt::Debug for DialogFactoryMap<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogFactoryMap")
            .field("active", &self.describe_active_dialog_types())
            .field("known", &self.known.len())
            .finish()
    }
}
