//! Identity-to-object storage. No index knowledge lives here.

use mirador_core::Identity;
use rustc_hash::FxHashMap;

/// Base map of identity to the latest known object value.
///
/// Returned objects are clones of the stored copy; callers treat them as
/// immutable snapshots.
#[derive(Debug)]
pub struct ObjectStore<T> {
    objects: FxHashMap<Identity, T>,
}

impl<T: Clone> ObjectStore<T> {
    pub fn new() -> Self {
        Self { objects: FxHashMap::default() }
    }

    /// Insert or replace. Returns the previous value so the caller can
    /// compute index deltas.
    pub fn put(&mut self, id: Identity, obj: T) -> Option<T> {
        self.objects.insert(id, obj)
    }

    /// Remove and return the stored value. Idempotent when already absent.
    pub fn delete(&mut self, id: &Identity) -> Option<T> {
        self.objects.remove(id)
    }

    pub fn get(&self, id: &Identity) -> Option<T> {
        self.objects.get(id).cloned()
    }

    /// Snapshot of all current objects at call time.
    pub fn list(&self) -> Vec<T> {
        self.objects.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl<T: Clone> Default for ObjectStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
