//! Replace-wholesale holder for shared immutable results.

use std::sync::{Arc, PoisonError, RwLock};

/// An optional `Arc<T>` swapped atomically as a whole.
///
/// Readers clone the `Arc` and release the lock, so a reader keeps working on
/// the value it acquired even if a writer replaces it meanwhile.
#[derive(Debug)]
pub struct SnapshotSlot<T> {
    inner: RwLock<Option<Arc<T>>>,
}

impl<T> Default for SnapshotSlot<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }
}

impl<T> SnapshotSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store `value`, returning the shared handle now in the slot.
    pub fn set(&self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&value));
        value
    }

    pub fn take(&self) -> Option<Arc<T>> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_keep_their_snapshot() {
        let slot = SnapshotSlot::new();
        assert!(slot.is_empty());

        let first = slot.set(vec![1, 2, 3]);
        let held = slot.get().unwrap();
        slot.set(vec![4]);

        assert_eq!(*held, vec![1, 2, 3]);
        assert!(Arc::ptr_eq(&first, &held));
        assert_eq!(*slot.get().unwrap(), vec![4]);
    }

    #[test]
    fn test_take_empties_slot() {
        let slot = SnapshotSlot::new();
        slot.set("x");
        assert_eq!(slot.take().as_deref(), Some(&"x"));
        assert!(slot.take().is_none());
        assert!(slot.is_empty());
    }
}
