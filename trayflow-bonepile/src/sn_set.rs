//! Bonepile cross-reference.
//!
//! The serial set is built lazily from the last successful disposition
//! snapshot and swapped wholesale. Invalidation empties the slot; the next
//! reader rebuilds under the write lock, so no reader sees a half-built set.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use trayflow_core::{AnnotatedRow, TestRow};

// ============================================================================
// SERIAL SET
// ============================================================================

/// Serial numbers on hold or scrap, tagged with where they came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BonepileSnSet {
    serials: HashSet<String>,
    generation: u64,
    upload_id: Option<String>,
}

impl BonepileSnSet {
    pub fn new(serials: HashSet<String>, generation: u64, upload_id: Option<String>) -> Self {
        Self {
            serials,
            generation,
            upload_id,
        }
    }

    /// Generation-zero set with no upload behind it.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.serials.contains(serial.trim())
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }
}

/// Annotate rows with bonepile membership.
pub fn add_bonepile_flag(rows: &[TestRow], set: &BonepileSnSet) -> Vec<AnnotatedRow> {
    rows.iter()
        .map(|row| AnnotatedRow::new(row.clone(), set.contains(row.serial_key())))
        .collect()
}

// ============================================================================
// LOADER SEAM
// ============================================================================

/// Serials read from a disposition snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSerials {
    pub upload_id: String,
    pub serials: HashSet<String>,
}

/// Source the cross-reference rebuilds from.
pub trait SnSetLoader: Send + Sync {
    /// Serials of the last successful snapshot, or `None` before any parse.
    fn load(&self) -> Option<LoadedSerials>;
}

impl<L: SnSetLoader + ?Sized> SnSetLoader for Arc<L> {
    fn load(&self) -> Option<LoadedSerials> {
        (**self).load()
    }
}

// ============================================================================
// CROSS-REFERENCE
// ============================================================================

#[derive(Debug, Default)]
struct Slot {
    current: Option<Arc<BonepileSnSet>>,
    /// Union of every snapshot seen, used in accumulate mode.
    retained: HashSet<String>,
}

/// Lazily rebuilt, invalidatable bonepile membership.
#[derive(Debug)]
pub struct BonepileCrossRef<L> {
    loader: L,
    accumulate: bool,
    slot: RwLock<Slot>,
    generation: AtomicU64,
}

impl<L: SnSetLoader> BonepileCrossRef<L> {
    pub fn new(loader: L, accumulate: bool) -> Self {
        Self {
            loader,
            accumulate,
            slot: RwLock::new(Slot::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current set, rebuilding it if the slot is empty.
    pub fn current(&self) -> Arc<BonepileSnSet> {
        {
            let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(set) = &slot.current {
                return Arc::clone(set);
            }
        }

        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(set) = &slot.current {
            return Arc::clone(set);
        }

        let loaded = self.loader.load();
        let upload_id = loaded.as_ref().map(|l| l.upload_id.clone());
        let mut serials = loaded.map(|l| l.serials).unwrap_or_default();
        if self.accumulate {
            slot.retained.extend(serials.drain());
            serials = slot.retained.clone();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let set = Arc::new(BonepileSnSet::new(serials, generation, upload_id));
        tracing::info!(
            generation,
            serials = set.len(),
            upload_id = set.upload_id().unwrap_or("none"),
            accumulate = self.accumulate,
            "Bonepile set rebuilt"
        );
        slot.current = Some(Arc::clone(&set));
        set
    }

    pub fn is_in_bonepile(&self, serial: &str) -> bool {
        self.current().contains(serial)
    }

    /// Drop the current set. Idempotent.
    pub fn invalidate(&self) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.current.take() {
            tracing::info!(generation = old.generation(), "Bonepile set invalidated");
        }
    }

    /// Generation of the most recent rebuild (0 before the first one).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;
    use trayflow_core::Outcome;

    #[derive(Default)]
    struct FakeLoader(Mutex<Option<LoadedSerials>>);

    impl FakeLoader {
        fn set(&self, upload_id: &str, serials: &[&str]) {
            *self.0.lock().unwrap() = Some(LoadedSerials {
                upload_id: upload_id.to_string(),
                serials: serials.iter().map(|s| s.to_string()).collect(),
            });
        }
    }

    impl SnSetLoader for FakeLoader {
        fn load(&self) -> Option<LoadedSerials> {
            self.0.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_empty_before_any_snapshot() {
        let xref = BonepileCrossRef::new(FakeLoader::default(), false);
        assert!(!xref.is_in_bonepile("1812345678901"));
        assert_eq!(xref.current().upload_id(), None);
        assert_eq!(xref.generation(), 1);
    }

    #[test]
    fn test_set_is_cached_until_invalidated() {
        let loader = Arc::new(FakeLoader::default());
        loader.set("u1", &["A"]);
        let xref = BonepileCrossRef::new(Arc::clone(&loader), false);
        let first = xref.current();
        assert!(first.contains("A"));

        loader.set("u2", &["B"]);
        assert!(Arc::ptr_eq(&first, &xref.current()));
        assert!(!xref.is_in_bonepile("B"));

        xref.invalidate();
        xref.invalidate();
        let second = xref.current();
        assert!(second.contains("B"));
        assert!(!second.contains("A"));
        assert!(second.generation() > first.generation());
        assert_eq!(second.upload_id(), Some("u2"));
        // Readers holding the old Arc keep a consistent view.
        assert!(first.contains("A"));
    }

    #[test]
    fn test_accumulate_retains_earlier_serials() {
        let loader = Arc::new(FakeLoader::default());
        loader.set("u1", &["A"]);
        let xref = BonepileCrossRef::new(Arc::clone(&loader), true);
        assert!(xref.is_in_bonepile("A"));

        loader.set("u2", &["B"]);
        xref.invalidate();
        assert!(xref.is_in_bonepile("A"));
        assert!(xref.is_in_bonepile("B"));
        assert_eq!(xref.current().len(), 2);
    }

    #[test]
    fn test_add_bonepile_flag() {
        let now = Utc::now();
        let rows = vec![
            TestRow::new("A", "P", "FCT", Outcome::Fail, now),
            TestRow::new(" A ", "P", "FLA", Outcome::Pass, now),
            TestRow::new("B", "P", "FCT", Outcome::Pass, now),
        ];
        let set = BonepileSnSet::new(["A".to_string()].into_iter().collect(), 1, None);
        let annotated = add_bonepile_flag(&rows, &set);
        assert_eq!(
            annotated.iter().map(|a| a.is_bonepile).collect::<Vec<_>>(),
            vec![true, true, false]
        );
        assert_eq!(annotated[1].row.serial_number, " A ");
    }
}
