//! Holder of the last successful disposition snapshot.

use crate::parse::DispositionParseResult;
use crate::sn_set::{LoadedSerials, SnSetLoader};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct DispositionStore {
    current: RwLock<Option<Arc<DispositionParseResult>>>,
}

impl DispositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<DispositionParseResult>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install a new snapshot, returning the one it replaced.
    pub fn replace(
        &self,
        snapshot: DispositionParseResult,
    ) -> Option<Arc<DispositionParseResult>> {
        let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(
            upload_id = %snapshot.upload_id,
            rows_applied = snapshot.rows_applied,
            error_count = snapshot.error_count,
            "Disposition snapshot installed"
        );
        slot.replace(Arc::new(snapshot))
    }
}

impl SnSetLoader for DispositionStore {
    fn load(&self) -> Option<LoadedSerials> {
        self.current().map(|snap| LoadedSerials {
            upload_id: snap.upload_id.clone(),
            serials: snap.serials().map(str::to_string).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn snapshot(upload_id: &str, serials: &[&str]) -> DispositionParseResult {
        DispositionParseResult {
            upload_id: upload_id.to_string(),
            parsed_at: Utc::now(),
            entries: Vec::new(),
            categories: serials
                .iter()
                .map(|s| (s.to_string(), "Hold".to_string()))
                .collect(),
            category_counts: BTreeMap::new(),
            rows_applied: 0,
            error_count: 0,
            sheets: Vec::new(),
            issues: Vec::new(),
            ignored_sheets: Vec::new(),
        }
    }

    #[test]
    fn test_replace_and_load() {
        let store = DispositionStore::new();
        assert!(store.load().is_none());

        assert!(store.replace(snapshot("u1", &["A"])).is_none());
        let previous = store.replace(snapshot("u2", &["B", "C"])).unwrap();
        assert_eq!(previous.upload_id, "u1");

        let loaded = store.load().unwrap();
        assert_eq!(loaded.upload_id, "u2");
        assert_eq!(loaded.serials.len(), 2);
        assert!(loaded.serials.contains("C"));
    }
}
