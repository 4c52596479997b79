//! Disposition result cache.
//!
//! Entries are keyed by upload identity plus request key, so a new upload can
//! never serve an old answer. Any successful re-parse still clears everything.
//! Entries scoped to a query generation are evicted once that generation is
//! superseded.

use crate::disposition::{DispositionSnItem, DispositionStats};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use trayflow_core::{Report, Timestamp};

/// Cache key: `(upload identity, request key, query generation)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub upload_id: String,
    pub request: String,
    /// Set for answers that depend on one aggregation run.
    pub query_generation: Option<u64>,
}

impl CacheKey {
    pub fn new(upload_id: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            upload_id: upload_id.into(),
            request: request.into(),
            query_generation: None,
        }
    }

    /// Key whose answer is only valid for query `generation`.
    pub fn scoped(upload_id: impl Into<String>, request: impl Into<String>, generation: u64) -> Self {
        Self {
            query_generation: Some(generation),
            ..Self::new(upload_id, request)
        }
    }

    fn is_superseded_by(&self, generation: u64) -> bool {
        self.query_generation.is_some_and(|g| g < generation)
    }
}

/// Result of a cache read, carrying hit/miss metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    cached_at: DateTime<Utc>,
    was_cache_hit: bool,
}

impl<T> CacheRead<T> {
    pub fn from_cache(value: T, cached_at: DateTime<Utc>) -> Self {
        Self {
            value,
            cached_at,
            was_cache_hit: true,
        }
    }

    pub fn from_compute(value: T) -> Self {
        Self {
            value,
            cached_at: Utc::now(),
            was_cache_hit: false,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    pub fn was_cache_miss(&self) -> bool {
        !self.was_cache_hit
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: u64,
    pub invalidations: u64,
    /// Entries dropped because their query generation was superseded.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct Entry<T> {
    value: Arc<T>,
    cached_at: Timestamp,
}

/// Precomputed disposition stats and SN lists.
#[derive(Debug, Default)]
pub struct DispositionCache {
    stats: DashMap<CacheKey, Entry<Report<DispositionStats>>>,
    sn_lists: DashMap<CacheKey, Entry<Vec<DispositionSnItem>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

impl DispositionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached stats for `key`, computing and storing them on a miss.
    pub fn stats_or_compute<F>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> CacheRead<Arc<Report<DispositionStats>>>
    where
        F: FnOnce() -> Report<DispositionStats>,
    {
        self.read_through(&self.stats, key, "stats", compute)
    }

    /// Cached SN list for `key`, computing and storing it on a miss.
    pub fn sn_list_or_compute<F>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> CacheRead<Arc<Vec<DispositionSnItem>>>
    where
        F: FnOnce() -> Vec<DispositionSnItem>,
    {
        self.read_through(&self.sn_lists, key, "sn_list", compute)
    }

    fn read_through<T, F>(
        &self,
        map: &DashMap<CacheKey, Entry<T>>,
        key: CacheKey,
        kind: &'static str,
        compute: F,
    ) -> CacheRead<Arc<T>>
    where
        F: FnOnce() -> T,
    {
        if let Some(entry) = map.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(kind, upload_id = %key.upload_id, request = %key.request, "Disposition cache hit");
            return CacheRead::from_cache(Arc::clone(&entry.value), entry.cached_at);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(kind, upload_id = %key.upload_id, request = %key.request, "Disposition cache miss");
        let read = CacheRead::from_compute(Arc::new(compute()));
        map.insert(
            key,
            Entry {
                value: Arc::clone(read.value()),
                cached_at: read.cached_at(),
            },
        );
        read
    }

    /// Drop every entry. Idempotent.
    pub fn invalidate(&self) {
        let dropped = self.stats.len() + self.sn_lists.len();
        self.stats.clear();
        self.sn_lists.clear();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(dropped, "Disposition cache invalidated");
    }

    /// Drop entries scoped to query generations older than `generation`.
    pub fn evict_superseded(&self, generation: u64) -> usize {
        let before = self.stats.len() + self.sn_lists.len();
        self.stats.retain(|key, _| !key.is_superseded_by(generation));
        self.sn_lists.retain(|key, _| !key.is_superseded_by(generation));
        let evicted = before.saturating_sub(self.stats.len() + self.sn_lists.len());
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!(evicted, generation, "Superseded disposition entries evicted");
        }
        evicted
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: (self.stats.len() + self.sn_lists.len()) as u64,
            invalidations: self.invalidations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
