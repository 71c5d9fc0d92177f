//! In-memory LRU deduplication front for the audit store.
//!
//! The LRU short-circuits obvious duplicates without touching the store.
//! Absence from the LRU is not authoritative: the audit store's unique
//! insert remains the exactly-once gate.

use lru::LruCache;
use parking_lot::Mutex;
use sluice_core::event::DedupKey;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default LRU capacity (~10k recent keys)
pub const DEFAULT_LRU_CAPACITY: usize = 10_000;

/// Deduplication counters for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupStats {
    /// Total keys checked
    pub total_checked:      u64,
    /// Checks answered from the LRU (duplicates skipped)
    pub duplicates_skipped: u64,
}

impl DedupStats {
    /// LRU hit rate in `[0.0, 1.0]`.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        if self.total_checked == 0 {
            0.0
        } else {
            self.duplicates_skipped as f64 / self.total_checked as f64
        }
    }
}

/// LRU-backed duplicate short-circuit
pub struct Deduplicator {
    lru:     Mutex<LruCache<String, ()>>,
    checked: AtomicU64,
    hits:    AtomicU64,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_LRU_CAPACITY)
    }
}

impl Deduplicator {
    /// Create a deduplicator with the given LRU capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            lru:     Mutex::new(LruCache::new(capacity)),
            checked: AtomicU64::new(0),
            hits:    AtomicU64::new(0),
        }
    }

    /// Whether the key was seen recently. A `true` answer is reliable; a
    /// `false` answer only means the store must be consulted.
    pub fn seen_recently(&self, key: &DedupKey) -> bool {
        self.checked.fetch_add(1, Ordering::Relaxed);
        let hit = self.lru.lock().get(&key.cache_key()).is_some();
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Record a key after the store accepted (or reported a duplicate of)
    /// the event.
    pub fn remember(&self, key: &DedupKey) {
        self.lru.lock().put(key.cache_key(), ());
    }

    /// Current counters.
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            total_checked:      self.checked.load(Ordering::Relaxed),
            duplicates_skipped: self.hits.load(Ordering::Relaxed),
        }
    }
}
