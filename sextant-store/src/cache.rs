//! Bounded read cache in front of the value store
//!
//! Size is measured in entries, not bytes. The cache is a pure latency
//! optimization: every write invalidates the affected key, and correctness
//! never depends on the cache being present (the engine behaves identically
//! with caching disabled).

use lru::LruCache;
use parking_lot::Mutex;
use sextant_core::Value;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Entry-count-bounded LRU of (key → value list).
#[derive(Debug)]
pub struct ResultCache {
    inner: Mutex<LruCache<Vec<u8>, Vec<Value>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    /// Create a cache holding up to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is nonzero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached values for a key, if present.
    pub fn get(&self, key: &[u8]) -> Option<Vec<Value>> {
        let result = self.inner.lock().get(key).cloned();
        match result {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Fill the cache after a store read.
    pub fn insert(&self, key: Vec<u8>, values: Vec<Value>) {
        self.inner.lock().put(key, values);
    }

    /// Drop the entry for a key. Called on every put/remove touching it.
    pub fn invalidate(&self, key: &[u8]) {
        self.inner.lock().pop(key);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) counters since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
