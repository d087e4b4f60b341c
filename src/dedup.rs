use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;

pub const DEFAULT_DEDUP_CAPACITY: usize = 1_000;

/// Bounded set of already-processed record keys.
///
/// Eviction is insertion-ordered: membership checks use `contains`, which
/// never promotes, and re-adding a present key is a no-op, so the LRU order
/// is exactly the order of first insertion.
#[derive(Debug)]
pub struct DedupCache {
    seen: Mutex<LruCache<String, ()>>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn has(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    pub fn add(&self, id: impl Into<String>) {
        let id = id.into();
        let mut seen = self.lock();
        if !seen.contains(&id) {
            seen.push(id, ());
        }
    }

    /// Adds `id` and reports whether it was new. Check and insert happen
    /// under one lock, so two tickers racing on the same id see one `true`.
    pub fn insert_if_new(&self, id: impl Into<String>) -> bool {
        let id = id.into();
        let mut seen = self.lock();
        if seen.contains(&id) {
            return false;
        }
        seen.push(id, ());
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, ()>> {
        // The guarded set has no invariants a panicking writer could break.
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
