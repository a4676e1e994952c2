//! Known-unique fingerprint index for incremental exact matching.
//!
//! Once a fingerprint has been seen on exactly one record, later runs can skip
//! that record as long as its content is unchanged. A new record with the same
//! fingerprint is never skipped, because its id differs from the stored one.

use crate::models::MemoryId;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::RwLock;

/// Default capacity of [`LruKnownUniqueIndex`].
pub const DEFAULT_KNOWN_UNIQUE_CAPACITY: usize = 100_000;

/// Fingerprint → record index shared across runs.
pub trait KnownUniqueIndex: Send + Sync {
    /// Returns the record a fingerprint is known to be unique to.
    fn lookup(&self, fingerprint: &str) -> Option<MemoryId>;

    /// Records that `fingerprint` is currently held by `record_id` alone.
    fn mark_unique(&self, fingerprint: &str, record_id: &MemoryId);

    /// Drops a fingerprint, e.g. once it is part of a duplicate group.
    fn forget(&self, fingerprint: &str);

    /// Returns true if `record_id` can be skipped for `fingerprint`.
    fn is_known_unique(&self, fingerprint: &str, record_id: &MemoryId) -> bool {
        self.lookup(fingerprint).is_some_and(|id| &id == record_id)
    }
}

/// Bounded LRU implementation of [`KnownUniqueIndex`].
///
/// # Lock Poisoning
///
/// Poisoned locks fail open: lookups miss and writes are skipped. A miss only
/// costs a redundant comparison, never a wrong merge.
pub struct LruKnownUniqueIndex {
    cache: RwLock<LruCache<String, MemoryId>>,
}

impl LruKnownUniqueIndex {
    /// Creates an index holding at most `capacity` fingerprints (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(cap)),
        }
    }

    /// Number of fingerprints held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Returns true if the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LruKnownUniqueIndex {
    fn default() -> Self {
        Self::new(DEFAULT_KNOWN_UNIQUE_CAPACITY)
    }
}

impl KnownUniqueIndex for LruKnownUniqueIndex {
    fn lookup(&self, fingerprint: &str) -> Option<MemoryId> {
        let cache = self.cache.read().ok()?;
        cache.peek(fingerprint).cloned()
    }

    #[allow(clippy::cast_precision_loss)]
    fn mark_unique(&self, fingerprint: &str, record_id: &MemoryId) {
        if let Ok(mut cache) = self.cache.write() {
            cache.put(fingerprint.to_string(), record_id.clone());
            metrics::gauge!("dedup_known_unique_size").set(cache.len() as f64);
        }
    }

    fn forget(&self, fingerprint: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.pop(fingerprint);
        }
    }
}
