use std::sync::Arc;

use lru::LruCache;
use odb_types::ObjectId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::object::RawObject;

/// Bounds for the [`ObjectCache`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached objects.
    pub max_entries: usize,
    /// Maximum aggregate content bytes.
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 4096,
            max_bytes: 256 * 1024 * 1024, // 256 MiB
        }
    }
}

/// Counters exposed for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Inserts refused because the object alone exceeds the byte budget.
    pub rejected: u64,
    pub entries: usize,
    pub bytes: u64,
}

struct CacheInner {
    entries: LruCache<ObjectId, Arc<RawObject>>,
    bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejected: u64,
}

/// Bounded LRU cache of fully reconstructed objects keyed by id.
///
/// Entries are immutable and keyed by a deterministic id, so re-inserting an
/// id only refreshes its recency. The lock guards recency bookkeeping only;
/// content is cloned out after the lock is released.
pub struct ObjectCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ObjectCache {
    /// Create an empty cache with the given bounds.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                rejected: 0,
            }),
        }
    }

    /// Look up an object, refreshing its recency on a hit.
    pub fn get(&self, id: &ObjectId) -> Option<RawObject> {
        let shared = {
            let mut inner = self.inner.lock();
            match inner.entries.get(id).cloned() {
                Some(obj) => {
                    inner.hits += 1;
                    obj
                }
                None => {
                    inner.misses += 1;
                    return None;
                }
            }
        };
        Some(RawObject::clone(&shared))
    }

    /// `true` if `id` is cached. Does not touch recency or counters.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.inner.lock().entries.contains(id)
    }

    /// Insert (or refresh) an object.
    ///
    /// Fails with `ResourceExhausted` when the object alone is larger than the
    /// byte budget; the cache is left unchanged in that case.
    pub fn insert(&self, id: ObjectId, object: RawObject) -> StoreResult<()> {
        let size = object.len() as u64;
        if size > self.config.max_bytes || self.config.max_entries == 0 {
            self.inner.lock().rejected += 1;
            return Err(StoreError::ResourceExhausted {
                resource: "object cache",
                requested: size,
                limit: self.config.max_bytes,
            });
        }

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.entries.put(id, Arc::new(object)) {
            inner.bytes -= previous.len() as u64;
        }
        inner.bytes += size;

        while inner.bytes > self.config.max_bytes || inner.entries.len() > self.config.max_entries {
            match inner.entries.pop_lru() {
                Some((evicted, obj)) => {
                    inner.bytes -= obj.len() as u64;
                    inner.evictions += 1;
                    debug!(id = %evicted.short_hex(), size = obj.len(), "evicted cached object");
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Drop one entry. Returns `true` if it was cached.
    pub fn remove(&self, id: &ObjectId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.pop(id) {
            Some(obj) => {
                inner.bytes -= obj.len() as u64;
                true
            }
            None => false,
        }
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.bytes = 0;
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            rejected: inner.rejected,
            entries: inner.entries.len(),
            bytes: inner.bytes,
        }
    }

    /// The configured bounds.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odb_types::HashAlgorithm;

    fn entry(data: &[u8]) -> (ObjectId, RawObject) {
        let obj = RawObject::blob(data.to_vec());
        (obj.compute_id(HashAlgorithm::Sha1), obj)
    }

    fn cache(max_entries: usize, max_bytes: u64) -> ObjectCache {
        ObjectCache::new(CacheConfig {
            max_entries,
            max_bytes,
        })
    }

    #[test]
    fn insert_then_get() {
        let cache = ObjectCache::default();
        let (id, obj) = entry(b"cached");
        cache.insert(id, obj.clone()).unwrap();
        assert_eq!(cache.get(&id), Some(obj));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 6);
    }

    #[test]
    fn miss_is_counted() {
        let cache = ObjectCache::default();
        let (id, _) = entry(b"absent");
        assert!(cache.get(&id).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn evicts_least_recently_used_by_count() {
        let cache = cache(2, 1024);
        let (a, oa) = entry(b"a");
        let (b, ob) = entry(b"b");
        let (c, oc) = entry(b"c");
        cache.insert(a, oa).unwrap();
        cache.insert(b, ob).unwrap();
        // Touch `a` so `b` becomes the LRU entry.
        assert!(cache.get(&a).is_some());
        cache.insert(c, oc).unwrap();

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn evicts_by_bytes() {
        let cache = cache(100, 10);
        let (a, oa) = entry(b"aaaaaa");
        let (b, ob) = entry(b"bbbbbb");
        cache.insert(a, oa).unwrap();
        cache.insert(b, ob).unwrap();
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
        assert_eq!(cache.stats().bytes, 6);
    }

    #[test]
    fn reinsert_refreshes_without_double_counting() {
        let cache = cache(10, 100);
        let (a, oa) = entry(b"same");
        cache.insert(a, oa.clone()).unwrap();
        cache.insert(a, oa).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 4);
    }

    #[test]
    fn oversized_object_is_rejected() {
        let cache = cache(10, 4);
        let (a, oa) = entry(b"too large");
        let err = cache.insert(a, oa).unwrap_err();
        assert!(err.is_resource_exhausted());
        assert!(!cache.contains(&a));
        assert_eq!(cache.stats().rejected, 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn remove_and_clear() {
        let cache = ObjectCache::default();
        let (a, oa) = entry(b"a");
        let (b, ob) = entry(b"b");
        cache.insert(a, oa).unwrap();
        cache.insert(b, ob).unwrap();
        assert!(cache.remove(&a));
        assert!(!cache.remove(&a));
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn concurrent_get_and_insert() {
        use std::thread;

        let cache = Arc::new(cache(64, 1 << 20));
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..100u32 {
                        let (id, obj) = entry(&(t * 1000 + i).to_be_bytes());
                        cache.insert(id, obj.clone()).unwrap();
                        if let Some(got) = cache.get(&id) {
                            assert_eq!(got, obj);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.stats().entries <= 64);
    }
}
