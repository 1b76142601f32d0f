//! Bounded LRU cache of decoded leaf directories.
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::directory::Directory;

/// The default number of leaf directories kept in memory.
pub const DEFAULT_LEAF_CACHE_CAPACITY: usize = 20;

/// A recency-ordered cache of leaf directories keyed by the tile id of the
/// directory entry pointing to them.
///
/// All operations go through a single lock. The root directory is never
/// stored here.
pub struct LeafCache {
    inner: Mutex<Inner>,
}

struct Inner {
    lru: LruCache<u64, Arc<Directory>>,
    capacity: usize,
}

impl std::fmt::Debug for LeafCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LeafCache")
            .field("len", &inner.lru.len())
            .field("capacity", &inner.capacity)
            .finish()
    }
}

impl Default for LeafCache {
    fn default() -> Self {
        Self::new(DEFAULT_LEAF_CACHE_CAPACITY)
    }
}

impl LeafCache {
    /// Create an empty cache holding at most `capacity` directories.
    /// A capacity of 0 disables caching.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                capacity,
            }),
        }
    }

    /// Get a cached directory and promote it to most recently used.
    #[must_use]
    pub fn get(&self, key: u64) -> Option<Arc<Directory>> {
        self.inner.lock().lru.get(&key).cloned()
    }

    /// Insert a directory, evicting least recently used ones beyond the capacity.
    pub fn put(&self, key: u64, dir: Arc<Directory>) {
        let mut inner = self.inner.lock();
        inner.lru.put(key, dir);
        while inner.lru.len() > inner.capacity {
            let Some((evicted, _)) = inner.lru.pop_lru() else {
                break;
            };
            trace!("leaf {evicted}: evicted");
        }
    }

    /// Whether `key` is cached, without touching the recency order.
    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        self.inner.lock().lru.contains(&key)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Change the capacity. Excess entries are evicted on the next [`LeafCache::put`].
    pub fn set_capacity(&self, capacity: usize) {
        self.inner.lock().capacity = capacity;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().lru.clear();
    }
}
