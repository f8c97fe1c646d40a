//! Shared cache of open object file handles
//!
//! Sharded by object hash; each shard is a small LRU guarded by its own
//! mutex. The cache holds the sole owning handle; callers receive
//! `Arc<CachedFd>` borrows, so an evicted descriptor closes exactly once:
//! when the cache entry and every outstanding borrow are gone.

use objectfs_common::ObjectId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An open object file owned by the cache
pub struct CachedFd {
    file: File,
}

impl CachedFd {
    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct FdCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

struct Shard {
    map: HashMap<ObjectId, Arc<CachedFd>>,
    /// Least-recently-used order, front is coldest
    order: VecDeque<ObjectId>,
}

impl Shard {
    fn touch(&mut self, oid: &ObjectId) {
        if let Some(pos) = self.order.iter().position(|o| o == oid) {
            self.order.remove(pos);
        }
        self.order.push_back(oid.clone());
    }
}

/// Sharded LRU of open file handles keyed by object id
pub struct FdCache {
    shards: Vec<Mutex<Shard>>,
    per_shard: usize,
    stats: FdCacheStats,
}

impl FdCache {
    /// `size` is the total capacity across all shards
    #[must_use]
    pub fn new(shards: usize, size: usize) -> Self {
        let shards = shards.max(1);
        let per_shard = (size / shards).max(1);
        Self {
            shards: (0..shards)
                .map(|_| {
                    Mutex::new(Shard {
                        map: HashMap::new(),
                        order: VecDeque::new(),
                    })
                })
                .collect(),
            per_shard,
            stats: FdCacheStats::default(),
        }
    }

    fn shard(&self, oid: &ObjectId) -> &Mutex<Shard> {
        &self.shards[oid.shard(self.shards.len())]
    }

    /// Look up a cached handle
    pub fn lookup(&self, oid: &ObjectId) -> Option<Arc<CachedFd>> {
        let mut shard = self.shard(oid).lock();
        match shard.map.get(oid).cloned() {
            Some(fd) => {
                shard.touch(oid);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(fd)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert an open file, returning the cached handle. If another thread
    /// won the race the existing handle is returned and `existed` is true;
    /// the caller's file closes on drop.
    pub fn insert(&self, oid: &ObjectId, file: File) -> (Arc<CachedFd>, bool) {
        let mut shard = self.shard(oid).lock();
        if let Some(existing) = shard.map.get(oid).cloned() {
            shard.touch(oid);
            return (existing, true);
        }
        let fd = Arc::new(CachedFd { file });
        shard.map.insert(oid.clone(), fd.clone());
        shard.order.push_back(oid.clone());
        while shard.map.len() > self.per_shard {
            if let Some(cold) = shard.order.pop_front() {
                shard.map.remove(&cold);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        (fd, false)
    }

    /// Drop the cached handle for `oid`; subsequent lookups miss. Used after
    /// unlink so a recreated object gets a fresh descriptor.
    pub fn clear(&self, oid: &ObjectId) {
        let mut shard = self.shard(oid).lock();
        if shard.map.remove(oid).is_some() {
            if let Some(pos) = shard.order.iter().position(|o| o == oid) {
                shard.order.remove(pos);
            }
        }
    }

    /// Drop every cached handle
    pub fn clear_all(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.map.clear();
            shard.order.clear();
        }
    }

    #[must_use]
    pub fn stats(&self) -> &FdCacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_tmp(dir: &std::path::Path, name: &str) -> File {
        File::create(dir.join(name)).unwrap()
    }

    #[test]
    fn test_lookup_miss_then_hit() {
        let dir = tempdir().unwrap();
        let cache = FdCache::new(4, 16);
        let oid = ObjectId::new(0, 1, "a");
        assert!(cache.lookup(&oid).is_none());
        cache.insert(&oid, open_tmp(dir.path(), "a"));
        assert!(cache.lookup(&oid).is_some());
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_insert_race_returns_existing() {
        let dir = tempdir().unwrap();
        let cache = FdCache::new(1, 4);
        let oid = ObjectId::new(0, 1, "a");
        let (first, existed) = cache.insert(&oid, open_tmp(dir.path(), "a1"));
        assert!(!existed);
        let (second, existed) = cache.insert(&oid, open_tmp(dir.path(), "a2"));
        assert!(existed);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_eviction_is_lru() {
        let dir = tempdir().unwrap();
        let cache = FdCache::new(1, 2);
        let a = ObjectId::new(0, 1, "a");
        let b = ObjectId::new(0, 2, "b");
        let c = ObjectId::new(0, 3, "c");
        cache.insert(&a, open_tmp(dir.path(), "a"));
        cache.insert(&b, open_tmp(dir.path(), "b"));
        cache.lookup(&a); // b is now coldest
        cache.insert(&c, open_tmp(dir.path(), "c"));
        assert!(cache.lookup(&a).is_some());
        assert!(cache.lookup(&b).is_none());
        assert!(cache.lookup(&c).is_some());
    }

    #[test]
    fn test_borrow_outlives_eviction() {
        let dir = tempdir().unwrap();
        let cache = FdCache::new(1, 1);
        let a = ObjectId::new(0, 1, "a");
        let b = ObjectId::new(0, 2, "b");
        let (held, _) = cache.insert(&a, open_tmp(dir.path(), "a"));
        cache.insert(&b, open_tmp(dir.path(), "b")); // evicts a
        assert!(cache.lookup(&a).is_none());
        // the borrowed handle is still usable
        assert!(held.file().metadata().is_ok());
    }
}
