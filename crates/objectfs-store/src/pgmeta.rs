//! Pgmeta write cache
//!
//! Pgmeta objects absorb a continuous stream of small omap updates; writing
//! each one straight to the kv store would dominate the commit cycle.
//! Updates carried by the dedicated pgmeta opcode are buffered here in
//! memory, merged into reads, and flushed shard by shard once per commit
//! cycle (or eagerly when a non-idempotent operation needs the kv store to
//! hold the object's full truth).

use crate::omap::DbOmap;
use objectfs_common::{ObjectId, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Sharded in-memory overlay of buffered pgmeta omap writes
pub struct PgmetaCache {
    shards: Vec<Mutex<HashMap<ObjectId, BTreeMap<String, Vec<u8>>>>>,
}

impl PgmetaCache {
    #[must_use]
    pub fn new(nshards: usize) -> Self {
        Self {
            shards: (0..nshards.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    #[must_use]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, oid: &ObjectId) -> &Mutex<HashMap<ObjectId, BTreeMap<String, Vec<u8>>>> {
        &self.shards[oid.shard(self.shards.len())]
    }

    /// Buffer a batch of sets for `oid`
    pub fn set_keys(&self, oid: &ObjectId, kvs: &[(String, Vec<u8>)]) {
        let mut shard = self.shard(oid).lock();
        let entry = shard.entry(oid.clone()).or_default();
        for (k, v) in kvs {
            entry.insert(k.clone(), v.clone());
        }
    }

    /// Drop buffered sets for keys being removed
    pub fn erase_keys(&self, oid: &ObjectId, keys: &[String]) {
        let mut shard = self.shard(oid).lock();
        if let Some(entry) = shard.get_mut(oid) {
            for k in keys {
                entry.remove(k);
            }
        }
    }

    /// Drop every buffered set for `oid` (omap clear / object removal)
    pub fn erase_object(&self, oid: &ObjectId) {
        self.shard(oid).lock().remove(oid);
    }

    /// Buffered entries for `oid`, for read-path merging
    #[must_use]
    pub fn overlay(&self, oid: &ObjectId) -> Option<BTreeMap<String, Vec<u8>>> {
        self.shard(oid).lock().get(oid).cloned()
    }

    /// Flush one object's buffered sets to the kv store
    pub fn submit_object(&self, oid: &ObjectId, omap: &DbOmap) -> Result<()> {
        let buffered = { self.shard(oid).lock().remove(oid) };
        if let Some(entries) = buffered {
            let kvs: Vec<(String, Vec<u8>)> = entries.into_iter().collect();
            trace!(%oid, keys = kvs.len(), "flushing pgmeta keys");
            omap.set_keys(oid, &kvs)?;
        }
        Ok(())
    }

    /// Flush an entire shard; called once per commit cycle
    pub fn submit_shard(&self, idx: usize, omap: &DbOmap) -> Result<()> {
        let drained: Vec<(ObjectId, BTreeMap<String, Vec<u8>>)> = {
            let mut shard = self.shards[idx].lock();
            shard.drain().collect()
        };
        for (oid, entries) in drained {
            let kvs: Vec<(String, Vec<u8>)> = entries.into_iter().collect();
            omap.set_keys(&oid, &kvs)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn oid(hash: u32) -> ObjectId {
        ObjectId::new(0, hash, "pgmeta")
    }

    fn kv(k: &str, v: &[u8]) -> (String, Vec<u8>) {
        (k.to_string(), v.to_vec())
    }

    #[test]
    fn test_overlay_reflects_sets_and_erases() {
        let cache = PgmetaCache::new(4);
        let o = oid(1);
        cache.set_keys(&o, &[kv("a", b"1"), kv("b", b"2")]);
        cache.erase_keys(&o, &["a".to_string()]);
        let overlay = cache.overlay(&o).unwrap();
        assert_eq!(overlay.len(), 1);
        assert_eq!(overlay.get("b").map(Vec::as_slice), Some(&b"2"[..]));
        cache.erase_object(&o);
        assert!(cache.overlay(&o).is_none());
    }

    #[test]
    fn test_submit_object_lands_in_kv() {
        let dir = tempdir().unwrap();
        let omap = DbOmap::open(dir.path()).unwrap();
        let cache = PgmetaCache::new(2);
        let o = oid(7);
        cache.set_keys(&o, &[kv("k", b"v")]);
        cache.submit_object(&o, &omap).unwrap();
        assert!(cache.overlay(&o).is_none());
        assert_eq!(omap.get_all(&o).unwrap(), vec![kv("k", b"v")]);
    }

    #[test]
    fn test_submit_all_shards() {
        let dir = tempdir().unwrap();
        let omap = DbOmap::open(dir.path()).unwrap();
        let cache = PgmetaCache::new(4);
        for h in 0..16u32 {
            cache.set_keys(&oid(h), &[kv("k", &h.to_le_bytes())]);
        }
        for idx in 0..cache.num_shards() {
            cache.submit_shard(idx, &omap).unwrap();
        }
        for h in 0..16u32 {
            assert_eq!(
                omap.get_all(&oid(h)).unwrap(),
                vec![kv("k", &h.to_le_bytes())]
            );
        }
    }
}
