//! Collection index
//!
//! Maps object ids to file paths inside a collection directory under
//! `current/`. The file name embeds the whole id tuple
//! (`hash_pool_snap_gen_name`) with the name percent-escaped, so the mapping
//! is injective and reversible and range listings can be produced by parsing
//! and sorting directory entries.
//!
//! Every index carries a read/write lock taken around lookup/create/unlink
//! so namespace operations on one collection serialize against each other.

use objectfs_common::{CollectionId, Error, ObjectId, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Names in `current/` that can never be collections
const RESERVED: &[&str] = &["omap", "commit_op_seq", "nosnap"];

fn escape_into(s: &str, out: &mut String) {
    for b in s.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => {
                out.push(b as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{b:02X}"));
            }
        }
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    escape_into(s, &mut out);
    out
}

fn unescape(s: &str) -> Option<String> {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 3 > bytes.len() {
                return None;
            }
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Directory name for a collection
fn coll_dir_name(cid: &CollectionId) -> String {
    escape(cid.as_str())
}

/// File name for an object: `hash_pool_snap_gen_name`. Also used as the
/// object's key prefix in the omap store, so both stay injective together.
pub(crate) fn object_file_name(oid: &ObjectId) -> String {
    let mut out = String::with_capacity(64 + oid.name.len());
    out.push_str(&format!(
        "{:08x}_{:016x}_{:016x}_{:016x}_",
        oid.hash, oid.pool as u64, oid.snap, oid.generation
    ));
    escape_into(&oid.name, &mut out);
    out
}

fn parse_object_name(name: &str) -> Option<ObjectId> {
    let mut parts = name.splitn(5, '_');
    let hash = u32::from_str_radix(parts.next()?, 16).ok()?;
    let pool = u64::from_str_radix(parts.next()?, 16).ok()? as i64;
    let snap = u64::from_str_radix(parts.next()?, 16).ok()?;
    let generation = u64::from_str_radix(parts.next()?, 16).ok()?;
    let raw_name = unescape(parts.next()?)?;
    Some(ObjectId {
        pool,
        hash,
        name: raw_name,
        snap,
        generation,
    })
}

/// Index of one collection directory
pub struct CollectionIndex {
    cid: CollectionId,
    path: PathBuf,
    /// Taken for write around create/unlink/clone, for read around lookups
    pub lock: RwLock<()>,
}

impl CollectionIndex {
    #[must_use]
    pub fn cid(&self) -> &CollectionId {
        &self.cid
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path an object lives at inside this collection
    #[must_use]
    pub fn object_path(&self, oid: &ObjectId) -> PathBuf {
        self.path.join(object_file_name(oid))
    }

    /// Does the object exist here
    #[must_use]
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.object_path(oid).exists()
    }

    /// All objects in this collection, in id order
    pub fn list(&self) -> Result<Vec<ObjectId>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(oid) = parse_object_name(&name.to_string_lossy()) {
                out.push(oid);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Objects in `[start, end)` id order, at most `max` (0 = unbounded).
    /// Returns the objects and the id to resume from, if any.
    pub fn list_range(
        &self,
        start: Option<&ObjectId>,
        end: Option<&ObjectId>,
        max: usize,
    ) -> Result<(Vec<ObjectId>, Option<ObjectId>)> {
        let all = self.list()?;
        let mut out = Vec::new();
        let mut next = None;
        for oid in all {
            if let Some(s) = start {
                if oid < *s {
                    continue;
                }
            }
            if let Some(e) = end {
                if oid >= *e {
                    break;
                }
            }
            if max != 0 && out.len() == max {
                next = Some(oid);
                break;
            }
            out.push(oid);
        }
        Ok((out, next))
    }

    /// Move every object whose low `bits` of hash match `rem` into `dest`.
    /// Returns how many objects moved. Idempotent: objects already present
    /// in the destination are treated as moved.
    pub fn split(&self, rem: u32, bits: u32, dest: &CollectionIndex) -> Result<u64> {
        let mut moved = 0u64;
        for oid in self.list()? {
            if !oid.match_bits(bits, rem) {
                continue;
            }
            let from = self.object_path(&oid);
            let to = dest.object_path(&oid);
            match fs::rename(&from, &to) {
                Ok(()) => moved += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && to.exists() => {
                    moved += 1; // a previous attempt already moved it
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!(src = %self.cid, dst = %dest.cid, moved, "split collection");
        Ok(moved)
    }

    /// Per-mount cleanup: drop leftovers that do not parse as object names
    /// (interrupted writes from other tooling)
    pub fn cleanup(&self) -> Result<()> {
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                trace!(%name, "index cleanup removing temp file");
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// True when the collection holds no objects
    pub fn is_empty(&self) -> Result<bool> {
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if parse_object_name(&entry.file_name().to_string_lossy()).is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Registry of collection indexes under `current/`
pub struct IndexRegistry {
    current: PathBuf,
    indexes: Mutex<HashMap<CollectionId, Arc<CollectionIndex>>>,
}

impl IndexRegistry {
    #[must_use]
    pub fn new(current: PathBuf) -> Self {
        Self {
            current,
            indexes: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn coll_path(&self, cid: &CollectionId) -> PathBuf {
        self.current.join(coll_dir_name(cid))
    }

    #[must_use]
    pub fn collection_exists(&self, cid: &CollectionId) -> bool {
        self.coll_path(cid).is_dir()
    }

    /// Get the index for an existing collection
    pub fn get(&self, cid: &CollectionId) -> Result<Arc<CollectionIndex>> {
        let mut indexes = self.indexes.lock();
        if let Some(idx) = indexes.get(cid) {
            return Ok(idx.clone());
        }
        let path = self.coll_path(cid);
        if !path.is_dir() {
            return Err(Error::CollectionNotFound(cid.to_string()));
        }
        let idx = Arc::new(CollectionIndex {
            cid: cid.clone(),
            path,
            lock: RwLock::new(()),
        });
        indexes.insert(cid.clone(), idx.clone());
        Ok(idx)
    }

    /// Create a collection directory and return its index. Fails with
    /// already-exists when the directory is present.
    pub fn create(&self, cid: &CollectionId) -> Result<Arc<CollectionIndex>> {
        if RESERVED.contains(&cid.as_str()) {
            return Err(Error::Configuration(format!(
                "collection name {cid} is reserved"
            )));
        }
        fs::create_dir(self.coll_path(cid))?;
        self.get(cid)
    }

    /// Remove a collection directory; it must hold no objects
    pub fn destroy(&self, cid: &CollectionId) -> Result<()> {
        let idx = self.get(cid)?;
        if !idx.is_empty()? {
            return Err(Error::CollectionNotEmpty(cid.to_string()));
        }
        self.indexes.lock().remove(cid);
        fs::remove_dir_all(idx.path())?;
        Ok(())
    }

    /// Forget a cached index (after external removal)
    pub fn forget(&self, cid: &CollectionId) {
        self.indexes.lock().remove(cid);
    }

    /// Every collection under `current/`, sorted
    pub fn list_collections(&self) -> Result<Vec<CollectionId>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.current)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if RESERVED.contains(&name.as_ref()) {
                continue;
            }
            if let Some(raw) = unescape(&name) {
                out.push(CollectionId::new(raw));
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry(dir: &Path) -> IndexRegistry {
        let current = dir.join("current");
        fs::create_dir(&current).unwrap();
        IndexRegistry::new(current)
    }

    #[test]
    fn test_object_name_roundtrip() {
        let oid = ObjectId {
            pool: -3,
            hash: 0xDEAD_BEEF,
            name: "rbd_data.1/weird name%".to_string(),
            snap: 12,
            generation: objectfs_common::NO_GEN,
        };
        let parsed = parse_object_name(&object_file_name(&oid)).unwrap();
        assert_eq!(parsed, oid);
    }

    #[test]
    fn test_create_list_destroy() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let cid = CollectionId::new("pg_1.0");
        let idx = reg.create(&cid).unwrap();
        assert!(reg.collection_exists(&cid));

        let a = ObjectId::new(0, 2, "a");
        let b = ObjectId::new(0, 1, "b");
        fs::write(idx.object_path(&a), b"").unwrap();
        fs::write(idx.object_path(&b), b"").unwrap();
        let listed = idx.list().unwrap();
        assert_eq!(listed, vec![b.clone(), a.clone()]); // hash order

        assert_eq!(reg.list_collections().unwrap(), vec![cid.clone()]);

        assert!(matches!(
            reg.destroy(&cid),
            Err(Error::CollectionNotEmpty(_))
        ));
        fs::remove_file(idx.object_path(&a)).unwrap();
        fs::remove_file(idx.object_path(&b)).unwrap();
        reg.destroy(&cid).unwrap();
        assert!(!reg.collection_exists(&cid));
    }

    #[test]
    fn test_reserved_names_rejected() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        assert!(reg.create(&CollectionId::new("omap")).is_err());
    }

    #[test]
    fn test_list_range_pagination() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let cid = CollectionId::new("c");
        let idx = reg.create(&cid).unwrap();
        for h in 0..5u32 {
            let oid = ObjectId::new(0, h, format!("o{h}"));
            fs::write(idx.object_path(&oid), b"").unwrap();
        }
        let (first, next) = idx.list_range(None, None, 2).unwrap();
        assert_eq!(first.len(), 2);
        let next = next.unwrap();
        assert_eq!(next.hash, 2);
        let (rest, none) = idx.list_range(Some(&next), None, 0).unwrap();
        assert_eq!(rest.len(), 3);
        assert!(none.is_none());
    }

    #[test]
    fn test_split_moves_matching_hashes() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let src = reg.create(&CollectionId::new("src")).unwrap();
        let dst = reg.create(&CollectionId::new("dst")).unwrap();
        for h in 0..8u32 {
            let oid = ObjectId::new(0, h, format!("o{h}"));
            fs::write(src.object_path(&oid), b"").unwrap();
        }
        let moved = src.split(1, 2, &dst).unwrap();
        assert_eq!(moved, 2); // hashes 1 and 5
        for oid in src.list().unwrap() {
            assert!(oid.hash & 3 != 1);
        }
        for oid in dst.list().unwrap() {
            assert!(oid.hash & 3 == 1);
        }
    }
}
