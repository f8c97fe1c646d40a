//! Object map store
//!
//! Backs each object's ordered key/value map, its omap header blob, and the
//! spill-out of oversized extended attributes, all in one redb database
//! under `current/omap/`. Keys are namespaced by an injective per-object
//! prefix so one object's entries form a contiguous, range-scannable span.
//!
//! Mutations commit with eventual durability; [`DbOmap::sync`] runs a
//! durable commit and is called once per engine commit cycle, before the
//! committed sequence advances.
//!
//! The sloppy-CRC debug facility lives here too: crc32c values of written
//! blocks keyed next to the omap data, verified on reads when enabled.

use crate::index::object_file_name;
use objectfs_common::{Error, ObjectId, Result};
use redb::{Database, Durability, ReadableTable, TableDefinition};
use std::path::Path;
use tracing::debug;

// ── Table definitions ─────────────────────────────────────────────────────────

/// Omap entries: "obj\0key" → value
const OMAP: TableDefinition<&str, &[u8]> = TableDefinition::new("omap");
/// Omap headers: "obj" → blob
const HEADERS: TableDefinition<&str, &[u8]> = TableDefinition::new("omap_headers");
/// Spilled xattrs: "obj\0name" → value
const XATTRS: TableDefinition<&str, &[u8]> = TableDefinition::new("xattrs");
/// Sloppy-CRC debug entries: "obj\0block" → crc32c
const CRCS: TableDefinition<&str, u32> = TableDefinition::new("debug_crcs");
/// Store-internal bookkeeping (sync epoch)
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Block granularity of sloppy-CRC tracking
pub const CRC_BLOCK: u64 = 65536;

fn map_err(e: impl std::fmt::Display) -> Error {
    Error::omap(e.to_string())
}

fn obj_prefix(oid: &ObjectId) -> String {
    object_file_name(oid)
}

fn entry_key(prefix: &str, key: &str) -> String {
    format!("{prefix}\0{key}")
}

/// Range covering every entry of one object: `prefix\0` has no successor
/// inside the object because the prefix itself contains no NUL.
fn obj_range(prefix: &str) -> (String, String) {
    (format!("{prefix}\0"), format!("{prefix}\u{1}"))
}

/// redb-backed object map
pub struct DbOmap {
    db: Database,
    sync_epoch: std::sync::atomic::AtomicU64,
}

impl DbOmap {
    /// Open (or create) the store under `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("omap.redb")).map_err(map_err)?;
        let wtx = db.begin_write().map_err(map_err)?;
        wtx.open_table(OMAP).map_err(map_err)?;
        wtx.open_table(HEADERS).map_err(map_err)?;
        wtx.open_table(XATTRS).map_err(map_err)?;
        wtx.open_table(CRCS).map_err(map_err)?;
        wtx.open_table(META).map_err(map_err)?;
        wtx.commit().map_err(map_err)?;
        Ok(Self {
            db,
            sync_epoch: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Create-and-open probe used by mkfs
    pub fn test_init(dir: &Path) -> Result<()> {
        let _ = Self::open(dir)?;
        Ok(())
    }

    fn write_txn(&self) -> Result<redb::WriteTransaction> {
        let mut wtx = self.db.begin_write().map_err(map_err)?;
        wtx.set_durability(Durability::Eventual);
        Ok(wtx)
    }

    /// Force everything to stable storage. The epoch bump makes the commit
    /// non-empty, so it cannot be elided.
    pub fn sync(&self) -> Result<()> {
        let epoch = self
            .sync_epoch
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut wtx = self.db.begin_write().map_err(map_err)?;
        wtx.set_durability(Durability::Immediate);
        {
            let mut table = wtx.open_table(META).map_err(map_err)?;
            table.insert("sync_epoch", epoch).map_err(map_err)?;
        }
        wtx.commit().map_err(map_err)?;
        Ok(())
    }

    // ── Omap entries ──────────────────────────────────────────────────────

    pub fn set_keys(&self, oid: &ObjectId, kvs: &[(String, Vec<u8>)]) -> Result<()> {
        if kvs.is_empty() {
            return Ok(());
        }
        let prefix = obj_prefix(oid);
        let wtx = self.write_txn()?;
        {
            let mut table = wtx.open_table(OMAP).map_err(map_err)?;
            for (k, v) in kvs {
                table
                    .insert(entry_key(&prefix, k).as_str(), v.as_slice())
                    .map_err(map_err)?;
            }
        }
        wtx.commit().map_err(map_err)?;
        Ok(())
    }

    pub fn rm_keys(&self, oid: &ObjectId, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let prefix = obj_prefix(oid);
        let wtx = self.write_txn()?;
        {
            let mut table = wtx.open_table(OMAP).map_err(map_err)?;
            for k in keys {
                table
                    .remove(entry_key(&prefix, k).as_str())
                    .map_err(map_err)?;
            }
        }
        wtx.commit().map_err(map_err)?;
        Ok(())
    }

    /// Remove keys in `[first, last)`
    pub fn rm_key_range(&self, oid: &ObjectId, first: &str, last: &str) -> Result<()> {
        let prefix = obj_prefix(oid);
        let start = entry_key(&prefix, first);
        let end = entry_key(&prefix, last);
        let wtx = self.write_txn()?;
        {
            let mut table = wtx.open_table(OMAP).map_err(map_err)?;
            let doomed: Vec<String> = table
                .range(start.as_str()..end.as_str())
                .map_err(map_err)?
                .map(|r| r.map(|(k, _)| k.value().to_string()))
                .collect::<std::result::Result<_, _>>()
                .map_err(map_err)?;
            for k in doomed {
                table.remove(k.as_str()).map_err(map_err)?;
            }
        }
        wtx.commit().map_err(map_err)?;
        Ok(())
    }

    /// Remove every omap key and the header
    pub fn clear_keys_header(&self, oid: &ObjectId) -> Result<()> {
        let prefix = obj_prefix(oid);
        let (start, end) = obj_range(&prefix);
        let wtx = self.write_txn()?;
        {
            let mut table = wtx.open_table(OMAP).map_err(map_err)?;
            let doomed: Vec<String> = table
                .range(start.as_str()..end.as_str())
                .map_err(map_err)?
                .map(|r| r.map(|(k, _)| k.value().to_string()))
                .collect::<std::result::Result<_, _>>()
                .map_err(map_err)?;
            for k in doomed {
                table.remove(k.as_str()).map_err(map_err)?;
            }
            let mut headers = wtx.open_table(HEADERS).map_err(map_err)?;
            headers.remove(prefix.as_str()).map_err(map_err)?;
        }
        wtx.commit().map_err(map_err)?;
        Ok(())
    }

    pub fn get_all(&self, oid: &ObjectId) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = obj_prefix(oid);
        let (start, end) = obj_range(&prefix);
        let rtx = self.db.begin_read().map_err(map_err)?;
        let table = rtx.open_table(OMAP).map_err(map_err)?;
        let mut out = Vec::new();
        for row in table.range(start.as_str()..end.as_str()).map_err(map_err)? {
            let (k, v) = row.map_err(map_err)?;
            let user_key = k.value()[prefix.len() + 1..].to_string();
            out.push((user_key, v.value().to_vec()));
        }
        Ok(out)
    }

    pub fn get_keys(&self, oid: &ObjectId) -> Result<Vec<String>> {
        Ok(self.get_all(oid)?.into_iter().map(|(k, _)| k).collect())
    }

    pub fn get_values(
        &self,
        oid: &ObjectId,
        keys: &[String],
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = obj_prefix(oid);
        let rtx = self.db.begin_read().map_err(map_err)?;
        let table = rtx.open_table(OMAP).map_err(map_err)?;
        let mut out = Vec::new();
        for k in keys {
            if let Some(v) = table.get(entry_key(&prefix, k).as_str()).map_err(map_err)? {
                out.push((k.clone(), v.value().to_vec()));
            }
        }
        Ok(out)
    }

    pub fn set_header(&self, oid: &ObjectId, data: &[u8]) -> Result<()> {
        let prefix = obj_prefix(oid);
        let wtx = self.write_txn()?;
        {
            let mut table = wtx.open_table(HEADERS).map_err(map_err)?;
            table.insert(prefix.as_str(), data).map_err(map_err)?;
        }
        wtx.commit().map_err(map_err)?;
        Ok(())
    }

    pub fn get_header(&self, oid: &ObjectId) -> Result<Option<Vec<u8>>> {
        let prefix = obj_prefix(oid);
        let rtx = self.db.begin_read().map_err(map_err)?;
        let table = rtx.open_table(HEADERS).map_err(map_err)?;
        Ok(table
            .get(prefix.as_str())
            .map_err(map_err)?
            .map(|v| v.value().to_vec()))
    }

    // ── Spilled xattrs ────────────────────────────────────────────────────

    pub fn set_xattrs(&self, oid: &ObjectId, kvs: &[(String, Vec<u8>)]) -> Result<()> {
        if kvs.is_empty() {
            return Ok(());
        }
        let prefix = obj_prefix(oid);
        let wtx = self.write_txn()?;
        {
            let mut table = wtx.open_table(XATTRS).map_err(map_err)?;
            for (k, v) in kvs {
                table
                    .insert(entry_key(&prefix, k).as_str(), v.as_slice())
                    .map_err(map_err)?;
            }
        }
        wtx.commit().map_err(map_err)?;
        Ok(())
    }

    pub fn remove_xattrs(&self, oid: &ObjectId, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let prefix = obj_prefix(oid);
        let wtx = self.write_txn()?;
        {
            let mut table = wtx.open_table(XATTRS).map_err(map_err)?;
            for k in names {
                table
                    .remove(entry_key(&prefix, k).as_str())
                    .map_err(map_err)?;
            }
        }
        wtx.commit().map_err(map_err)?;
        Ok(())
    }

    pub fn get_xattr(&self, oid: &ObjectId, name: &str) -> Result<Option<Vec<u8>>> {
        let prefix = obj_prefix(oid);
        let rtx = self.db.begin_read().map_err(map_err)?;
        let table = rtx.open_table(XATTRS).map_err(map_err)?;
        Ok(table
            .get(entry_key(&prefix, name).as_str())
            .map_err(map_err)?
            .map(|v| v.value().to_vec()))
    }

    pub fn get_all_xattrs(&self, oid: &ObjectId) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = obj_prefix(oid);
        let (start, end) = obj_range(&prefix);
        let rtx = self.db.begin_read().map_err(map_err)?;
        let table = rtx.open_table(XATTRS).map_err(map_err)?;
        let mut out = Vec::new();
        for row in table.range(start.as_str()..end.as_str()).map_err(map_err)? {
            let (k, v) = row.map_err(map_err)?;
            out.push((
                k.value()[prefix.len() + 1..].to_string(),
                v.value().to_vec(),
            ));
        }
        Ok(out)
    }

    // ── Whole-object operations ───────────────────────────────────────────

    /// Copy omap entries, the header and spilled xattrs from `src` to `dst`,
    /// replacing anything `dst` held.
    pub fn clone_object(&self, src: &ObjectId, dst: &ObjectId) -> Result<()> {
        let entries = self.get_all(src)?;
        let header = self.get_header(src)?;
        let xattrs = self.get_all_xattrs(src)?;
        self.remove_object(dst)?;
        self.set_keys(dst, &entries)?;
        if let Some(h) = header {
            self.set_header(dst, &h)?;
        }
        self.set_xattrs(dst, &xattrs)?;
        debug!(%src, %dst, entries = entries.len(), "cloned object map");
        Ok(())
    }

    /// Drop every trace of an object (omap, header, xattrs, crc entries)
    pub fn remove_object(&self, oid: &ObjectId) -> Result<()> {
        let prefix = obj_prefix(oid);
        let (start, end) = obj_range(&prefix);
        let wtx = self.write_txn()?;
        {
            for def in [OMAP, XATTRS] {
                let mut table = wtx.open_table(def).map_err(map_err)?;
                let doomed: Vec<String> = table
                    .range(start.as_str()..end.as_str())
                    .map_err(map_err)?
                    .map(|r| r.map(|(k, _)| k.value().to_string()))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(map_err)?;
                for k in doomed {
                    table.remove(k.as_str()).map_err(map_err)?;
                }
            }
            let mut crcs = wtx.open_table(CRCS).map_err(map_err)?;
            let doomed: Vec<String> = crcs
                .range(start.as_str()..end.as_str())
                .map_err(map_err)?
                .map(|r| r.map(|(k, _)| k.value().to_string()))
                .collect::<std::result::Result<_, _>>()
                .map_err(map_err)?;
            for k in doomed {
                crcs.remove(k.as_str()).map_err(map_err)?;
            }
            let mut headers = wtx.open_table(HEADERS).map_err(map_err)?;
            headers.remove(prefix.as_str()).map_err(map_err)?;
        }
        wtx.commit().map_err(map_err)?;
        Ok(())
    }

    // ── Sloppy-CRC debug tracking ─────────────────────────────────────────

    fn crc_key(prefix: &str, block: u64) -> String {
        format!("{prefix}\0{block:016x}")
    }

    /// Record crcs for blocks fully covered by a write; blocks only partly
    /// covered are dropped (their content is no longer known here).
    pub fn crc_update_write(&self, oid: &ObjectId, offset: u64, data: &[u8]) -> Result<()> {
        let prefix = obj_prefix(oid);
        let end = offset + data.len() as u64;
        let wtx = self.write_txn()?;
        {
            let mut table = wtx.open_table(CRCS).map_err(map_err)?;
            let mut block = offset / CRC_BLOCK;
            while block * CRC_BLOCK < end {
                let b_start = block * CRC_BLOCK;
                let b_end = b_start + CRC_BLOCK;
                let key = Self::crc_key(&prefix, block);
                if b_start >= offset && b_end <= end {
                    let slice =
                        &data[(b_start - offset) as usize..(b_end - offset) as usize];
                    table
                        .insert(key.as_str(), crc32c::crc32c(slice))
                        .map_err(map_err)?;
                } else {
                    table.remove(key.as_str()).map_err(map_err)?;
                }
                block += 1;
            }
        }
        wtx.commit().map_err(map_err)?;
        Ok(())
    }

    /// Invalidate crc entries overlapping `[offset, offset+len)`
    pub fn crc_invalidate(&self, oid: &ObjectId, offset: u64, len: u64) -> Result<()> {
        let prefix = obj_prefix(oid);
        let end = offset + len;
        let wtx = self.write_txn()?;
        {
            let mut table = wtx.open_table(CRCS).map_err(map_err)?;
            let mut block = offset / CRC_BLOCK;
            while block * CRC_BLOCK < end {
                table
                    .remove(Self::crc_key(&prefix, block).as_str())
                    .map_err(map_err)?;
                block += 1;
            }
        }
        wtx.commit().map_err(map_err)?;
        Ok(())
    }

    /// Verify blocks fully covered by a read against recorded crcs
    pub fn crc_verify_read(&self, oid: &ObjectId, offset: u64, data: &[u8]) -> Result<()> {
        let prefix = obj_prefix(oid);
        let end = offset + data.len() as u64;
        let rtx = self.db.begin_read().map_err(map_err)?;
        let table = rtx.open_table(CRCS).map_err(map_err)?;
        // first block fully inside the read
        let mut block = offset.div_ceil(CRC_BLOCK);
        while (block + 1) * CRC_BLOCK <= end {
            let b_start = block * CRC_BLOCK;
            if let Some(stored) = table
                .get(Self::crc_key(&prefix, block).as_str())
                .map_err(map_err)?
            {
                let slice = &data[(b_start - offset) as usize..(b_start - offset) as usize
                    + CRC_BLOCK as usize];
                let actual = crc32c::crc32c(slice);
                let expected = stored.value();
                if actual != expected {
                    return Err(Error::ChecksumMismatch { expected, actual });
                }
            }
            block += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn oid(name: &str) -> ObjectId {
        ObjectId::new(0, 0x42, name)
    }

    fn kv(k: &str, v: &[u8]) -> (String, Vec<u8>) {
        (k.to_string(), v.to_vec())
    }

    #[test]
    fn test_set_get_rm_keys() {
        let dir = tempdir().unwrap();
        let omap = DbOmap::open(dir.path()).unwrap();
        let o = oid("a");
        omap.set_keys(&o, &[kv("k1", b"v1"), kv("k2", b"v2")]).unwrap();
        assert_eq!(
            omap.get_all(&o).unwrap(),
            vec![kv("k1", b"v1"), kv("k2", b"v2")]
        );
        omap.rm_keys(&o, &["k1".to_string()]).unwrap();
        assert_eq!(omap.get_keys(&o).unwrap(), vec!["k2".to_string()]);
    }

    #[test]
    fn test_objects_do_not_leak_into_each_other() {
        let dir = tempdir().unwrap();
        let omap = DbOmap::open(dir.path()).unwrap();
        omap.set_keys(&oid("a"), &[kv("k", b"a")]).unwrap();
        omap.set_keys(&oid("ab"), &[kv("k", b"ab")]).unwrap();
        assert_eq!(omap.get_all(&oid("a")).unwrap(), vec![kv("k", b"a")]);
        assert_eq!(omap.get_all(&oid("ab")).unwrap(), vec![kv("k", b"ab")]);
    }

    #[test]
    fn test_rm_key_range_is_half_open() {
        let dir = tempdir().unwrap();
        let omap = DbOmap::open(dir.path()).unwrap();
        let o = oid("a");
        omap.set_keys(&o, &[kv("a", b"1"), kv("b", b"2"), kv("c", b"3")])
            .unwrap();
        omap.rm_key_range(&o, "a", "c").unwrap();
        assert_eq!(omap.get_keys(&o).unwrap(), vec!["c".to_string()]);
    }

    #[test]
    fn test_header_and_clear() {
        let dir = tempdir().unwrap();
        let omap = DbOmap::open(dir.path()).unwrap();
        let o = oid("a");
        omap.set_header(&o, b"hdr").unwrap();
        omap.set_keys(&o, &[kv("k", b"v")]).unwrap();
        assert_eq!(omap.get_header(&o).unwrap().as_deref(), Some(&b"hdr"[..]));
        omap.clear_keys_header(&o).unwrap();
        assert!(omap.get_header(&o).unwrap().is_none());
        assert!(omap.get_all(&o).unwrap().is_empty());
    }

    #[test]
    fn test_clone_replaces_destination() {
        let dir = tempdir().unwrap();
        let omap = DbOmap::open(dir.path()).unwrap();
        let (a, b) = (oid("a"), oid("b"));
        omap.set_keys(&a, &[kv("k", b"v")]).unwrap();
        omap.set_header(&a, b"h").unwrap();
        omap.set_xattrs(&a, &[kv("x", b"big")]).unwrap();
        omap.set_keys(&b, &[kv("stale", b"old")]).unwrap();

        omap.clone_object(&a, &b).unwrap();
        assert_eq!(omap.get_all(&b).unwrap(), vec![kv("k", b"v")]);
        assert_eq!(omap.get_header(&b).unwrap().as_deref(), Some(&b"h"[..]));
        assert_eq!(omap.get_all_xattrs(&b).unwrap(), vec![kv("x", b"big")]);
    }

    #[test]
    fn test_crc_roundtrip_and_mismatch() {
        let dir = tempdir().unwrap();
        let omap = DbOmap::open(dir.path()).unwrap();
        let o = oid("a");
        let block = vec![7u8; CRC_BLOCK as usize];
        omap.crc_update_write(&o, 0, &block).unwrap();
        omap.crc_verify_read(&o, 0, &block).unwrap();

        let wrong = vec![8u8; CRC_BLOCK as usize];
        assert!(matches!(
            omap.crc_verify_read(&o, 0, &wrong),
            Err(Error::ChecksumMismatch { .. })
        ));

        omap.crc_invalidate(&o, 0, CRC_BLOCK).unwrap();
        omap.crc_verify_read(&o, 0, &wrong).unwrap();
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let omap = DbOmap::open(dir.path()).unwrap();
            omap.set_keys(&oid("a"), &[kv("k", b"v")]).unwrap();
            omap.sync().unwrap();
        }
        let omap = DbOmap::open(dir.path()).unwrap();
        assert_eq!(omap.get_all(&oid("a")).unwrap(), vec![kv("k", b"v")]);
    }
}
