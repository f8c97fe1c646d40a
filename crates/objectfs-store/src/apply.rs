//! Transaction applier and object primitives
//!
//! Interprets the opcode stream of a transaction and calls the object-level
//! primitives. Before any mutation that is non-idempotent on replay, the
//! applier consults the replay guard for the target; clone and
//! cross-collection moves open an `in_progress` guard on the destination
//! before the physical link/copy and close it after, so a crash midway is
//! resumed exactly once.
//!
//! Error policy (applies per op): missing targets are tolerated, and
//! during replay on a non-checkpointing backend, so are already-exists and
//! range errors. Out-of-space, unexpected not-found on clone sources, and
//! anything else unexpected aborts the process after dumping the
//! transaction; an aborted process replays from the journal on restart.

use crate::fd_cache::CachedFd;
use crate::guard::{
    self, GuardCheck, GLOBAL_GUARD_XATTR, NO_SPILL_OUT, REPLAY_GUARD_XATTR, SPILL_OUT,
    SPILL_OUT_XATTR,
};
use crate::index::CollectionIndex;
use crate::sequencer::Callback;
use crate::store::{Engine, FsStore, Mounted};
use crate::transaction::{Transaction, TxOp, FADVISE_DONTNEED};
use objectfs_common::{CollectionId, Error, ObjectId, OpPosition, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::{FileExt as _, OpenOptionsExt as _};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};
use xattr::FileExt as _;

/// Inline attribute namespace on object files and collection directories
const ATTR_PREFIX: &str = "user.cephos.attr.";

/// Collection hint attribute
const HINT_ATTR: &str = "user.cephos.attr.@expected-objects";

const ENODATA: i32 = 61;

fn attr_name(name: &str) -> String {
    format!("{ATTR_PREFIX}{name}")
}

fn is_enodata(e: &Error) -> bool {
    matches!(e, Error::Io(io) if io.raw_os_error() == Some(ENODATA))
}

impl Engine {
    pub(crate) fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }

    // ── Applier ───────────────────────────────────────────────────────────

    pub(crate) fn do_transactions(
        &self,
        m: &Mounted,
        txns: &[Transaction],
        seq: u64,
        osr_id: usize,
    ) -> Result<()> {
        for (txn_idx, txn) in txns.iter().enumerate() {
            self.do_transaction(m, txn, seq, txn_idx as u32, osr_id)?;
        }
        Ok(())
    }

    fn do_transaction(
        &self,
        m: &Mounted,
        txn: &Transaction,
        seq: u64,
        txn_idx: u32,
        osr_id: usize,
    ) -> Result<()> {
        let mut spos = OpPosition::new(seq, txn_idx, 0);
        for op in txn.ops() {
            self.inject_failure();
            if let Err(e) = self.dispatch(m, txn, op, spos, osr_id) {
                if !self.tolerated(&e, op) {
                    self.fatal_apply_error(&e, txn, op, spos);
                }
                trace!(%spos, error = %e, "tolerated apply error");
            }
            spos.bump();
        }
        self.inject_failure();
        Ok(())
    }

    /// Which errors an op may shrug off, per the recovery policy
    fn tolerated(&self, e: &Error, op: &TxOp) -> bool {
        let clone_like = matches!(
            op,
            TxOp::Clone { .. } | TxOp::CloneRange { .. } | TxOp::CollectionAdd { .. }
        );
        if e.is_not_found() && !clone_like {
            return true;
        }
        if is_enodata(e) {
            return true;
        }
        if matches!(op, TxOp::SetAllocHint { .. }) {
            // advisory; EINVAL/EOPNOTSUPP from exotic filesystems
            return true;
        }
        if self.is_replaying() {
            if let Ok(mounted) = self.mounted() {
                if !mounted.backend.can_checkpoint() {
                    let create_like = matches!(
                        op,
                        TxOp::CreateCollection { .. } | TxOp::CollectionAdd { .. }
                    );
                    if e.is_already_exists() && create_like {
                        return true;
                    }
                    if e.is_not_found() {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn fatal_apply_error(&self, e: &Error, txn: &Transaction, op: &TxOp, spos: OpPosition) -> ! {
        let msg = if e.is_no_space() {
            "out of space; aborting before a partial apply spreads"
        } else if e.is_not_found() {
            "not-found on a clone source suggests a damaged namespace"
        } else if matches!(e, Error::CollectionNotEmpty(_)) {
            "non-empty collection suggests garbage in the data directory"
        } else {
            "unexpected error applying transaction"
        };
        error!(%spos, error = %e, ?op, "{msg}");
        if let Ok(dump) = serde_json::to_string(txn) {
            error!("transaction dump: {dump}");
        }
        std::process::abort();
    }

    fn dispatch(
        &self,
        m: &Mounted,
        txn: &Transaction,
        op: &TxOp,
        spos: OpPosition,
        osr_id: usize,
    ) -> Result<()> {
        match op {
            TxOp::Nop => Ok(()),
            TxOp::Touch { cid, oid } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                if self.replay_check(m, cid, oid, spos)?.should_apply() {
                    self.touch(m, cid, oid)?;
                }
                Ok(())
            }
            TxOp::Write {
                cid,
                oid,
                offset,
                data,
                flags,
            } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                if self.replay_check(m, cid, oid, spos)?.should_apply() {
                    self.write(m, cid, oid, *offset, data, *flags, osr_id)?;
                }
                Ok(())
            }
            TxOp::Zero {
                cid,
                oid,
                offset,
                len,
            } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                if self.replay_check(m, cid, oid, spos)?.should_apply() {
                    self.zero(m, cid, oid, *offset, *len, osr_id)?;
                }
                Ok(())
            }
            TxOp::Truncate { cid, oid, size } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                if self.replay_check(m, cid, oid, spos)?.should_apply() {
                    self.truncate(m, cid, oid, *size)?;
                }
                Ok(())
            }
            TxOp::Remove { cid, oid } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                if self.replay_check(m, cid, oid, spos)?.should_apply() {
                    self.remove(m, cid, oid)?;
                }
                Ok(())
            }
            TxOp::SetAttr {
                cid,
                oid,
                name,
                value,
            } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                if self.replay_check(m, cid, oid, spos)?.should_apply() {
                    self.setattrs(m, cid, oid, &[(name.clone(), value.clone())])?;
                }
                Ok(())
            }
            TxOp::SetAttrs { cid, oid, attrs } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                if self.replay_check(m, cid, oid, spos)?.should_apply() {
                    self.setattrs(m, cid, oid, attrs)?;
                }
                Ok(())
            }
            TxOp::RmAttr { cid, oid, name } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                if self.replay_check(m, cid, oid, spos)?.should_apply() {
                    self.rmattr(m, cid, oid, name)?;
                }
                Ok(())
            }
            TxOp::RmAttrs { cid, oid } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                if self.replay_check(m, cid, oid, spos)?.should_apply() {
                    self.rmattrs(m, cid, oid)?;
                }
                Ok(())
            }
            TxOp::Clone { cid, oid, dest_oid } => {
                let (cid, src, dst) = (txn.coll(*cid), txn.object(*oid), txn.object(*dest_oid));
                self.clone_object(m, cid, src, dst, spos)
            }
            TxOp::CloneRange {
                cid,
                oid,
                dest_oid,
                src_off,
                len,
                dst_off,
            } => {
                let (cid, src, dst) = (txn.coll(*cid), txn.object(*oid), txn.object(*dest_oid));
                self.clone_range(m, cid, src, dst, *src_off, *len, *dst_off, spos)
            }
            TxOp::CreateCollection { cid } => {
                let cid = txn.coll(*cid);
                if self.replay_check_coll(m, cid, spos)?.should_apply() {
                    self.create_collection(m, cid, spos)?;
                }
                Ok(())
            }
            TxOp::CollectionHint {
                cid,
                expected_objects,
                ..
            } => {
                let cid = txn.coll(*cid);
                if self.replay_check_coll(m, cid, spos)?.should_apply() {
                    let idx = m.registry.get(cid)?;
                    xattr::set(
                        idx.path(),
                        HINT_ATTR,
                        expected_objects.to_string().as_bytes(),
                    )?;
                }
                Ok(())
            }
            TxOp::RemoveCollection { cid } => {
                let cid = txn.coll(*cid);
                if self.replay_check_coll(m, cid, spos)?.should_apply() {
                    m.registry.destroy(cid)?;
                }
                Ok(())
            }
            TxOp::CollectionAdd { cid, src_cid, oid } => {
                let (dst, src, oid) = (txn.coll(*cid), txn.coll(*src_cid), txn.object(*oid));
                self.collection_add(m, dst, src, oid, spos)
            }
            TxOp::CollectionMoveRename {
                src_cid,
                src_oid,
                dest_cid,
                dest_oid,
            } => self.collection_move_rename(
                m,
                txn.coll(*src_cid),
                txn.object(*src_oid),
                txn.coll(*dest_cid),
                txn.object(*dest_oid),
                spos,
            ),
            TxOp::SplitCollection {
                cid,
                bits,
                rem,
                dest_cid,
            } => self.split_collection(m, txn.coll(*cid), *bits, *rem, txn.coll(*dest_cid), spos),
            TxOp::OmapClear { cid, oid } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                self.require_object(m, cid, oid)?;
                self.pgmeta.erase_object(oid);
                m.omap.clear_keys_header(oid)
            }
            TxOp::OmapSetKeys { cid, oid, keys } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                self.require_object(m, cid, oid)?;
                m.omap.set_keys(oid, keys)
            }
            TxOp::OmapRmKeys { cid, oid, keys } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                self.require_object(m, cid, oid)?;
                self.pgmeta.erase_keys(oid, keys);
                m.omap.rm_keys(oid, keys)
            }
            TxOp::OmapRmKeyRange {
                cid,
                oid,
                first,
                last,
            } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                self.require_object(m, cid, oid)?;
                self.pgmeta.submit_object(oid, &m.omap)?;
                m.omap.rm_key_range(oid, first, last)
            }
            TxOp::OmapSetHeader { cid, oid, data } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                self.require_object(m, cid, oid)?;
                m.omap.set_header(oid, data)
            }
            TxOp::PgmetaSetKeys { cid, oid, keys } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                self.require_object(m, cid, oid)?;
                if self.is_replaying() {
                    m.omap.set_keys(oid, keys)
                } else {
                    self.pgmeta.set_keys(oid, keys);
                    Ok(())
                }
            }
            TxOp::SetAllocHint {
                cid,
                oid,
                expected_write_size,
                ..
            } => {
                let (cid, oid) = (txn.coll(*cid), txn.object(*oid));
                if self.replay_check(m, cid, oid, spos)?.should_apply() {
                    let fd = self.lfn_open(m, cid, oid, false)?;
                    m.backend.set_alloc_hint(fd.file(), *expected_write_size)?;
                }
                Ok(())
            }
            TxOp::CollectionSetAttr { cid, name, value } => {
                let cid = txn.coll(*cid);
                if self.replay_check_coll(m, cid, spos)?.should_apply() {
                    let idx = m.registry.get(cid)?;
                    xattr::set(idx.path(), attr_name(name), value)?;
                }
                Ok(())
            }
            TxOp::CollectionRmAttr { cid, name } => {
                let cid = txn.coll(*cid);
                if self.replay_check_coll(m, cid, spos)?.should_apply() {
                    let idx = m.registry.get(cid)?;
                    xattr::remove(idx.path(), attr_name(name))?;
                }
                Ok(())
            }
        }
    }

    // ── Replay guards ─────────────────────────────────────────────────────

    fn replay_check(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        oid: &ObjectId,
        spos: OpPosition,
    ) -> Result<GuardCheck> {
        if !self.is_replaying() || m.backend.can_checkpoint() {
            return Ok(GuardCheck::Apply);
        }
        let coll_path = m.registry.coll_path(cid);
        if guard::check_path_guard(&coll_path, GLOBAL_GUARD_XATTR, spos)? == GuardCheck::Skip {
            return Ok(GuardCheck::Skip);
        }
        let Ok(fd) = self.lfn_open(m, cid, oid, false) else {
            return Ok(GuardCheck::Apply); // no file, no guard
        };
        guard::check_file_guard(fd.file(), spos)
    }

    fn replay_check_coll(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        spos: OpPosition,
    ) -> Result<GuardCheck> {
        if !self.is_replaying() || m.backend.can_checkpoint() {
            return Ok(GuardCheck::Apply);
        }
        guard::check_path_guard(&m.registry.coll_path(cid), REPLAY_GUARD_XATTR, spos)
    }

    /// Record a guard on an object file. The kv store is synced first so the
    /// guard never claims durability for omap state that is not.
    fn set_file_replay_guard(
        &self,
        m: &Mounted,
        file: &File,
        oid: &ObjectId,
        spos: OpPosition,
        in_progress: bool,
    ) -> Result<()> {
        if m.backend.can_checkpoint() {
            return Ok(());
        }
        self.inject_failure();
        self.pgmeta.submit_object(oid, &m.omap)?;
        m.omap.sync()?;
        guard::set_file_guard(file, spos, in_progress)?;
        self.inject_failure();
        Ok(())
    }

    fn close_file_replay_guard(&self, m: &Mounted, file: &File, spos: OpPosition) -> Result<()> {
        if m.backend.can_checkpoint() {
            return Ok(());
        }
        self.inject_failure();
        guard::close_file_guard(file, spos)?;
        self.inject_failure();
        Ok(())
    }

    fn set_collection_guard(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        spos: OpPosition,
        in_progress: bool,
    ) -> Result<()> {
        if m.backend.can_checkpoint() {
            return Ok(());
        }
        self.inject_failure();
        m.omap.sync()?;
        guard::set_path_guard(
            &m.registry.coll_path(cid),
            REPLAY_GUARD_XATTR,
            spos,
            in_progress,
        )?;
        self.inject_failure();
        Ok(())
    }

    fn close_collection_guard(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        spos: OpPosition,
    ) -> Result<()> {
        if m.backend.can_checkpoint() {
            return Ok(());
        }
        guard::close_path_guard(&m.registry.coll_path(cid), REPLAY_GUARD_XATTR, spos)
    }

    /// The global guard: sync the whole filesystem, then stamp the
    /// collection so no earlier position ever replays into it.
    fn set_global_guard(&self, m: &Mounted, cid: &CollectionId, spos: OpPosition) -> Result<()> {
        if m.backend.can_checkpoint() {
            return Ok(());
        }
        m.backend.syncfs()?;
        self.inject_failure();
        guard::set_path_guard(&m.registry.coll_path(cid), GLOBAL_GUARD_XATTR, spos, false)?;
        self.inject_failure();
        Ok(())
    }

    // ── File access ───────────────────────────────────────────────────────

    /// Open an object's file, optionally creating it. Fresh objects get the
    /// no-spill-out marker.
    pub(crate) fn lfn_open(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        oid: &ObjectId,
        create: bool,
    ) -> Result<Arc<CachedFd>> {
        if let Some(fd) = self.fd_cache.lookup(oid) {
            return Ok(fd);
        }
        let idx = m.registry.get(cid)?;
        if create {
            let _g = idx.lock.write();
            self.open_object(m, &idx, oid, true)
        } else {
            let _g = idx.lock.read();
            self.open_object(m, &idx, oid, false)
        }
    }

    /// Open with the index lock already held by the caller
    fn open_object(
        &self,
        _m: &Mounted,
        idx: &CollectionIndex,
        oid: &ObjectId,
        create: bool,
    ) -> Result<Arc<CachedFd>> {
        if let Some(fd) = self.fd_cache.lookup(oid) {
            return Ok(fd);
        }
        let path = idx.object_path(oid);
        let file = match File::options().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && create => {
                let f = File::options()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .mode(0o644)
                    .open(&path)?;
                f.set_xattr(SPILL_OUT_XATTR, NO_SPILL_OUT)?;
                f
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ObjectNotFound(oid.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(self.fd_cache.insert(oid, file).0)
    }

    /// Unlink an object; when the last link goes, its omap and cached state
    /// go with it.
    fn lfn_unlink(&self, m: &Mounted, cid: &CollectionId, oid: &ObjectId) -> Result<()> {
        let idx = m.registry.get(cid)?;
        let _g = idx.lock.write();
        let path = idx.object_path(oid);
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ObjectNotFound(oid.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if meta.nlink() == 1 {
            self.pgmeta.erase_object(oid);
            m.omap.remove_object(oid)?;
        }
        std::fs::remove_file(&path)?;
        self.fd_cache.clear(oid);
        Ok(())
    }

    fn require_object(&self, m: &Mounted, cid: &CollectionId, oid: &ObjectId) -> Result<()> {
        let idx = m.registry.get(cid)?;
        let _g = idx.lock.read();
        if idx.contains(oid) {
            Ok(())
        } else {
            Err(Error::ObjectNotFound(oid.to_string()))
        }
    }

    // ── Object primitives ─────────────────────────────────────────────────

    fn touch(&self, m: &Mounted, cid: &CollectionId, oid: &ObjectId) -> Result<()> {
        trace!(%cid, %oid, "touch");
        self.lfn_open(m, cid, oid, true)?;
        Ok(())
    }

    fn write(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        oid: &ObjectId,
        offset: u64,
        data: &[u8],
        flags: u32,
        osr_id: usize,
    ) -> Result<()> {
        trace!(%cid, %oid, offset, len = data.len(), "write");
        if data.is_empty() {
            return Ok(());
        }
        let fd = self.lfn_open(m, cid, oid, true)?;
        fd.file().write_all_at(data, offset)?;
        if self.config.debug.sloppy_crc {
            m.omap.crc_update_write(oid, offset, data)?;
        }
        if !self.is_replaying() {
            let nocache = flags & FADVISE_DONTNEED != 0;
            self.wbthrottle
                .queue_wb(osr_id, fd.clone(), oid, data.len() as u64, nocache);
        }
        Ok(())
    }

    fn zero(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        oid: &ObjectId,
        offset: u64,
        len: u64,
        osr_id: usize,
    ) -> Result<()> {
        trace!(%cid, %oid, offset, len, "zero");
        if len == 0 {
            return Ok(());
        }
        let fd = self.lfn_open(m, cid, oid, false)?;
        let size = fd.file().metadata()?.len();
        // hole punching keeps the file size, so only ranges already inside
        // the file qualify; everything else writes zeros like a plain write
        if offset + len <= size {
            match m.backend.punch_hole(fd.file(), offset, len) {
                Ok(()) => {
                    if self.config.debug.sloppy_crc {
                        m.omap.crc_invalidate(oid, offset, len)?;
                    }
                    return Ok(());
                }
                Err(Error::NotSupported(_)) => {
                    debug!("hole punch unsupported, writing zeros");
                }
                Err(e) => return Err(e),
            }
        }
        self.write(m, cid, oid, offset, &vec![0u8; len as usize], 0, osr_id)
    }

    fn truncate(&self, m: &Mounted, cid: &CollectionId, oid: &ObjectId, size: u64) -> Result<()> {
        trace!(%cid, %oid, size, "truncate");
        let fd = self.lfn_open(m, cid, oid, false)?;
        let old = fd.file().metadata()?.len();
        fd.file().set_len(size)?;
        if self.config.debug.sloppy_crc && old != size {
            let (lo, hi) = (old.min(size), old.max(size));
            m.omap.crc_invalidate(oid, lo, hi - lo)?;
        }
        Ok(())
    }

    fn remove(&self, m: &Mounted, cid: &CollectionId, oid: &ObjectId) -> Result<()> {
        trace!(%cid, %oid, "remove");
        self.lfn_unlink(m, cid, oid)
    }

    fn setattrs(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        oid: &ObjectId,
        attrs: &[(String, Vec<u8>)],
    ) -> Result<()> {
        trace!(%cid, %oid, count = attrs.len(), "setattrs");
        let fd = self.lfn_open(m, cid, oid, false)?;
        let file = fd.file();
        let mut spilled = self.read_spill_marker(file)?;
        let mut inline: Vec<String> = self.list_inline_attrs(file)?;

        let mut omap_set: Vec<(String, Vec<u8>)> = Vec::new();
        let mut omap_remove: Vec<String> = Vec::new();
        let max_size = self.config.xattr.max_inline_size;
        let max_count = self.config.xattr.max_inline_count;

        for (name, value) in attrs {
            let has_inline = inline.iter().any(|n| n == name);
            if value.len() > max_size {
                if has_inline {
                    file.remove_xattr(attr_name(name))?;
                    inline.retain(|n| n != name);
                }
                omap_set.push((name.clone(), value.clone()));
                continue;
            }
            if !has_inline && inline.len() >= max_count {
                omap_set.push((name.clone(), value.clone()));
                continue;
            }
            if spilled {
                // an older oversized value may be lurking in the kv store
                omap_remove.push(name.clone());
            }
            file.set_xattr(attr_name(name), value)?;
            if !has_inline {
                inline.push(name.clone());
            }
        }

        if !omap_set.is_empty() && !spilled {
            file.set_xattr(SPILL_OUT_XATTR, SPILL_OUT)?;
            spilled = true;
        }
        if spilled && !omap_remove.is_empty() {
            m.omap.remove_xattrs(oid, &omap_remove)?;
        }
        if !omap_set.is_empty() {
            m.omap.set_xattrs(oid, &omap_set)?;
        }
        Ok(())
    }

    fn rmattr(&self, m: &Mounted, cid: &CollectionId, oid: &ObjectId, name: &str) -> Result<()> {
        trace!(%cid, %oid, name, "rmattr");
        let fd = self.lfn_open(m, cid, oid, false)?;
        let spilled = self.read_spill_marker(fd.file())?;
        match fd.file().remove_xattr(attr_name(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(ENODATA) && spilled => {
                m.omap.remove_xattrs(oid, &[name.to_string()])
            }
            Err(e) => Err(e.into()),
        }
    }

    fn rmattrs(&self, m: &Mounted, cid: &CollectionId, oid: &ObjectId) -> Result<()> {
        trace!(%cid, %oid, "rmattrs");
        let fd = self.lfn_open(m, cid, oid, false)?;
        let file = fd.file();
        for name in self.list_inline_attrs(file)? {
            file.remove_xattr(attr_name(&name))?;
        }
        if self.read_spill_marker(file)? {
            let spilled: Vec<String> = m
                .omap
                .get_all_xattrs(oid)?
                .into_iter()
                .map(|(k, _)| k)
                .collect();
            m.omap.remove_xattrs(oid, &spilled)?;
        }
        file.set_xattr(SPILL_OUT_XATTR, NO_SPILL_OUT)?;
        Ok(())
    }

    fn read_spill_marker(&self, file: &File) -> Result<bool> {
        match file.get_xattr(SPILL_OUT_XATTR)? {
            Some(v) => Ok(v != NO_SPILL_OUT),
            // objects from before the marker existed may spill
            None => Ok(true),
        }
    }

    fn list_inline_attrs(&self, file: &File) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for name in file.list_xattr()? {
            if let Some(n) = name.to_string_lossy().strip_prefix(ATTR_PREFIX) {
                if !n.starts_with('@') {
                    out.push(n.to_string());
                }
            }
        }
        Ok(out)
    }

    fn clone_object(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
        spos: OpPosition,
    ) -> Result<()> {
        debug!(%cid, %src, %dst, "clone");
        if self.replay_check(m, cid, dst, spos)? == GuardCheck::Skip {
            return Ok(());
        }
        let o = self.lfn_open(m, cid, src, false)?;
        let idx = m.registry.get(cid)?;
        let n = {
            let _g = idx.lock.write();
            let n = self.open_object(m, &idx, dst, true)?;
            n.file().set_len(0)?;
            let size = o.file().metadata()?.len();
            m.backend.clone_range(o.file(), n.file(), 0, size, 0)?;
            n
        };

        // omap and header follow the data
        self.pgmeta.submit_object(src, &m.omap)?;
        m.omap.clone_object(src, dst)?;

        // attributes: spill marker first, then the inline set
        let marker = if self.read_spill_marker(o.file())? {
            SPILL_OUT
        } else {
            NO_SPILL_OUT
        };
        n.file().set_xattr(SPILL_OUT_XATTR, marker)?;
        for name in self.list_inline_attrs(o.file())? {
            if let Some(value) = o.file().get_xattr(attr_name(&name))? {
                n.file().set_xattr(attr_name(&name), &value)?;
            }
        }

        // clone is non-idempotent; record our work
        self.set_file_replay_guard(m, n.file(), dst, spos, false)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn clone_range(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
        src_off: u64,
        len: u64,
        dst_off: u64,
        spos: OpPosition,
    ) -> Result<()> {
        debug!(%cid, %src, %dst, src_off, len, dst_off, "clone_range");
        if self.replay_check(m, cid, dst, spos)? == GuardCheck::Skip {
            return Ok(());
        }
        if len == 0 {
            return Ok(());
        }
        let o = self.lfn_open(m, cid, src, false)?;
        let idx = m.registry.get(cid)?;
        let _g = idx.lock.write();
        let n = self.open_object(m, &idx, dst, true)?;
        m.backend.clone_range(o.file(), n.file(), src_off, len, dst_off)?;
        if self.config.debug.sloppy_crc {
            m.omap.crc_invalidate(dst, dst_off, len)?;
        }
        self.set_file_replay_guard(m, n.file(), dst, spos, false)?;
        Ok(())
    }

    fn create_collection(&self, m: &Mounted, cid: &CollectionId, spos: OpPosition) -> Result<()> {
        debug!(%cid, "create_collection");
        match m.registry.create(cid) {
            Ok(_) => {}
            Err(e) if e.is_already_exists() && self.is_replaying() => {
                debug!(%cid, "collection already exists during replay");
            }
            Err(e) => return Err(e),
        }
        self.set_collection_guard(m, cid, spos, false)
    }

    fn collection_add(
        &self,
        m: &Mounted,
        dst_cid: &CollectionId,
        src_cid: &CollectionId,
        oid: &ObjectId,
        spos: OpPosition,
    ) -> Result<()> {
        debug!(%dst_cid, %src_cid, %oid, "collection_add");
        let dstcmp = self.replay_check(m, dst_cid, oid, spos)?;
        if dstcmp == GuardCheck::Skip {
            return Ok(());
        }
        // the source may carry a newer guard; do not clobber it
        if self.replay_check(m, src_cid, oid, spos)? == GuardCheck::Skip {
            return Ok(());
        }
        let fd = match self.lfn_open(m, src_cid, oid, false) {
            Ok(fd) => fd,
            Err(e) if e.is_not_found() && self.is_replaying() => {
                debug!(%oid, "source gone, continuing replay");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if dstcmp == GuardCheck::Apply {
            // if the guard already says in-progress, a previous attempt set it
            self.set_file_replay_guard(m, fd.file(), oid, spos, true)?;
        }

        let r = self.link_object(m, src_cid, dst_cid, oid, oid);
        let r = match r {
            Err(ref e)
                if e.is_already_exists()
                    && self.is_replaying()
                    && !m.backend.can_checkpoint() =>
            {
                // crashed between the link and the guard close
                Ok(())
            }
            other => other,
        };
        self.inject_failure();
        r?;
        self.close_file_replay_guard(m, fd.file(), spos)
    }

    /// Hard-link an object into another collection, taking both index locks
    /// in a stable order.
    fn link_object(
        &self,
        m: &Mounted,
        src_cid: &CollectionId,
        dst_cid: &CollectionId,
        src_oid: &ObjectId,
        dst_oid: &ObjectId,
    ) -> Result<()> {
        let src_idx = m.registry.get(src_cid)?;
        let dst_idx = m.registry.get(dst_cid)?;
        let (_g1, _g2) = if src_cid <= dst_cid {
            (src_idx.lock.write(), dst_idx.lock.write())
        } else {
            (dst_idx.lock.write(), src_idx.lock.write())
        };
        std::fs::hard_link(src_idx.object_path(src_oid), dst_idx.object_path(dst_oid))?;
        Ok(())
    }

    fn collection_move_rename(
        &self,
        m: &Mounted,
        old_cid: &CollectionId,
        old_oid: &ObjectId,
        new_cid: &CollectionId,
        new_oid: &ObjectId,
        spos: OpPosition,
    ) -> Result<()> {
        debug!(%old_cid, %old_oid, %new_cid, %new_oid, "collection_move_rename");

        // a replay may find the destination collection gone again; the move
        // then reduces to removing the source
        let rm_src_only = (self.is_replaying() && !m.registry.collection_exists(new_cid))
            || self.replay_check(m, new_cid, new_oid, spos)? == GuardCheck::Skip;
        if rm_src_only {
            if self.replay_check(m, old_cid, old_oid, spos)?.should_apply() {
                match self.lfn_unlink(m, old_cid, old_oid) {
                    Ok(()) | Err(Error::ObjectNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            return Ok(());
        }
        if self.replay_check(m, old_cid, old_oid, spos)? == GuardCheck::Skip {
            return Ok(());
        }

        let dstcmp = self.replay_check(m, new_cid, new_oid, spos)?;
        let fd = match self.lfn_open(m, old_cid, old_oid, false) {
            Ok(fd) => fd,
            Err(e) if e.is_not_found() && self.is_replaying() => {
                // a previous attempt got past the unlink; dst exists and src
                // is gone, which counts as success
                debug!(%old_oid, "source gone, continuing replay");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if dstcmp == GuardCheck::Apply {
            self.set_file_replay_guard(m, fd.file(), new_oid, spos, true)?;
        }

        match self.link_object(m, old_cid, new_cid, old_oid, new_oid) {
            Ok(()) => {}
            Err(e)
                if e.is_already_exists()
                    && self.is_replaying()
                    && !m.backend.can_checkpoint() => {}
            Err(e) => return Err(e),
        }
        self.inject_failure();

        // the name changed: move the omap content with it. On a replay
        // resume an earlier attempt may have moved it already; an empty
        // source then means there is nothing left to carry over.
        self.pgmeta.submit_object(old_oid, &m.omap)?;
        let src_has_omap = !m.omap.get_all(old_oid)?.is_empty()
            || m.omap.get_header(old_oid)?.is_some()
            || !m.omap.get_all_xattrs(old_oid)?.is_empty();
        if src_has_omap || !self.is_replaying() {
            m.omap.clone_object(old_oid, new_oid)?;
        }
        if src_has_omap {
            m.omap.remove_object(old_oid)?;
        }
        self.inject_failure();

        match self.lfn_unlink(m, old_cid, old_oid) {
            Ok(()) => {}
            Err(Error::ObjectNotFound(_)) if self.is_replaying() => {}
            Err(e) => return Err(e),
        }

        let new_fd = self.lfn_open(m, new_cid, new_oid, false)?;
        self.close_file_replay_guard(m, new_fd.file(), spos)
    }

    fn split_collection(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        bits: u32,
        rem: u32,
        dest: &CollectionId,
        spos: OpPosition,
    ) -> Result<()> {
        debug!(%cid, bits, rem, %dest, "split_collection");
        for c in [cid, dest] {
            if !m.registry.collection_exists(c) {
                if self.is_replaying() {
                    debug!(%c, "collection gone, skipping replayed split");
                    return Ok(());
                }
                return Err(Error::CollectionNotFound(c.to_string()));
            }
        }
        if self.replay_check_coll(m, dest, spos)? == GuardCheck::Skip {
            return Ok(());
        }
        if self.replay_check_coll(m, cid, spos)? == GuardCheck::Skip {
            return Ok(());
        }

        self.set_global_guard(m, cid, spos)?;
        self.set_collection_guard(m, cid, spos, true)?;
        self.set_collection_guard(m, dest, spos, true)?;

        let from = m.registry.get(cid)?;
        let to = m.registry.get(dest)?;
        {
            let (_g1, _g2) = if cid <= dest {
                (from.lock.write(), to.lock.write())
            } else {
                (to.lock.write(), from.lock.write())
            };
            from.split(rem, bits, &to)?;
        }

        self.close_collection_guard(m, cid, spos)?;
        self.close_collection_guard(m, dest, spos)?;
        Ok(())
    }

    // ── Read surface ──────────────────────────────────────────────────────

    fn check_read_injection(&self, oid: &ObjectId) -> Result<()> {
        if self
            .config
            .debug
            .inject_read_eio
            .iter()
            .any(|n| n == &oid.name)
        {
            warn!(%oid, "injecting EIO on read");
            return self.read_eio(oid);
        }
        Ok(())
    }

    fn read_eio(&self, oid: &ObjectId) -> Result<()> {
        if self.config.fail_on_eio {
            error!(%oid, "EIO reading object; aborting per policy");
            std::process::abort();
        }
        Err(Error::Io(std::io::Error::from_raw_os_error(libc::EIO)))
    }

    pub(crate) fn read(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        oid: &ObjectId,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        self.check_read_injection(oid)?;
        let fd = self.lfn_open(m, cid, oid, false)?;
        let size = fd.file().metadata()?.len();
        let want = if len == 0 {
            size.saturating_sub(offset)
        } else {
            len.min(size.saturating_sub(offset))
        };
        let mut buf = vec![0u8; want as usize];
        if want > 0 {
            match fd.file().read_exact_at(&mut buf, offset) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                    self.read_eio(oid)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if self.config.debug.sloppy_crc {
            m.omap.crc_verify_read(oid, offset, &buf)?;
        }
        Ok(buf)
    }

    pub(crate) fn stat(&self, m: &Mounted, cid: &CollectionId, oid: &ObjectId) -> Result<u64> {
        self.check_read_injection(oid)?;
        let fd = self.lfn_open(m, cid, oid, false)?;
        Ok(fd.file().metadata()?.len())
    }

    pub(crate) fn exists(&self, m: &Mounted, cid: &CollectionId, oid: &ObjectId) -> bool {
        m.registry
            .get(cid)
            .map(|idx| {
                let _g = idx.lock.read();
                idx.contains(oid)
            })
            .unwrap_or(false)
    }

    pub(crate) fn getattr(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        oid: &ObjectId,
        name: &str,
    ) -> Result<Option<Vec<u8>>> {
        let fd = self.lfn_open(m, cid, oid, false)?;
        if let Some(v) = fd.file().get_xattr(attr_name(name))? {
            return Ok(Some(v));
        }
        if self.read_spill_marker(fd.file())? {
            return m.omap.get_xattr(oid, name);
        }
        Ok(None)
    }

    pub(crate) fn getattrs(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        oid: &ObjectId,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let fd = self.lfn_open(m, cid, oid, false)?;
        let mut out = BTreeMap::new();
        if self.read_spill_marker(fd.file())? {
            for (k, v) in m.omap.get_all_xattrs(oid)? {
                out.insert(k, v);
            }
        }
        // inline values win over stale spilled ones
        for name in self.list_inline_attrs(fd.file())? {
            if let Some(v) = fd.file().get_xattr(attr_name(&name))? {
                out.insert(name, v);
            }
        }
        Ok(out)
    }

    pub(crate) fn omap_get(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        oid: &ObjectId,
    ) -> Result<(Option<Vec<u8>>, BTreeMap<String, Vec<u8>>)> {
        self.require_object(m, cid, oid)?;
        let mut out: BTreeMap<String, Vec<u8>> = m.omap.get_all(oid)?.into_iter().collect();
        if let Some(overlay) = self.pgmeta.overlay(oid) {
            out.extend(overlay);
        }
        Ok((m.omap.get_header(oid)?, out))
    }

    pub(crate) fn omap_get_values(
        &self,
        m: &Mounted,
        cid: &CollectionId,
        oid: &ObjectId,
        keys: &[String],
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        self.require_object(m, cid, oid)?;
        let mut out: BTreeMap<String, Vec<u8>> =
            m.omap.get_values(oid, keys)?.into_iter().collect();
        if let Some(overlay) = self.pgmeta.overlay(oid) {
            for k in keys {
                if let Some(v) = overlay.get(k) {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(out)
    }
}

// ── Public read API ───────────────────────────────────────────────────────────

impl FsStore {
    /// Read `len` bytes at `offset` (`len == 0` reads to the end). Reads of
    /// unwritten tails return only the bytes that exist.
    pub fn read(&self, cid: &CollectionId, oid: &ObjectId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let eng = &self.engine;
        let m = eng.mounted()?;
        eng.read(&m, cid, oid, offset, len)
    }

    /// Object size in bytes
    pub fn stat(&self, cid: &CollectionId, oid: &ObjectId) -> Result<u64> {
        let eng = &self.engine;
        let m = eng.mounted()?;
        eng.stat(&m, cid, oid)
    }

    /// Does the object exist
    #[must_use]
    pub fn exists(&self, cid: &CollectionId, oid: &ObjectId) -> bool {
        let eng = &self.engine;
        match eng.mounted() {
            Ok(m) => eng.exists(&m, cid, oid),
            Err(_) => false,
        }
    }

    /// One attribute value, or `None` when absent
    pub fn getattr(&self, cid: &CollectionId, oid: &ObjectId, name: &str) -> Result<Option<Vec<u8>>> {
        let eng = &self.engine;
        let m = eng.mounted()?;
        eng.getattr(&m, cid, oid, name)
    }

    /// Every attribute of the object, inline and spilled merged
    pub fn getattrs(&self, cid: &CollectionId, oid: &ObjectId) -> Result<BTreeMap<String, Vec<u8>>> {
        let eng = &self.engine;
        let m = eng.mounted()?;
        eng.getattrs(&m, cid, oid)
    }

    /// The omap header and full key set of an object
    pub fn omap_get(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
    ) -> Result<(Option<Vec<u8>>, BTreeMap<String, Vec<u8>>)> {
        let eng = &self.engine;
        let m = eng.mounted()?;
        eng.omap_get(&m, cid, oid)
    }

    /// The omap header blob
    pub fn omap_get_header(&self, cid: &CollectionId, oid: &ObjectId) -> Result<Option<Vec<u8>>> {
        Ok(self.omap_get(cid, oid)?.0)
    }

    /// All omap keys of an object
    pub fn omap_get_keys(&self, cid: &CollectionId, oid: &ObjectId) -> Result<Vec<String>> {
        Ok(self.omap_get(cid, oid)?.1.into_keys().collect())
    }

    /// Values for specific omap keys
    pub fn omap_get_values(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        keys: &[String],
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let eng = &self.engine;
        let m = eng.mounted()?;
        eng.omap_get_values(&m, cid, oid, keys)
    }

    /// Every collection in the store, sorted
    pub fn list_collections(&self) -> Result<Vec<CollectionId>> {
        let m = self.engine.mounted()?;
        m.registry.list_collections()
    }

    /// Does the collection exist
    #[must_use]
    pub fn collection_exists(&self, cid: &CollectionId) -> bool {
        match self.engine.mounted() {
            Ok(m) => m.registry.collection_exists(cid),
            Err(_) => false,
        }
    }

    /// True when the collection holds no objects
    pub fn collection_empty(&self, cid: &CollectionId) -> Result<bool> {
        let m = self.engine.mounted()?;
        let idx = m.registry.get(cid)?;
        let _g = idx.lock.read();
        idx.is_empty()
    }

    /// All objects in a collection, in id order
    pub fn collection_list(&self, cid: &CollectionId) -> Result<Vec<ObjectId>> {
        let m = self.engine.mounted()?;
        let idx = m.registry.get(cid)?;
        let _g = idx.lock.read();
        idx.list()
    }

    /// Objects in `[start, end)`, at most `max` (0 = unbounded); returns the
    /// resume point when truncated
    pub fn collection_list_range(
        &self,
        cid: &CollectionId,
        start: Option<&ObjectId>,
        end: Option<&ObjectId>,
        max: usize,
    ) -> Result<(Vec<ObjectId>, Option<ObjectId>)> {
        let m = self.engine.mounted()?;
        let idx = m.registry.get(cid)?;
        let _g = idx.lock.read();
        idx.list_range(start, end, max)
    }

    /// One collection attribute
    pub fn collection_getattr(&self, cid: &CollectionId, name: &str) -> Result<Option<Vec<u8>>> {
        let m = self.engine.mounted()?;
        let idx = m.registry.get(cid)?;
        Ok(xattr::get(idx.path(), attr_name(name))?)
    }

}

/// Convenience: build a boxed callback from a closure
pub fn callback(f: impl FnOnce() + Send + 'static) -> Callback {
    Box::new(f)
}
