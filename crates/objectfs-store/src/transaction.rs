//! Transactions
//!
//! A transaction is an ordered list of typed operations. Collections and
//! objects are interned into per-transaction tables and referenced by small
//! indices, which keeps repeated ids off the wire. The binary codec is the
//! journal's payload format; the `serde` derive exists for the JSON
//! transaction dump.
//!
//! Each opcode declares whether it is safe to apply in parallel with
//! journaling (`parallel_safe`): object-local data mutations that are
//! idempotent under guarded replay and create no namespace entry beyond
//! their own target file. A batch may apply before its journal entry is
//! durable only if every opcode in it is parallel-safe; anything else makes
//! the whole batch write-ahead.

use objectfs_common::{CollectionId, Decoder, Encoder, Error, ObjectId, Result};
use serde::Serialize;

/// Advise the page cache that written data will not be reread soon
pub const FADVISE_DONTNEED: u32 = 1;

/// One operation inside a transaction. `cid`/`oid` fields are indices into
/// the transaction's collection and object tables.
#[derive(Debug, Clone, Serialize)]
pub enum TxOp {
    Nop,
    Touch { cid: u32, oid: u32 },
    Write { cid: u32, oid: u32, offset: u64, #[serde(skip)] data: Vec<u8>, flags: u32 },
    Zero { cid: u32, oid: u32, offset: u64, len: u64 },
    Truncate { cid: u32, oid: u32, size: u64 },
    Remove { cid: u32, oid: u32 },
    SetAttr { cid: u32, oid: u32, name: String, #[serde(skip)] value: Vec<u8> },
    SetAttrs { cid: u32, oid: u32, #[serde(skip)] attrs: Vec<(String, Vec<u8>)> },
    RmAttr { cid: u32, oid: u32, name: String },
    RmAttrs { cid: u32, oid: u32 },
    Clone { cid: u32, oid: u32, dest_oid: u32 },
    CloneRange { cid: u32, oid: u32, dest_oid: u32, src_off: u64, len: u64, dst_off: u64 },
    CreateCollection { cid: u32 },
    CollectionHint { cid: u32, pg_num: u32, expected_objects: u64 },
    RemoveCollection { cid: u32 },
    CollectionAdd { cid: u32, src_cid: u32, oid: u32 },
    CollectionMoveRename { src_cid: u32, src_oid: u32, dest_cid: u32, dest_oid: u32 },
    SplitCollection { cid: u32, bits: u32, rem: u32, dest_cid: u32 },
    OmapClear { cid: u32, oid: u32 },
    OmapSetKeys { cid: u32, oid: u32, #[serde(skip)] keys: Vec<(String, Vec<u8>)> },
    OmapRmKeys { cid: u32, oid: u32, keys: Vec<String> },
    OmapRmKeyRange { cid: u32, oid: u32, first: String, last: String },
    OmapSetHeader { cid: u32, oid: u32, #[serde(skip)] data: Vec<u8> },
    PgmetaSetKeys { cid: u32, oid: u32, #[serde(skip)] keys: Vec<(String, Vec<u8>)> },
    SetAllocHint { cid: u32, oid: u32, expected_object_size: u64, expected_write_size: u64 },
    CollectionSetAttr { cid: u32, name: String, #[serde(skip)] value: Vec<u8> },
    CollectionRmAttr { cid: u32, name: String },
}

impl TxOp {
    fn opcode(&self) -> u8 {
        match self {
            Self::Nop => 0,
            Self::Touch { .. } => 1,
            Self::Write { .. } => 2,
            Self::Zero { .. } => 3,
            Self::Truncate { .. } => 4,
            Self::Remove { .. } => 5,
            Self::SetAttr { .. } => 6,
            Self::SetAttrs { .. } => 7,
            Self::RmAttr { .. } => 8,
            Self::RmAttrs { .. } => 9,
            Self::Clone { .. } => 10,
            Self::CloneRange { .. } => 11,
            Self::CreateCollection { .. } => 12,
            Self::CollectionHint { .. } => 13,
            Self::RemoveCollection { .. } => 14,
            Self::CollectionAdd { .. } => 15,
            Self::CollectionMoveRename { .. } => 16,
            Self::SplitCollection { .. } => 17,
            Self::OmapClear { .. } => 18,
            Self::OmapSetKeys { .. } => 19,
            Self::OmapRmKeys { .. } => 20,
            Self::OmapRmKeyRange { .. } => 21,
            Self::OmapSetHeader { .. } => 22,
            Self::PgmetaSetKeys { .. } => 23,
            Self::SetAllocHint { .. } => 24,
            Self::CollectionSetAttr { .. } => 25,
            Self::CollectionRmAttr { .. } => 26,
        }
    }

    /// True when this op may apply before its journal entry is durable
    #[must_use]
    pub fn parallel_safe(&self) -> bool {
        matches!(
            self,
            Self::Nop
                | Self::Touch { .. }
                | Self::Write { .. }
                | Self::Zero { .. }
                | Self::Truncate { .. }
                | Self::SetAttr { .. }
                | Self::SetAttrs { .. }
                | Self::OmapSetKeys { .. }
                | Self::OmapSetHeader { .. }
                | Self::PgmetaSetKeys { .. }
                | Self::SetAllocHint { .. }
        )
    }
}

/// An ordered list of operations applied atomically
#[derive(Debug, Clone, Default, Serialize)]
pub struct Transaction {
    colls: Vec<CollectionId>,
    objects: Vec<ObjectId>,
    ops: Vec<TxOp>,
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn intern_coll(&mut self, cid: &CollectionId) -> u32 {
        match self.colls.iter().position(|c| c == cid) {
            Some(i) => i as u32,
            None => {
                self.colls.push(cid.clone());
                (self.colls.len() - 1) as u32
            }
        }
    }

    fn intern_object(&mut self, oid: &ObjectId) -> u32 {
        match self.objects.iter().position(|o| o == oid) {
            Some(i) => i as u32,
            None => {
                self.objects.push(oid.clone());
                (self.objects.len() - 1) as u32
            }
        }
    }

    /// Resolve a collection index
    #[must_use]
    pub fn coll(&self, idx: u32) -> &CollectionId {
        &self.colls[idx as usize]
    }

    /// Resolve an object index
    #[must_use]
    pub fn object(&self, idx: u32) -> &ObjectId {
        &self.objects[idx as usize]
    }

    #[must_use]
    pub fn ops(&self) -> &[TxOp] {
        &self.ops
    }

    #[must_use]
    pub fn num_ops(&self) -> u64 {
        self.ops.len() as u64
    }

    /// Payload bytes carried by this transaction
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                TxOp::Write { data, .. } | TxOp::OmapSetHeader { data, .. } => data.len() as u64,
                TxOp::SetAttr { value, .. } | TxOp::CollectionSetAttr { value, .. } => {
                    value.len() as u64
                }
                TxOp::SetAttrs { attrs, .. } => {
                    attrs.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum()
                }
                TxOp::OmapSetKeys { keys, .. } | TxOp::PgmetaSetKeys { keys, .. } => {
                    keys.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum()
                }
                _ => 0,
            })
            .sum()
    }

    /// True when every op in this transaction is parallel-safe
    #[must_use]
    pub fn parallel_safe(&self) -> bool {
        self.ops.iter().all(TxOp::parallel_safe)
    }

    // ── Builder surface ───────────────────────────────────────────────────

    pub fn nop(&mut self) {
        self.ops.push(TxOp::Nop);
    }

    pub fn touch(&mut self, cid: &CollectionId, oid: &ObjectId) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::Touch { cid: c, oid: o });
    }

    pub fn write(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        offset: u64,
        data: Vec<u8>,
        flags: u32,
    ) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::Write {
            cid: c,
            oid: o,
            offset,
            data,
            flags,
        });
    }

    pub fn zero(&mut self, cid: &CollectionId, oid: &ObjectId, offset: u64, len: u64) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::Zero {
            cid: c,
            oid: o,
            offset,
            len,
        });
    }

    pub fn truncate(&mut self, cid: &CollectionId, oid: &ObjectId, size: u64) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::Truncate {
            cid: c,
            oid: o,
            size,
        });
    }

    pub fn remove(&mut self, cid: &CollectionId, oid: &ObjectId) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::Remove { cid: c, oid: o });
    }

    pub fn setattr(&mut self, cid: &CollectionId, oid: &ObjectId, name: &str, value: Vec<u8>) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::SetAttr {
            cid: c,
            oid: o,
            name: name.to_string(),
            value,
        });
    }

    pub fn setattrs(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        attrs: Vec<(String, Vec<u8>)>,
    ) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::SetAttrs {
            cid: c,
            oid: o,
            attrs,
        });
    }

    pub fn rmattr(&mut self, cid: &CollectionId, oid: &ObjectId, name: &str) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::RmAttr {
            cid: c,
            oid: o,
            name: name.to_string(),
        });
    }

    pub fn rmattrs(&mut self, cid: &CollectionId, oid: &ObjectId) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::RmAttrs { cid: c, oid: o });
    }

    pub fn clone_object(&mut self, cid: &CollectionId, oid: &ObjectId, dest: &ObjectId) {
        let c = self.intern_coll(cid);
        let (o, d) = (self.intern_object(oid), self.intern_object(dest));
        self.ops.push(TxOp::Clone {
            cid: c,
            oid: o,
            dest_oid: d,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn clone_range(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        dest: &ObjectId,
        src_off: u64,
        len: u64,
        dst_off: u64,
    ) {
        let c = self.intern_coll(cid);
        let (o, d) = (self.intern_object(oid), self.intern_object(dest));
        self.ops.push(TxOp::CloneRange {
            cid: c,
            oid: o,
            dest_oid: d,
            src_off,
            len,
            dst_off,
        });
    }

    pub fn create_collection(&mut self, cid: &CollectionId) {
        let c = self.intern_coll(cid);
        self.ops.push(TxOp::CreateCollection { cid: c });
    }

    pub fn collection_hint(&mut self, cid: &CollectionId, pg_num: u32, expected_objects: u64) {
        let c = self.intern_coll(cid);
        self.ops.push(TxOp::CollectionHint {
            cid: c,
            pg_num,
            expected_objects,
        });
    }

    pub fn remove_collection(&mut self, cid: &CollectionId) {
        let c = self.intern_coll(cid);
        self.ops.push(TxOp::RemoveCollection { cid: c });
    }

    /// Link `oid` into `dest` while leaving it in `src`
    pub fn collection_add(&mut self, dest: &CollectionId, src: &CollectionId, oid: &ObjectId) {
        let (d, s) = (self.intern_coll(dest), self.intern_coll(src));
        let o = self.intern_object(oid);
        self.ops.push(TxOp::CollectionAdd {
            cid: d,
            src_cid: s,
            oid: o,
        });
    }

    pub fn collection_move_rename(
        &mut self,
        src_cid: &CollectionId,
        src_oid: &ObjectId,
        dest_cid: &CollectionId,
        dest_oid: &ObjectId,
    ) {
        let (s, d) = (self.intern_coll(src_cid), self.intern_coll(dest_cid));
        let (so, dd) = (self.intern_object(src_oid), self.intern_object(dest_oid));
        self.ops.push(TxOp::CollectionMoveRename {
            src_cid: s,
            src_oid: so,
            dest_cid: d,
            dest_oid: dd,
        });
    }

    pub fn split_collection(
        &mut self,
        cid: &CollectionId,
        bits: u32,
        rem: u32,
        dest: &CollectionId,
    ) {
        let (c, d) = (self.intern_coll(cid), self.intern_coll(dest));
        self.ops.push(TxOp::SplitCollection {
            cid: c,
            bits,
            rem,
            dest_cid: d,
        });
    }

    pub fn omap_clear(&mut self, cid: &CollectionId, oid: &ObjectId) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::OmapClear { cid: c, oid: o });
    }

    pub fn omap_setkeys(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        keys: Vec<(String, Vec<u8>)>,
    ) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::OmapSetKeys {
            cid: c,
            oid: o,
            keys,
        });
    }

    pub fn omap_rmkeys(&mut self, cid: &CollectionId, oid: &ObjectId, keys: Vec<String>) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::OmapRmKeys {
            cid: c,
            oid: o,
            keys,
        });
    }

    pub fn omap_rmkeyrange(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        first: &str,
        last: &str,
    ) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::OmapRmKeyRange {
            cid: c,
            oid: o,
            first: first.to_string(),
            last: last.to_string(),
        });
    }

    pub fn omap_setheader(&mut self, cid: &CollectionId, oid: &ObjectId, data: Vec<u8>) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::OmapSetHeader {
            cid: c,
            oid: o,
            data,
        });
    }

    /// Buffered omap writes for pgmeta objects; flushed once per commit cycle
    pub fn pgmeta_setkeys(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        keys: Vec<(String, Vec<u8>)>,
    ) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::PgmetaSetKeys {
            cid: c,
            oid: o,
            keys,
        });
    }

    pub fn set_alloc_hint(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        expected_object_size: u64,
        expected_write_size: u64,
    ) {
        let (c, o) = (self.intern_coll(cid), self.intern_object(oid));
        self.ops.push(TxOp::SetAllocHint {
            cid: c,
            oid: o,
            expected_object_size,
            expected_write_size,
        });
    }

    pub fn collection_setattr(&mut self, cid: &CollectionId, name: &str, value: Vec<u8>) {
        let c = self.intern_coll(cid);
        self.ops.push(TxOp::CollectionSetAttr {
            cid: c,
            name: name.to_string(),
            value,
        });
    }

    pub fn collection_rmattr(&mut self, cid: &CollectionId, name: &str) {
        let c = self.intern_coll(cid);
        self.ops.push(TxOp::CollectionRmAttr {
            cid: c,
            name: name.to_string(),
        });
    }

    // ── Wire codec ────────────────────────────────────────────────────────

    pub fn encode(&self, e: &mut Encoder) {
        e.put_u32(self.colls.len() as u32);
        for c in &self.colls {
            e.put_str(c.as_str());
        }
        e.put_u32(self.objects.len() as u32);
        for o in &self.objects {
            e.put_i64(o.pool);
            e.put_u32(o.hash);
            e.put_str(&o.name);
            e.put_u64(o.snap);
            e.put_u64(o.generation);
        }
        e.put_u32(self.ops.len() as u32);
        for op in &self.ops {
            e.put_u8(op.opcode());
            encode_op(e, op);
        }
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Self> {
        let ncolls = d.get_u32()? as usize;
        let mut colls = Vec::with_capacity(ncolls);
        for _ in 0..ncolls {
            colls.push(CollectionId::new(d.get_str()?));
        }
        let nobjs = d.get_u32()? as usize;
        let mut objects = Vec::with_capacity(nobjs);
        for _ in 0..nobjs {
            let pool = d.get_i64()?;
            let hash = d.get_u32()?;
            let name = d.get_str()?;
            let snap = d.get_u64()?;
            let generation = d.get_u64()?;
            objects.push(ObjectId {
                pool,
                hash,
                name,
                snap,
                generation,
            });
        }
        let nops = d.get_u32()? as usize;
        let mut ops = Vec::with_capacity(nops);
        for _ in 0..nops {
            let opcode = d.get_u8()?;
            ops.push(decode_op(d, opcode)?);
        }
        let txn = Self {
            colls,
            objects,
            ops,
        };
        txn.validate_indices()?;
        Ok(txn)
    }

    fn validate_indices(&self) -> Result<()> {
        let nc = self.colls.len() as u32;
        let no = self.objects.len() as u32;
        for op in &self.ops {
            let (cids, oids) = op_indices(op);
            if cids.iter().any(|&c| c >= nc) || oids.iter().any(|&o| o >= no) {
                return Err(Error::decode("transaction op index out of range"));
            }
        }
        Ok(())
    }
}

fn encode_kv_list(e: &mut Encoder, kvs: &[(String, Vec<u8>)]) {
    e.put_u32(kvs.len() as u32);
    for (k, v) in kvs {
        e.put_str(k);
        e.put_bytes(v);
    }
}

fn decode_kv_list(d: &mut Decoder<'_>) -> Result<Vec<(String, Vec<u8>)>> {
    let n = d.get_u32()? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let k = d.get_str()?;
        let v = d.get_bytes()?;
        out.push((k, v));
    }
    Ok(out)
}

fn encode_op(e: &mut Encoder, op: &TxOp) {
    match op {
        TxOp::Nop => {}
        TxOp::Touch { cid, oid }
        | TxOp::Remove { cid, oid }
        | TxOp::RmAttrs { cid, oid }
        | TxOp::OmapClear { cid, oid } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
        }
        TxOp::Write {
            cid,
            oid,
            offset,
            data,
            flags,
        } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
            e.put_u64(*offset);
            e.put_u32(*flags);
            e.put_bytes(data);
        }
        TxOp::Zero {
            cid,
            oid,
            offset,
            len,
        } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
            e.put_u64(*offset);
            e.put_u64(*len);
        }
        TxOp::Truncate { cid, oid, size } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
            e.put_u64(*size);
        }
        TxOp::SetAttr {
            cid,
            oid,
            name,
            value,
        } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
            e.put_str(name);
            e.put_bytes(value);
        }
        TxOp::SetAttrs { cid, oid, attrs } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
            encode_kv_list(e, attrs);
        }
        TxOp::RmAttr { cid, oid, name } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
            e.put_str(name);
        }
        TxOp::Clone { cid, oid, dest_oid } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
            e.put_u32(*dest_oid);
        }
        TxOp::CloneRange {
            cid,
            oid,
            dest_oid,
            src_off,
            len,
            dst_off,
        } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
            e.put_u32(*dest_oid);
            e.put_u64(*src_off);
            e.put_u64(*len);
            e.put_u64(*dst_off);
        }
        TxOp::CreateCollection { cid } | TxOp::RemoveCollection { cid } => {
            e.put_u32(*cid);
        }
        TxOp::CollectionHint {
            cid,
            pg_num,
            expected_objects,
        } => {
            e.put_u32(*cid);
            e.put_u32(*pg_num);
            e.put_u64(*expected_objects);
        }
        TxOp::CollectionAdd { cid, src_cid, oid } => {
            e.put_u32(*cid);
            e.put_u32(*src_cid);
            e.put_u32(*oid);
        }
        TxOp::CollectionMoveRename {
            src_cid,
            src_oid,
            dest_cid,
            dest_oid,
        } => {
            e.put_u32(*src_cid);
            e.put_u32(*src_oid);
            e.put_u32(*dest_cid);
            e.put_u32(*dest_oid);
        }
        TxOp::SplitCollection {
            cid,
            bits,
            rem,
            dest_cid,
        } => {
            e.put_u32(*cid);
            e.put_u32(*bits);
            e.put_u32(*rem);
            e.put_u32(*dest_cid);
        }
        TxOp::OmapSetKeys { cid, oid, keys } | TxOp::PgmetaSetKeys { cid, oid, keys } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
            encode_kv_list(e, keys);
        }
        TxOp::OmapRmKeys { cid, oid, keys } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
            e.put_u32(keys.len() as u32);
            for k in keys {
                e.put_str(k);
            }
        }
        TxOp::OmapRmKeyRange {
            cid,
            oid,
            first,
            last,
        } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
            e.put_str(first);
            e.put_str(last);
        }
        TxOp::OmapSetHeader { cid, oid, data } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
            e.put_bytes(data);
        }
        TxOp::SetAllocHint {
            cid,
            oid,
            expected_object_size,
            expected_write_size,
        } => {
            e.put_u32(*cid);
            e.put_u32(*oid);
            e.put_u64(*expected_object_size);
            e.put_u64(*expected_write_size);
        }
        TxOp::CollectionSetAttr { cid, name, value } => {
            e.put_u32(*cid);
            e.put_str(name);
            e.put_bytes(value);
        }
        TxOp::CollectionRmAttr { cid, name } => {
            e.put_u32(*cid);
            e.put_str(name);
        }
    }
}

fn decode_op(d: &mut Decoder<'_>, opcode: u8) -> Result<TxOp> {
    let op = match opcode {
        0 => TxOp::Nop,
        1 => TxOp::Touch {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
        },
        2 => TxOp::Write {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
            offset: d.get_u64()?,
            flags: d.get_u32()?,
            data: d.get_bytes()?,
        },
        3 => TxOp::Zero {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
            offset: d.get_u64()?,
            len: d.get_u64()?,
        },
        4 => TxOp::Truncate {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
            size: d.get_u64()?,
        },
        5 => TxOp::Remove {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
        },
        6 => TxOp::SetAttr {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
            name: d.get_str()?,
            value: d.get_bytes()?,
        },
        7 => TxOp::SetAttrs {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
            attrs: decode_kv_list(d)?,
        },
        8 => TxOp::RmAttr {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
            name: d.get_str()?,
        },
        9 => TxOp::RmAttrs {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
        },
        10 => TxOp::Clone {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
            dest_oid: d.get_u32()?,
        },
        11 => TxOp::CloneRange {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
            dest_oid: d.get_u32()?,
            src_off: d.get_u64()?,
            len: d.get_u64()?,
            dst_off: d.get_u64()?,
        },
        12 => TxOp::CreateCollection { cid: d.get_u32()? },
        13 => TxOp::CollectionHint {
            cid: d.get_u32()?,
            pg_num: d.get_u32()?,
            expected_objects: d.get_u64()?,
        },
        14 => TxOp::RemoveCollection { cid: d.get_u32()? },
        15 => TxOp::CollectionAdd {
            cid: d.get_u32()?,
            src_cid: d.get_u32()?,
            oid: d.get_u32()?,
        },
        16 => TxOp::CollectionMoveRename {
            src_cid: d.get_u32()?,
            src_oid: d.get_u32()?,
            dest_cid: d.get_u32()?,
            dest_oid: d.get_u32()?,
        },
        17 => TxOp::SplitCollection {
            cid: d.get_u32()?,
            bits: d.get_u32()?,
            rem: d.get_u32()?,
            dest_cid: d.get_u32()?,
        },
        18 => TxOp::OmapClear {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
        },
        19 => TxOp::OmapSetKeys {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
            keys: decode_kv_list(d)?,
        },
        20 => {
            let cid = d.get_u32()?;
            let oid = d.get_u32()?;
            let n = d.get_u32()? as usize;
            let mut keys = Vec::with_capacity(n);
            for _ in 0..n {
                keys.push(d.get_str()?);
            }
            TxOp::OmapRmKeys { cid, oid, keys }
        }
        21 => TxOp::OmapRmKeyRange {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
            first: d.get_str()?,
            last: d.get_str()?,
        },
        22 => TxOp::OmapSetHeader {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
            data: d.get_bytes()?,
        },
        23 => TxOp::PgmetaSetKeys {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
            keys: decode_kv_list(d)?,
        },
        24 => TxOp::SetAllocHint {
            cid: d.get_u32()?,
            oid: d.get_u32()?,
            expected_object_size: d.get_u64()?,
            expected_write_size: d.get_u64()?,
        },
        25 => TxOp::CollectionSetAttr {
            cid: d.get_u32()?,
            name: d.get_str()?,
            value: d.get_bytes()?,
        },
        26 => TxOp::CollectionRmAttr {
            cid: d.get_u32()?,
            name: d.get_str()?,
        },
        other => return Err(Error::decode(format!("bad opcode {other}"))),
    };
    Ok(op)
}

fn op_indices(op: &TxOp) -> (Vec<u32>, Vec<u32>) {
    match op {
        TxOp::Nop => (vec![], vec![]),
        TxOp::Touch { cid, oid }
        | TxOp::Write { cid, oid, .. }
        | TxOp::Zero { cid, oid, .. }
        | TxOp::Truncate { cid, oid, .. }
        | TxOp::Remove { cid, oid }
        | TxOp::SetAttr { cid, oid, .. }
        | TxOp::SetAttrs { cid, oid, .. }
        | TxOp::RmAttr { cid, oid, .. }
        | TxOp::RmAttrs { cid, oid }
        | TxOp::OmapClear { cid, oid }
        | TxOp::OmapSetKeys { cid, oid, .. }
        | TxOp::OmapRmKeys { cid, oid, .. }
        | TxOp::OmapRmKeyRange { cid, oid, .. }
        | TxOp::OmapSetHeader { cid, oid, .. }
        | TxOp::PgmetaSetKeys { cid, oid, .. }
        | TxOp::SetAllocHint { cid, oid, .. } => (vec![*cid], vec![*oid]),
        TxOp::Clone { cid, oid, dest_oid }
        | TxOp::CloneRange {
            cid, oid, dest_oid, ..
        } => (vec![*cid], vec![*oid, *dest_oid]),
        TxOp::CreateCollection { cid }
        | TxOp::RemoveCollection { cid }
        | TxOp::CollectionHint { cid, .. }
        | TxOp::CollectionSetAttr { cid, .. }
        | TxOp::CollectionRmAttr { cid, .. } => (vec![*cid], vec![]),
        TxOp::CollectionAdd { cid, src_cid, oid } => (vec![*cid, *src_cid], vec![*oid]),
        TxOp::CollectionMoveRename {
            src_cid,
            src_oid,
            dest_cid,
            dest_oid,
        } => (vec![*src_cid, *dest_cid], vec![*src_oid, *dest_oid]),
        TxOp::SplitCollection { cid, dest_cid, .. } => (vec![*cid, *dest_cid], vec![]),
    }
}

/// Encode a batch of transactions into one journal payload
pub fn encode_batch(txns: &[Transaction]) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_u32(txns.len() as u32);
    for t in txns {
        t.encode(&mut e);
    }
    e.into_bytes()
}

/// Decode a journal payload back into its transactions
pub fn decode_batch(raw: &[u8]) -> Result<Vec<Transaction>> {
    let mut d = Decoder::new(raw);
    let n = d.get_u32()? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(Transaction::decode(&mut d)?);
    }
    if !d.is_end() {
        return Err(Error::decode("trailing bytes after transaction batch"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid() -> CollectionId {
        CollectionId::new("meta")
    }

    fn oid(name: &str) -> ObjectId {
        ObjectId::new(1, 0xABCD, name)
    }

    #[test]
    fn test_intern_tables_are_shared() {
        let mut t = Transaction::new();
        t.touch(&cid(), &oid("a"));
        t.write(&cid(), &oid("a"), 0, b"xy".to_vec(), 0);
        t.remove(&cid(), &oid("b"));
        // one collection, two objects
        assert_eq!(t.colls.len(), 1);
        assert_eq!(t.objects.len(), 2);
    }

    #[test]
    fn test_codec_roundtrip() {
        let mut t = Transaction::new();
        t.create_collection(&cid());
        t.touch(&cid(), &oid("a"));
        t.write(&cid(), &oid("a"), 7, b"payload".to_vec(), FADVISE_DONTNEED);
        t.setattrs(&cid(), &oid("a"), vec![("k".into(), b"v".to_vec())]);
        t.clone_object(&cid(), &oid("a"), &oid("b"));
        t.omap_setkeys(&cid(), &oid("a"), vec![("ok".into(), b"ov".to_vec())]);
        t.omap_rmkeyrange(&cid(), &oid("a"), "a", "z");
        t.split_collection(&cid(), 2, 1, &CollectionId::new("dest"));
        t.set_alloc_hint(&cid(), &oid("a"), 1 << 20, 4096);

        let raw = encode_batch(&[t.clone()]);
        let back = decode_batch(&raw).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].num_ops(), t.num_ops());
        assert_eq!(back[0].num_bytes(), t.num_bytes());
        match &back[0].ops()[2] {
            TxOp::Write { offset, data, flags, .. } => {
                assert_eq!(*offset, 7);
                assert_eq!(data, b"payload");
                assert_eq!(*flags, FADVISE_DONTNEED);
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_parallel_safe_classification() {
        let mut data_only = Transaction::new();
        data_only.touch(&cid(), &oid("a"));
        data_only.write(&cid(), &oid("a"), 0, b"d".to_vec(), 0);
        data_only.setattr(&cid(), &oid("a"), "k", b"v".to_vec());
        data_only.omap_setkeys(&cid(), &oid("a"), vec![]);
        assert!(data_only.parallel_safe());

        let mut with_clone = data_only.clone();
        with_clone.clone_object(&cid(), &oid("a"), &oid("b"));
        assert!(!with_clone.parallel_safe());

        let mut with_rm = data_only.clone();
        with_rm.omap_rmkeys(&cid(), &oid("a"), vec!["k".into()]);
        assert!(!with_rm.parallel_safe());
    }

    #[test]
    fn test_decode_rejects_bad_index() {
        let mut t = Transaction::new();
        t.touch(&cid(), &oid("a"));
        let mut raw = encode_batch(&[t]);
        // corrupt the oid index of the touch op (last 4 bytes)
        let n = raw.len();
        raw[n - 4..].copy_from_slice(&99u32.to_le_bytes());
        assert!(decode_batch(&raw).is_err());
    }

    #[test]
    fn test_num_bytes_counts_payloads() {
        let mut t = Transaction::new();
        t.write(&cid(), &oid("a"), 0, vec![0u8; 100], 0);
        t.setattr(&cid(), &oid("a"), "k", vec![0u8; 10]);
        assert_eq!(t.num_bytes(), 110);
    }
}
