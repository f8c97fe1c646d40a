//! Core type definitions for objectfs
//!
//! Identifiers for objects, collections and sequencer positions. Equality on
//! identifiers is exact; ordering is total and used for range scans.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Snapshot id value meaning "the live object" (no snapshot).
pub const NO_SNAP: u64 = u64::MAX;

/// Generation value meaning "no generation assigned".
pub const NO_GEN: u64 = u64::MAX;

/// Unique identifier for an object.
///
/// The tuple is (pool/shard hint, hash, name, snapshot id, generation).
/// Ordering sorts by pool, then hash, then name, then snapshot, then
/// generation, which groups objects of one placement group together on
/// range scans.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    /// Pool / shard hint
    pub pool: i64,
    /// Placement hash of the name
    pub hash: u32,
    /// Object name
    pub name: String,
    /// Snapshot id (`NO_SNAP` for the head object)
    pub snap: u64,
    /// Generation (`NO_GEN` when unused)
    pub generation: u64,
}

impl ObjectId {
    /// Create a head object id (no snapshot, no generation)
    #[must_use]
    pub fn new(pool: i64, hash: u32, name: impl Into<String>) -> Self {
        Self {
            pool,
            hash,
            name: name.into(),
            snap: NO_SNAP,
            generation: NO_GEN,
        }
    }

    /// Create an object id for a specific snapshot
    #[must_use]
    pub fn with_snap(pool: i64, hash: u32, name: impl Into<String>, snap: u64) -> Self {
        Self {
            pool,
            hash,
            name: name.into(),
            snap,
            generation: NO_GEN,
        }
    }

    /// True if the low `bits` bits of the hash equal `rem` (modulo the same
    /// mask). Used when splitting a collection.
    #[must_use]
    pub fn match_bits(&self, bits: u32, rem: u32) -> bool {
        if bits == 0 {
            return true;
        }
        let mask = if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 };
        self.hash & mask == rem & mask
    }

    /// Shard index for an `n`-way sharded structure
    #[must_use]
    pub fn shard(&self, n: usize) -> usize {
        debug_assert!(n > 0);
        self.hash as usize % n
    }
}

impl Ord for ObjectId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pool
            .cmp(&other.pool)
            .then_with(|| self.hash.cmp(&other.hash))
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.snap.cmp(&other.snap))
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for ObjectId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}:{}", self.pool, self.hash, self.name)?;
        if self.snap != NO_SNAP {
            write!(f, "@{}", self.snap)?;
        }
        if self.generation != NO_GEN {
            write!(f, "#{}", self.generation)?;
        }
        Ok(())
    }
}

/// Identifier for a collection: an opaque name for a directory of objects.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionId(String);

impl CollectionId {
    /// Create a new collection id
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the collection name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionId({:?})", self.0)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Position of one operation inside the total submission order: the op's
/// sequence number, the index of its transaction within the batch, and the
/// index of the operation within that transaction.
///
/// Replay guards store the position of the last applied non-idempotent
/// mutation; comparing positions decides whether a replayed op must run.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct OpPosition {
    pub seq: u64,
    pub txn: u32,
    pub op: u32,
}

impl OpPosition {
    #[must_use]
    pub fn new(seq: u64, txn: u32, op: u32) -> Self {
        Self { seq, txn, op }
    }

    /// Advance to the next operation within the same transaction
    pub fn bump(&mut self) {
        self.op += 1;
    }
}

impl fmt::Debug for OpPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.seq, self.txn, self.op)
    }
}

impl fmt::Display for OpPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.seq, self.txn, self.op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_ordering() {
        let a = ObjectId::new(1, 0x10, "aaa");
        let b = ObjectId::new(1, 0x10, "bbb");
        let c = ObjectId::new(1, 0x20, "aaa");
        let d = ObjectId::new(2, 0x00, "aaa");
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn test_object_id_snap_ordering() {
        let head = ObjectId::new(0, 5, "obj");
        let snap = ObjectId::with_snap(0, 5, "obj", 3);
        // snapshots sort before the head object
        assert!(snap < head);
    }

    #[test]
    fn test_match_bits() {
        let oid = ObjectId::new(0, 0b1101, "x");
        assert!(oid.match_bits(2, 1)); // 0b01
        assert!(!oid.match_bits(2, 2));
        assert!(oid.match_bits(0, 0));
        assert!(oid.match_bits(3, 0b101));
    }

    #[test]
    fn test_position_ordering() {
        let a = OpPosition::new(5, 0, 3);
        let b = OpPosition::new(5, 1, 0);
        let c = OpPosition::new(6, 0, 0);
        assert!(a < b);
        assert!(b < c);
        let mut d = a;
        d.bump();
        assert!(a < d);
    }
}
