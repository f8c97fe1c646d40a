//! objectfs store engine
//!
//! This crate implements the transaction engine of the objectfs daemon:
//! - Write-ahead journaling with at-most-once apply under crash
//! - Strict per-sequencer ordering against parallel execution across
//!   sequencers
//! - Admission control and writeback throttling
//! - Periodic filesystem checkpointing with rollback (on capable backends)
//! - Fine-grained replay guards that tolerate partial reapplication

pub mod apply;
pub mod apply_manager;
pub mod backend;
pub mod fd_cache;
pub mod finisher;
pub mod guard;
pub mod index;
pub mod omap;
pub mod pgmeta;
pub mod sequencer;
pub mod store;
pub mod throttle;
pub mod transaction;
pub mod watchdog;
pub mod wbthrottle;

// Re-exports
pub use apply::callback;
pub use backend::Backend;
pub use fd_cache::{CachedFd, FdCache};
pub use guard::{GuardCheck, GLOBAL_GUARD_XATTR, REPLAY_GUARD_XATTR, SPILL_OUT_XATTR};
pub use omap::DbOmap;
pub use sequencer::{Callback, OpState};
pub use store::{Completions, FsStore, Sequencer, STORE_VERSION};
pub use transaction::{Transaction, TxOp, FADVISE_DONTNEED};

pub use objectfs_common::{
    CollectionId, Error, ObjectId, OpPosition, Result, StoreConfig, NO_GEN, NO_SNAP,
};
