//! Configuration for the objectfs engine
//!
//! The engine takes an immutable snapshot of this structure at construction;
//! live reconfiguration is a message to the store object, never a global.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for a store instance
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    /// Commit/sync cycle tuning
    pub sync: SyncConfig,
    /// Admission queue ceilings
    pub queue: QueueConfig,
    /// Thread-pool and shard sizing
    pub threads: ThreadConfig,
    /// Writeback throttle watermarks
    pub wbthrottle: WbThrottleConfig,
    /// Inline extended-attribute policy
    pub xattr: XattrConfig,
    /// Journal tuning
    pub journal: JournalConfig,
    /// Debug toggles and failure injection
    pub debug: DebugConfig,
    /// Refuse reads that hit EIO instead of aborting
    pub fail_on_eio: bool,
    /// Rewrite a stale version stamp at mount instead of refusing
    pub update_on_mount: bool,
    /// Roll back to this cluster snapshot at mount
    pub rollback_to_cluster_snap: Option<String>,
    /// Allow rolling back over a `nosnap` marker
    pub use_stale_snap: bool,
}

/// Commit/sync cycle tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Shortest pause between two commit cycles (seconds)
    pub min_interval: f64,
    /// Longest pause before a cycle is forced (seconds)
    pub max_interval: f64,
    /// A commit cycle exceeding this many seconds aborts the process
    pub commit_timeout: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_interval: 0.01,
            max_interval: 5.0,
            commit_timeout: 600.0,
        }
    }
}

/// Admission queue ceilings. Zero disables the corresponding ceiling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum in-flight operations
    pub max_ops: u64,
    /// Maximum in-flight bytes
    pub max_bytes: u64,
    /// Extra ops allowed while a checkpoint commit is in flight
    pub committing_max_ops: u64,
    /// Extra bytes allowed while a checkpoint commit is in flight
    pub committing_max_bytes: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_ops: 50,
            max_bytes: 100 << 20,
            committing_max_ops: 500,
            committing_max_bytes: 100 << 20,
        }
    }
}

/// Thread-pool and shard sizing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Worker threads applying transactions
    pub op_threads: usize,
    /// Finisher threads for on-disk callbacks
    pub ondisk_finishers: usize,
    /// Finisher threads for on-readable callbacks
    pub apply_finishers: usize,
    /// Writeback throttle shards (one flusher thread each)
    pub wbthrottle_shards: usize,
    /// File-descriptor cache shards
    pub fd_cache_shards: usize,
    /// Total file-descriptor cache capacity across shards
    pub fd_cache_size: usize,
    /// Pgmeta write-cache shards
    pub pgmeta_shards: usize,
    /// Worker heartbeat timeout before the process aborts (seconds);
    /// zero disables the watchdog
    pub op_thread_timeout: f64,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            op_threads: 2,
            ondisk_finishers: 1,
            apply_finishers: 1,
            wbthrottle_shards: 2,
            fd_cache_shards: 16,
            fd_cache_size: 128,
            pgmeta_shards: 8,
            op_thread_timeout: 60.0,
        }
    }
}

/// Writeback throttle watermarks. `start_flusher` levels wake the background
/// flusher, `hard_limit` levels block the writer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WbThrottleConfig {
    /// Enable the writeback throttle
    pub enable: bool,
    pub start_flusher_bytes: u64,
    pub start_flusher_ios: u64,
    pub start_flusher_inodes: u64,
    pub hard_limit_bytes: u64,
    pub hard_limit_ios: u64,
    pub hard_limit_inodes: u64,
}

impl Default for WbThrottleConfig {
    fn default() -> Self {
        Self {
            enable: true,
            start_flusher_bytes: 10 << 20,
            start_flusher_ios: 500,
            start_flusher_inodes: 500,
            hard_limit_bytes: 200 << 20,
            hard_limit_ios: 5000,
            hard_limit_inodes: 5000,
        }
    }
}

/// Inline extended-attribute policy: attributes above these limits overflow
/// into the key/value store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct XattrConfig {
    /// Largest value stored inline on the file
    pub max_inline_size: usize,
    /// Largest number of inline attributes per object
    pub max_inline_count: usize,
}

impl Default for XattrConfig {
    fn default() -> Self {
        Self {
            max_inline_size: 2048,
            max_inline_count: 10,
        }
    }
}

/// Journal tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Journal capacity created by `mkjournal` (bytes)
    pub size: u64,
    /// Open the journal with direct I/O (falls back to buffered when
    /// unsupported)
    pub direct_io: bool,
    /// Use asynchronous journal appends
    pub async_io: bool,
    /// Force asynchronous appends even on block devices
    pub force_async: bool,
    /// Fill fraction above which the commit thread is asked to run
    pub commit_watermark: f64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            size: 64 << 20,
            direct_io: false,
            async_io: false,
            force_async: false,
            commit_watermark: 0.5,
        }
    }
}

/// Debug toggles and failure injection
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct DebugConfig {
    /// Hard-exit the process after this many injection points (0 = off)
    pub kill_at: u64,
    /// Sleep this many seconds at the top of each apply (0 = off)
    pub inject_stall_secs: u64,
    /// Fail reads of objects named here with an I/O error
    pub inject_read_eio: Vec<String>,
    /// Track and verify crc32c of written extents
    pub sloppy_crc: bool,
    /// Dump every applied transaction as JSON to this file
    pub dump_file: Option<PathBuf>,
    /// Force the checkpoint-capable snapdir backend regardless of the
    /// detected filesystem
    pub force_copy_checkpoints: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_sane() {
        let cfg = StoreConfig::default();
        assert!(cfg.sync.min_interval < cfg.sync.max_interval);
        assert!(cfg.threads.op_threads >= 1);
        assert!(cfg.queue.max_ops > 0);
        assert!(!cfg.debug.sloppy_crc);
    }

    #[test]
    fn test_roundtrip_json() {
        let cfg = StoreConfig::default();
        let s = serde_json::to_string(&cfg).unwrap();
        let back: StoreConfig = serde_json::from_str(&s).unwrap();
        assert_eq!(back.queue.max_ops, cfg.queue.max_ops);
    }
}
