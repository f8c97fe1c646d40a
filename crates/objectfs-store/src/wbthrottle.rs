//! Writeback throttle
//!
//! Applied writes land in the kernel page cache; left unchecked the page
//! cache grows until the periodic sync stalls for seconds. Each shard keeps
//! a bounded queue of dirty objects, a background flusher that pushes the
//! oldest ones out (`fdatasync`, optionally dropping the pages with
//! `posix_fadvise(DONTNEED)`), and a `throttle()` entry point that blocks
//! writers once the hard limits are crossed.
//!
//! Shards are selected by sequencer id, so one hot stream cannot starve the
//! others.

use crate::fd_cache::CachedFd;
use objectfs_common::{ObjectId, WbThrottleConfig};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{trace, warn};

struct PendingWb {
    fd: Arc<CachedFd>,
    bytes: u64,
    ios: u64,
    nocache: bool,
}

struct ShardState {
    pending: HashMap<ObjectId, PendingWb>,
    /// Oldest dirty object first
    order: VecDeque<ObjectId>,
    bytes: u64,
    ios: u64,
    stop: bool,
}

struct Shard {
    state: Mutex<ShardState>,
    /// Wakes the flusher
    flush_cond: Condvar,
    /// Wakes writers blocked on the hard limit
    room_cond: Condvar,
    cfg: WbThrottleConfig,
}

impl Shard {
    fn over_start(&self, st: &ShardState) -> bool {
        st.bytes > self.cfg.start_flusher_bytes
            || st.ios > self.cfg.start_flusher_ios
            || st.pending.len() as u64 > self.cfg.start_flusher_inodes
    }

    fn over_hard(&self, st: &ShardState) -> bool {
        st.bytes > self.cfg.hard_limit_bytes
            || st.ios > self.cfg.hard_limit_ios
            || st.pending.len() as u64 > self.cfg.hard_limit_inodes
    }
}

/// Sharded writeback throttle with one flusher thread per shard
pub struct WbThrottle {
    shards: Vec<Arc<Shard>>,
    flushers: Mutex<Vec<JoinHandle<()>>>,
    enabled: bool,
}

impl WbThrottle {
    #[must_use]
    pub fn new(cfg: &WbThrottleConfig, nshards: usize) -> Self {
        let shards = (0..nshards.max(1))
            .map(|_| {
                Arc::new(Shard {
                    state: Mutex::new(ShardState {
                        pending: HashMap::new(),
                        order: VecDeque::new(),
                        bytes: 0,
                        ios: 0,
                        stop: false,
                    }),
                    flush_cond: Condvar::new(),
                    room_cond: Condvar::new(),
                    cfg: cfg.clone(),
                })
            })
            .collect();
        Self {
            shards,
            flushers: Mutex::new(Vec::new()),
            enabled: cfg.enable,
        }
    }

    #[must_use]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Start one flusher thread per shard
    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        let mut flushers = self.flushers.lock();
        for (i, shard) in self.shards.iter().enumerate() {
            let shard = shard.clone();
            let handle = std::thread::Builder::new()
                .name(format!("objectfs-wb-{i}"))
                .spawn(move || flusher_loop(&shard))
                .expect("spawn wbthrottle flusher");
            flushers.push(handle);
        }
    }

    /// Stop and join every flusher
    pub fn stop(&self) {
        for shard in &self.shards {
            let mut st = shard.state.lock();
            st.stop = true;
            shard.flush_cond.notify_all();
            shard.room_cond.notify_all();
        }
        for handle in self.flushers.lock().drain(..) {
            let _ = handle.join();
        }
        for shard in &self.shards {
            shard.state.lock().stop = false;
        }
    }

    /// Record a dirty extent behind `fd`. Keeps the handle alive until it is
    /// flushed or the tracker is cleared by a commit cycle.
    pub fn queue_wb(
        &self,
        shard_id: usize,
        fd: Arc<CachedFd>,
        oid: &ObjectId,
        len: u64,
        nocache: bool,
    ) {
        if !self.enabled {
            return;
        }
        let shard = &self.shards[shard_id % self.shards.len()];
        let mut st = shard.state.lock();
        st.bytes += len;
        st.ios += 1;
        match st.pending.get_mut(oid) {
            Some(p) => {
                p.bytes += len;
                p.ios += 1;
                p.nocache |= nocache;
                p.fd = fd;
            }
            None => {
                st.pending.insert(
                    oid.clone(),
                    PendingWb {
                        fd,
                        bytes: len,
                        ios: 1,
                        nocache,
                    },
                );
                st.order.push_back(oid.clone());
            }
        }
        if shard.over_start(&st) {
            shard.flush_cond.notify_one();
        }
    }

    /// Block while the shard is over its hard limits. The worker suspends
    /// its watchdog heartbeat around this call.
    pub fn throttle(&self, shard_id: usize) {
        if !self.enabled {
            return;
        }
        let shard = &self.shards[shard_id % self.shards.len()];
        let mut st = shard.state.lock();
        while shard.over_hard(&st) && !st.stop {
            trace!(
                bytes = st.bytes,
                ios = st.ios,
                inodes = st.pending.len(),
                "writeback throttle blocking"
            );
            shard.flush_cond.notify_one();
            shard.room_cond.wait(&mut st);
        }
    }

    /// Forget all pending state without flushing; the commit cycle has just
    /// made everything durable.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut st = shard.state.lock();
            st.pending.clear();
            st.order.clear();
            st.bytes = 0;
            st.ios = 0;
            shard.room_cond.notify_all();
        }
    }
}

fn flusher_loop(shard: &Arc<Shard>) {
    loop {
        let (oid, wb) = {
            let mut st = shard.state.lock();
            while !shard.over_start(&st) && !st.stop {
                shard.flush_cond.wait(&mut st);
            }
            if st.stop {
                return;
            }
            let Some(oid) = st.order.pop_front() else {
                continue;
            };
            let Some(wb) = st.pending.remove(&oid) else {
                continue;
            };
            st.bytes -= wb.bytes;
            st.ios -= wb.ios;
            (oid, wb)
        };
        if let Err(e) = wb.fd.file().sync_data() {
            warn!(%oid, error = %e, "writeback fdatasync failed");
        }
        if wb.nocache {
            fadvise_dontneed(wb.fd.file());
        }
        trace!(%oid, bytes = wb.bytes, "writeback flushed");
        shard.room_cond.notify_all();
    }
}

fn fadvise_dontneed(file: &std::fs::File) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = file;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd_cache::FdCache;
    use tempfile::tempdir;

    fn small_cfg() -> WbThrottleConfig {
        WbThrottleConfig {
            enable: true,
            start_flusher_bytes: 100,
            start_flusher_ios: 4,
            start_flusher_inodes: 4,
            hard_limit_bytes: 200,
            hard_limit_ios: 8,
            hard_limit_inodes: 8,
        }
    }

    #[test]
    fn test_flusher_drains_backlog() {
        let dir = tempdir().unwrap();
        let cache = FdCache::new(1, 8);
        let wb = WbThrottle::new(&small_cfg(), 1);
        wb.start();

        for i in 0..6u32 {
            let oid = ObjectId::new(0, i, format!("o{i}"));
            let file = std::fs::File::create(dir.path().join(format!("o{i}"))).unwrap();
            let (fd, _) = cache.insert(&oid, file);
            wb.queue_wb(0, fd, &oid, 50, false);
        }
        // hard limit is 200 bytes; throttle must return once the flusher
        // catches up
        wb.throttle(0);
        wb.stop();
    }

    #[test]
    fn test_clear_releases_waiters() {
        let dir = tempdir().unwrap();
        let cache = FdCache::new(1, 8);
        let wb = Arc::new(WbThrottle::new(&small_cfg(), 1));
        // no flusher started: only clear() can release the throttle
        let oid = ObjectId::new(0, 0, "o");
        let file = std::fs::File::create(dir.path().join("o")).unwrap();
        let (fd, _) = cache.insert(&oid, file);
        wb.queue_wb(0, fd, &oid, 500, false);

        let wb2 = wb.clone();
        let h = std::thread::spawn(move || wb2.throttle(0));
        std::thread::sleep(std::time::Duration::from_millis(20));
        wb.clear();
        h.join().unwrap();
    }

    #[test]
    fn test_disabled_is_noop() {
        let mut cfg = small_cfg();
        cfg.enable = false;
        let wb = WbThrottle::new(&cfg, 2);
        wb.start();
        wb.throttle(0);
        wb.stop();
    }
}
