//! Admission throttle
//!
//! Global semaphore over in-flight operations and bytes. Both ceilings are
//! raised by a configured committing-delta while a filesystem checkpoint is
//! in progress, so the next cycle can begin overlapping apply with commit.

use objectfs_common::QueueConfig;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

struct Counts {
    ops: u64,
    bytes: u64,
}

/// Admission throttle over in-flight ops and bytes
pub struct OpThrottle {
    cfg: QueueConfig,
    counts: Mutex<Counts>,
    cond: Condvar,
    /// True while a checkpoint commit is in flight on a checkpoint-capable
    /// backend
    committing: AtomicBool,
}

impl OpThrottle {
    #[must_use]
    pub fn new(cfg: QueueConfig) -> Self {
        Self {
            cfg,
            counts: Mutex::new(Counts { ops: 0, bytes: 0 }),
            cond: Condvar::new(),
            committing: AtomicBool::new(false),
        }
    }

    fn ceilings(&self) -> (u64, u64) {
        if self.committing.load(Ordering::Relaxed) {
            (
                self.cfg.max_ops + self.cfg.committing_max_ops,
                self.cfg.max_bytes + self.cfg.committing_max_bytes,
            )
        } else {
            (self.cfg.max_ops, self.cfg.max_bytes)
        }
    }

    /// Reserve room for an op of `bytes` bytes; blocks until admitted.
    /// A zero ceiling disables that limit, and a single op larger than the
    /// byte ceiling is admitted once the queue is empty.
    pub fn reserve(&self, bytes: u64) {
        let mut counts = self.counts.lock();
        loop {
            let (max_ops, max_bytes) = self.ceilings();
            let ops_full = max_ops != 0 && counts.ops + 1 > max_ops;
            let bytes_full =
                max_bytes != 0 && counts.bytes != 0 && counts.bytes + bytes > max_bytes;
            if !ops_full && !bytes_full {
                break;
            }
            trace!(
                ops = counts.ops,
                bytes = counts.bytes,
                "admission throttle waiting"
            );
            self.cond.wait(&mut counts);
        }
        counts.ops += 1;
        counts.bytes += bytes;
    }

    /// Release a reservation taken with [`OpThrottle::reserve`]
    pub fn release(&self, bytes: u64) {
        let mut counts = self.counts.lock();
        debug_assert!(counts.ops >= 1 && counts.bytes >= bytes);
        counts.ops -= 1;
        counts.bytes -= bytes;
        self.cond.notify_all();
    }

    /// Raise or restore the ceilings around a checkpoint commit
    pub fn set_committing(&self, committing: bool) {
        self.committing.store(committing, Ordering::Relaxed);
        if committing {
            self.cond.notify_all();
        }
    }

    /// Current in-flight (ops, bytes)
    #[must_use]
    pub fn in_flight(&self) -> (u64, u64) {
        let counts = self.counts.lock();
        (counts.ops, counts.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cfg(max_ops: u64, max_bytes: u64) -> QueueConfig {
        QueueConfig {
            max_ops,
            max_bytes,
            committing_max_ops: 10,
            committing_max_bytes: 1000,
        }
    }

    #[test]
    fn test_reserve_release() {
        let t = OpThrottle::new(cfg(2, 100));
        t.reserve(10);
        t.reserve(10);
        assert_eq!(t.in_flight(), (2, 20));
        t.release(10);
        t.release(10);
        assert_eq!(t.in_flight(), (0, 0));
    }

    #[test]
    fn test_blocks_at_op_ceiling() {
        let t = Arc::new(OpThrottle::new(cfg(1, 0)));
        t.reserve(1);
        let t2 = t.clone();
        let h = std::thread::spawn(move || {
            t2.reserve(1);
            t2.release(1);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(t.in_flight().0, 1);
        t.release(1);
        h.join().unwrap();
        assert_eq!(t.in_flight(), (0, 0));
    }

    #[test]
    fn test_large_op_admitted_when_idle() {
        let t = OpThrottle::new(cfg(0, 100));
        // single op over the byte ceiling goes through on an empty queue
        t.reserve(500);
        t.release(500);
    }

    #[test]
    fn test_committing_delta_raises_ceiling() {
        let t = Arc::new(OpThrottle::new(cfg(1, 0)));
        t.reserve(1);
        let t2 = t.clone();
        let h = std::thread::spawn(move || t2.reserve(1));
        std::thread::sleep(std::time::Duration::from_millis(20));
        t.set_committing(true);
        h.join().unwrap();
        assert_eq!(t.in_flight().0, 2);
        t.release(1);
        t.release(1);
    }
}
