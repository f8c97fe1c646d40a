//! Submission and apply coordination
//!
//! [`SubmitManager`] hands out sequence numbers while holding the submission
//! lock across the journal append, so journal order always equals sequence
//! order. [`ApplyManager`] tracks which sequences are applied and negotiates
//! the barrier with the commit thread: a commit may only cover sequences
//! with no unapplied op at or below them, because the journal trims
//! everything up to the committed sequence and a trimmed-but-unapplied op
//! would be unrecoverable after a crash.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// Allocates sequence numbers in submission order
pub struct SubmitManager {
    next: Mutex<u64>,
}

/// Holds the submission lock until the journal append is queued
pub struct SubmitGuard<'a> {
    _guard: MutexGuard<'a, u64>,
    pub seq: u64,
}

impl SubmitManager {
    #[must_use]
    pub fn new() -> Self {
        Self { next: Mutex::new(0) }
    }

    /// Reset the counter at mount to the last used sequence
    pub fn set_last_seq(&self, seq: u64) {
        *self.next.lock() = seq;
    }

    /// Allocate the next sequence. Keep the returned guard alive until the
    /// journal submission is queued, so sequence order and journal order
    /// never diverge.
    pub fn start(&self) -> SubmitGuard<'_> {
        let mut guard = self.next.lock();
        *guard += 1;
        let seq = *guard;
        SubmitGuard { _guard: guard, seq }
    }
}

impl Default for SubmitManager {
    fn default() -> Self {
        Self::new()
    }
}

struct AmState {
    /// Applies currently executing
    open_ops: u64,
    /// New applies are parked while a commit cycle quiesces
    blocked: bool,
    /// Sequences submitted but not yet fully applied
    unapplied: BTreeSet<u64>,
    max_submitted: u64,
    committing_seq: u64,
    committed_seq: u64,
}

/// Negotiates the apply/commit barrier
pub struct ApplyManager {
    state: Mutex<AmState>,
    /// Wakes applies parked on `blocked`
    blocked_cond: Condvar,
    /// Wakes the commit thread waiting for open applies to finish
    open_ops_cond: Condvar,
}

impl ApplyManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AmState {
                open_ops: 0,
                blocked: false,
                unapplied: BTreeSet::new(),
                max_submitted: 0,
                committing_seq: 0,
                committed_seq: 0,
            }),
            blocked_cond: Condvar::new(),
            open_ops_cond: Condvar::new(),
        }
    }

    /// Initialize sequence tracking at mount
    pub fn set_committed_seq(&self, seq: u64) {
        let mut st = self.state.lock();
        st.committed_seq = seq;
        st.committing_seq = seq;
        st.max_submitted = seq;
    }

    /// Record a newly submitted data op
    pub fn op_submitted(&self, seq: u64) {
        let mut st = self.state.lock();
        st.unapplied.insert(seq);
        st.max_submitted = st.max_submitted.max(seq);
    }

    /// Called by a worker right before applying; parks while a commit cycle
    /// is quiescing.
    pub fn op_apply_start(&self, seq: u64) {
        let mut st = self.state.lock();
        while st.blocked {
            trace!(seq, "apply parked behind commit");
            self.blocked_cond.wait(&mut st);
        }
        st.open_ops += 1;
    }

    /// Called by a worker once the transaction body has fully applied
    pub fn op_apply_finish(&self, seq: u64) {
        let mut st = self.state.lock();
        st.open_ops -= 1;
        st.unapplied.remove(&seq);
        if st.open_ops == 0 {
            self.open_ops_cond.notify_all();
        }
    }

    /// Quiesce applies and pick the commit point: the highest sequence with
    /// nothing unapplied at or below it. Returns `None` when that point has
    /// already been committed (callers still rewrite the op-seq file).
    /// Leaves applies blocked; pair with [`ApplyManager::commit_started`].
    pub fn commit_start(&self) -> Option<u64> {
        let mut st = self.state.lock();
        st.blocked = true;
        while st.open_ops > 0 {
            self.open_ops_cond.wait(&mut st);
        }
        let committable = match st.unapplied.first() {
            Some(&lowest) => lowest - 1,
            None => st.max_submitted,
        };
        if committable <= st.committed_seq {
            st.blocked = false;
            self.blocked_cond.notify_all();
            trace!(committed = st.committed_seq, "nothing new to commit");
            return None;
        }
        st.committing_seq = committable;
        debug!(committing = committable, "commit barrier reached");
        Some(committable)
    }

    /// The commit cycle has captured its snapshot; let applies run again
    pub fn commit_started(&self) {
        let mut st = self.state.lock();
        st.blocked = false;
        self.blocked_cond.notify_all();
    }

    /// The commit cycle reached stable storage
    pub fn commit_finish(&self) {
        let mut st = self.state.lock();
        st.committed_seq = st.committing_seq;
    }

    #[must_use]
    pub fn committed_seq(&self) -> u64 {
        self.state.lock().committed_seq
    }

    #[must_use]
    pub fn committing_seq(&self) -> u64 {
        self.state.lock().committing_seq
    }
}

impl Default for ApplyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_submit_guard_orders_sequences() {
        let sm = SubmitManager::new();
        sm.set_last_seq(10);
        let g1 = sm.start();
        assert_eq!(g1.seq, 11);
        drop(g1);
        assert_eq!(sm.start().seq, 12);
    }

    #[test]
    fn test_commit_point_excludes_unapplied_gap() {
        let am = ApplyManager::new();
        am.set_committed_seq(0);
        am.op_submitted(1);
        am.op_submitted(2);
        am.op_submitted(3);
        // 1 and 3 applied, 2 still outstanding
        am.op_apply_start(1);
        am.op_apply_finish(1);
        am.op_apply_start(3);
        am.op_apply_finish(3);
        assert_eq!(am.commit_start(), Some(1));
        am.commit_started();
        am.commit_finish();
        assert_eq!(am.committed_seq(), 1);

        // once 2 applies, the rest becomes committable
        am.op_apply_start(2);
        am.op_apply_finish(2);
        assert_eq!(am.commit_start(), Some(3));
        am.commit_started();
        am.commit_finish();
        assert_eq!(am.committed_seq(), 3);
    }

    #[test]
    fn test_commit_start_none_when_caught_up() {
        let am = ApplyManager::new();
        am.set_committed_seq(5);
        assert_eq!(am.commit_start(), None);
    }

    #[test]
    fn test_commit_waits_for_open_applies() {
        let am = Arc::new(ApplyManager::new());
        am.set_committed_seq(0);
        am.op_submitted(1);
        am.op_apply_start(1);

        let am2 = am.clone();
        let h = std::thread::spawn(move || {
            let cp = am2.commit_start();
            am2.commit_started();
            cp
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        am.op_apply_finish(1);
        assert_eq!(h.join().unwrap(), Some(1));
    }

    #[test]
    fn test_blocked_parks_new_applies() {
        let am = Arc::new(ApplyManager::new());
        am.set_committed_seq(0);
        am.op_submitted(1);
        am.op_apply_start(1);
        am.op_apply_finish(1);
        assert_eq!(am.commit_start(), Some(1));

        // an apply arriving during the quiesce parks until commit_started
        let am2 = am.clone();
        am.op_submitted(2);
        let h = std::thread::spawn(move || {
            am2.op_apply_start(2);
            am2.op_apply_finish(2);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        am.commit_started();
        h.join().unwrap();
        am.commit_finish();
        assert_eq!(am.committed_seq(), 1);
    }
}
