//! Completion finishers
//!
//! Small single-threaded executors that run completion callbacks outside the
//! apply path. On-disk and on-readable callbacks get separate pools so an
//! expensive on-disk completion can never delay readability notifications.
//! Queued callbacks run strictly in queue order.

use crate::sequencer::Callback;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

struct FinisherState {
    queue: VecDeque<Callback>,
    running: bool,
    stop: bool,
}

struct Inner {
    state: Mutex<FinisherState>,
    work_cond: Condvar,
    empty_cond: Condvar,
}

/// One ordered callback runner
pub struct Finisher {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl Finisher {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(FinisherState {
                    queue: VecDeque::new(),
                    running: false,
                    stop: false,
                }),
                work_cond: Condvar::new(),
                empty_cond: Condvar::new(),
            }),
            handle: Mutex::new(None),
            name: name.into(),
        }
    }

    pub fn start(&self) {
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_loop(&inner))
            .expect("spawn finisher");
        *self.handle.lock() = Some(handle);
    }

    /// Drain the queue and join the thread
    pub fn stop(&self) {
        {
            let mut st = self.inner.state.lock();
            st.stop = true;
            self.inner.work_cond.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        self.inner.state.lock().stop = false;
    }

    pub fn queue(&self, cb: Callback) {
        let mut st = self.inner.state.lock();
        st.queue.push_back(cb);
        self.inner.work_cond.notify_one();
    }

    /// Wait until every queued callback has finished running
    pub fn wait_for_empty(&self) {
        let mut st = self.inner.state.lock();
        while !st.queue.is_empty() || st.running {
            self.inner.empty_cond.wait(&mut st);
        }
    }
}

fn run_loop(inner: &Arc<Inner>) {
    loop {
        let cb = {
            let mut st = inner.state.lock();
            loop {
                if let Some(cb) = st.queue.pop_front() {
                    st.running = true;
                    break cb;
                }
                if st.stop {
                    return;
                }
                inner.work_cond.wait(&mut st);
            }
        };
        cb();
        let mut st = inner.state.lock();
        st.running = false;
        if st.queue.is_empty() {
            inner.empty_cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_callbacks_run_in_order() {
        let f = Finisher::new("test-finisher");
        f.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = order.clone();
            f.queue(Box::new(move || order.lock().push(i)));
        }
        f.wait_for_empty();
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
        f.stop();
    }

    #[test]
    fn test_stop_drains_pending() {
        let f = Finisher::new("test-finisher");
        f.start();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let count = count.clone();
            f.queue(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        f.stop();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
