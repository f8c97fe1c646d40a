//! Thread watchdog
//!
//! Worker threads and the commit thread register a heartbeat with their own
//! timeout; a monitor thread aborts the whole process when any heartbeat
//! expires. The engine prefers crash-and-replay over silent stalls or
//! corruption. Heartbeats are suspended around legitimate blocking waits
//! (admission throttle, writeback throttle, sync cond).

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::error;

struct Entry {
    name: String,
    timeout: Duration,
    /// None while suspended
    deadline: Option<Instant>,
}

struct WdState {
    entries: HashMap<u64, Entry>,
    next_id: u64,
    stop: bool,
}

struct Inner {
    state: Mutex<WdState>,
    cond: Condvar,
}

/// Process-wide watchdog; owns the monitor thread
pub struct Watchdog {
    inner: Arc<Inner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(WdState {
                    entries: HashMap::new(),
                    next_id: 0,
                    stop: false,
                }),
                cond: Condvar::new(),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Start the monitor thread
    pub fn start(&self) {
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("objectfs-watchdog".into())
            .spawn(move || monitor_loop(&inner))
            .expect("spawn watchdog");
        *self.monitor.lock() = Some(handle);
    }

    /// Stop and join the monitor thread
    pub fn stop(&self) {
        {
            let mut st = self.inner.state.lock();
            st.stop = true;
            self.inner.cond.notify_all();
        }
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }
        self.inner.state.lock().stop = false;
    }

    /// Register a heartbeat for the calling thread. A zero timeout returns a
    /// heartbeat the monitor never checks.
    pub fn register(&self, name: &str, timeout: Duration) -> Heartbeat {
        let mut st = self.inner.state.lock();
        let id = st.next_id;
        st.next_id += 1;
        if !timeout.is_zero() {
            st.entries.insert(
                id,
                Entry {
                    name: name.to_string(),
                    timeout,
                    deadline: Some(Instant::now() + timeout),
                },
            );
        }
        Heartbeat {
            inner: self.inner.clone(),
            id,
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII heartbeat registration; dropping it unregisters the thread
pub struct Heartbeat {
    inner: Arc<Inner>,
    id: u64,
}

impl Heartbeat {
    /// Push the deadline out by the registered timeout
    pub fn reset(&self) {
        let mut st = self.inner.state.lock();
        if let Some(e) = st.entries.get_mut(&self.id) {
            e.deadline = Some(Instant::now() + e.timeout);
        }
    }

    /// Stop deadline checks while blocked on a legitimate wait
    pub fn suspend(&self) {
        let mut st = self.inner.state.lock();
        if let Some(e) = st.entries.get_mut(&self.id) {
            e.deadline = None;
        }
    }

    /// Resume deadline checks after a blocking wait
    pub fn resume(&self) {
        self.reset();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.inner.state.lock().entries.remove(&self.id);
    }
}

fn monitor_loop(inner: &Arc<Inner>) {
    let mut st = inner.state.lock();
    loop {
        if st.stop {
            return;
        }
        let now = Instant::now();
        for e in st.entries.values() {
            if let Some(deadline) = e.deadline {
                if now >= deadline {
                    error!(
                        thread = %e.name,
                        timeout_secs = e.timeout.as_secs_f64(),
                        "watchdog expired, aborting"
                    );
                    std::process::abort();
                }
            }
        }
        inner
            .cond
            .wait_for(&mut st, Duration::from_millis(250));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_drop() {
        let wd = Watchdog::new();
        wd.start();
        {
            let hb = wd.register("worker", Duration::from_secs(60));
            hb.reset();
            hb.suspend();
            hb.resume();
        }
        assert!(wd.inner.state.lock().entries.is_empty());
        wd.stop();
    }

    #[test]
    fn test_zero_timeout_never_tracked() {
        let wd = Watchdog::new();
        let _hb = wd.register("worker", Duration::ZERO);
        assert!(wd.inner.state.lock().entries.is_empty());
    }

    #[test]
    fn test_suspend_clears_deadline() {
        let wd = Watchdog::new();
        let hb = wd.register("worker", Duration::from_secs(60));
        hb.suspend();
        let st = wd.inner.state.lock();
        assert!(st.entries.values().all(|e| e.deadline.is_none()));
    }
}
