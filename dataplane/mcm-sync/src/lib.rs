//! `DataplaneAtomicUint64`: a lock-free two-slot 64-bit register built for
//! exactly one hotpath reader racing against many cooperating writers.
//!
//! Writers call [`DataplaneAtomicUint64::store_wait`] under a mutex and wait,
//! bounded by a timeout, for the hotpath to acknowledge the new value. The
//! hotpath calls [`DataplaneAtomicUint64::load_next`] to both read the
//! pending value and commit it as the current one — it must be the only
//! caller of that method, invoked twice per iteration so a `store_wait`
//! straddling the hotpath's critical section observes the commit. Ordinary
//! readers use [`DataplaneAtomicUint64::load`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Two-slot atomic register: `current` is what regular readers and the
/// hotpath observe; `next` is what writers publish before waiting for the
/// hotpath to commit it.
pub struct DataplaneAtomicUint64 {
    current: AtomicU64,
    next: AtomicU64,
    writers: Mutex<()>,
}

impl DataplaneAtomicUint64 {
    pub fn new(initial: u64) -> Self {
        Self {
            current: AtomicU64::new(initial),
            next: AtomicU64::new(initial),
            writers: Mutex::new(()),
        }
    }

    /// Returns the current committed value. Safe to call from any number of
    /// threads.
    pub fn load(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Publishes `value` and waits, polling every 5ms, until the hotpath
    /// commits it (observed via [`DataplaneAtomicUint64::load`] returning
    /// `value`) or `timeout` elapses. On timeout the value is committed
    /// directly so that `load() == value` holds unconditionally once this
    /// call returns.
    ///
    /// Serialized across writers by an internal mutex: only one writer is
    /// ever waiting on a publish at a time.
    pub fn store_wait(&self, value: u64, timeout: Duration) {
        let _guard = self.writers.lock();

        self.next.store(value, Ordering::Release);

        let deadline = Instant::now() + timeout;
        loop {
            if self.current.load(Ordering::Acquire) == value {
                return;
            }
            if Instant::now() >= deadline {
                self.current.store(value, Ordering::Release);
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Reads the pending value and commits it as current. Must be called by
    /// exactly one hotpath thread, twice per iteration (once on entry, once
    /// on exit), never concurrently with another `load_next` call.
    pub fn load_next(&self) -> u64 {
        let value = self.next.load(Ordering::Acquire);
        self.current.store(value, Ordering::Release);
        value
    }
}

impl Default for DataplaneAtomicUint64 {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn load_reflects_initial_value() {
        let v = DataplaneAtomicUint64::new(7);
        assert_eq!(v.load(), 7);
    }

    #[test]
    fn load_next_commits_pending_value() {
        let v = DataplaneAtomicUint64::new(0);
        v.store_wait(567, Duration::from_millis(5));
        assert_eq!(v.load_next(), 567);
        assert_eq!(v.load(), 567);
    }

    #[test]
    fn store_wait_returns_once_hotpath_commits() {
        let v = Arc::new(DataplaneAtomicUint64::new(0));
        let hotpath = {
            let v = v.clone();
            thread::spawn(move || {
                // Simulate a hotpath iteration arriving shortly after the
                // writer publishes.
                thread::sleep(Duration::from_millis(20));
                v.load_next();
                thread::sleep(Duration::from_millis(20));
                v.load_next();
            })
        };

        let start = Instant::now();
        v.store_wait(99, Duration::from_secs(5));
        let elapsed = start.elapsed();

        hotpath.join().unwrap();
        assert_eq!(v.load(), 99);
        assert!(elapsed < Duration::from_secs(1), "writer should not block for the full timeout");
    }

    #[test]
    fn store_wait_times_out_and_commits_directly() {
        let v = DataplaneAtomicUint64::new(0);
        let start = Instant::now();
        v.store_wait(5, Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(v.load(), 5);
    }
}
