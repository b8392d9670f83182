//! Thread coordination primitives.
//!
//! Every worker in the testbench (pollers, batchers, composite updaters and the
//! experiment runner thread) is a plain OS thread. They are stopped through a
//! [`StopSignal`] which doubles as an interruptible sleep, and composite
//! updaters block on a [`Semaphore`] released by their source instruments.
//!
//! Both use `parking_lot` primitives (no lock poisoning, no async context needed).

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A latched boolean flag that sleeping threads can wait on.
///
/// `wait_timeout` returns early as soon as the flag is set, which is what makes
/// polling loops and segment sleeps stop promptly.
#[derive(Debug, Default)]
pub struct StopSignal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    /// Create an unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter.
    pub fn set(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cond.notify_all();
    }

    /// Clear the flag so the signal can be reused for the next run.
    pub fn clear(&self) {
        *self.flag.lock() = false;
    }

    /// Whether the flag is set.
    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Sleep for at most `timeout`. Returns `true` if the flag was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Sleep until `deadline`. Returns `true` if the flag was set.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut flag = self.flag.lock();
        while !*flag {
            if self.cond.wait_until(&mut flag, deadline).timed_out() {
                return *flag;
            }
        }
        true
    }

    /// Block until the flag is set.
    pub fn wait(&self) {
        let mut flag = self.flag.lock();
        while !*flag {
            self.cond.wait(&mut flag);
        }
    }
}

/// Counting semaphore.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore with `permits` initial permits.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Add one permit and wake one waiter.
    pub fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.cond.notify_one();
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Take a permit, waiting at most `timeout`. Returns `false` on timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.cond.wait_until(&mut permits, deadline).timed_out() && *permits == 0 {
                return false;
            }
        }
        *permits -= 1;
        true
    }

    /// Take every available permit without blocking. Returns how many were taken.
    pub fn drain(&self) -> usize {
        let mut permits = self.permits.lock();
        std::mem::take(&mut *permits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn stop_signal_interrupts_wait() {
        let signal = Arc::new(StopSignal::new());
        let waiter = Arc::clone(&signal);
        let start = Instant::now();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        signal.set();
        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stop_signal_times_out_when_unset() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
        signal.set();
        assert!(signal.is_set());
        signal.clear();
        assert!(!signal.is_set());
    }

    #[test]
    fn semaphore_counts_permits() {
        let sem = Semaphore::new(0);
        assert!(!sem.acquire_timeout(Duration::from_millis(5)));
        sem.release();
        sem.release();
        assert!(sem.acquire_timeout(Duration::from_millis(5)));
        assert_eq!(sem.drain(), 1);
        assert!(!sem.acquire_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn semaphore_wakes_blocked_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let worker = Arc::clone(&sem);
        let handle = thread::spawn(move || worker.acquire());
        thread::sleep(Duration::from_millis(10));
        sem.release();
        handle.join().unwrap();
    }
}
