//! The one-experiment-at-a-time lock.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct LockState {
    held: Mutex<bool>,
    released: Condvar,
}

/// Shared handle passed to every experiment of a testbench.
///
/// Acquisition never blocks: a second run is rejected, not queued.
#[derive(Debug, Clone, Default)]
pub struct ExperimentLock {
    state: Arc<LockState>,
}

impl ExperimentLock {
    /// A free lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if it is free.
    pub fn try_acquire(&self) -> Option<ExperimentLockGuard> {
        let mut held = self.state.held.lock();
        if *held {
            return None;
        }
        *held = true;
        Some(ExperimentLockGuard {
            state: Arc::clone(&self.state),
        })
    }

    /// Whether a run holds the lock.
    pub fn is_locked(&self) -> bool {
        *self.state.held.lock()
    }

    /// Block until the lock is free or `timeout` passes. Returns `true` if free.
    pub fn wait_unlocked(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut held = self.state.held.lock();
        while *held {
            if self.state.released.wait_until(&mut held, deadline).timed_out() {
                return !*held;
            }
        }
        true
    }
}

/// Releases the lock on drop.
#[derive(Debug)]
pub struct ExperimentLockGuard {
    state: Arc<LockState>,
}

impl Drop for ExperimentLockGuard {
    fn drop(&mut self) {
        *self.state.held.lock() = false;
        self.state.released.notify_all();
    }
}
