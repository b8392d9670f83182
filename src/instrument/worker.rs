//! Background worker threads.
//!
//! Pollers, batchers and composite updaters each own one OS thread. A
//! [`Worker`] holds the join handle and the stop signal so that shutdown can
//! signal every thread first and join them afterwards.

use crate::error::{AppResult, TestbenchError};
use crate::signal::StopSignal;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// A named, restartable background thread.
#[derive(Debug)]
pub struct Worker {
    name: String,
    stop: Arc<StopSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Create an idle worker. `name` becomes the thread name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stop: Arc::new(StopSignal::new()),
            handle: Mutex::new(None),
        }
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the thread. Fails if the previous thread has not been joined.
    pub fn spawn<F>(&self, body: F) -> AppResult<()>
    where
        F: FnOnce(Arc<StopSignal>) + Send + 'static,
    {
        let mut slot = self.handle.lock();
        if slot.is_some() {
            return Err(TestbenchError::Worker(format!(
                "{} is already running",
                self.name
            )));
        }
        self.stop.clear();
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || body(stop))?;
        *slot = Some(handle);
        debug!(worker = %self.name, "Spawned worker thread");
        Ok(())
    }

    /// Whether a thread is spawned and has not exited.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Ask the thread to exit. Does not wait.
    pub fn signal_stop(&self) {
        self.stop.set();
    }

    /// Whether a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.is_set()
    }

    /// Wait for the thread to exit. A no-op when nothing was spawned.
    pub fn join(&self) -> AppResult<()> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        handle.join().map_err(|panic| {
            let message = panic_message(panic.as_ref());
            error!(worker = %self.name, panic = %message, "Worker thread panicked");
            TestbenchError::Worker(format!("{} panicked: {}", self.name, message))
        })
    }

    /// Signal and join.
    pub fn stop(&self) -> AppResult<()> {
        self.signal_stop();
        self.join()
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `cycle` every `interval` until `stop` is set.
///
/// A cycle that overruns its interval is logged and the next cycle starts
/// immediately; no sleep is inserted to catch up.
pub fn run_periodic(label: &str, interval: Duration, stop: &StopSignal, mut cycle: impl FnMut()) {
    while !stop.is_set() {
        let deadline = Instant::now() + interval;
        cycle();
        let now = Instant::now();
        if now >= deadline {
            warn!(
                worker = label,
                overrun_ms = (now - deadline).as_secs_f64() * 1e3,
                interval_ms = interval.as_secs_f64() * 1e3,
                "Missed polling interval"
            );
            continue;
        }
        if stop.wait_until(deadline) {
            break;
        }
    }
    debug!(worker = label, "Worker loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn periodic_loop_stops_promptly() {
        let worker = Worker::new("ticker");
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        worker
            .spawn(move |stop| {
                run_periodic("ticker", Duration::from_millis(5), &stop, || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .unwrap();
        thread::sleep(Duration::from_millis(40));
        let started = Instant::now();
        worker.stop().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert!(!worker.is_running());
    }

    #[test]
    fn double_spawn_is_rejected() {
        let worker = Worker::new("once");
        worker.spawn(|stop| stop.wait()).unwrap();
        assert!(worker.spawn(|_| {}).is_err());
        worker.stop().unwrap();
        // Joined workers can be restarted.
        worker.spawn(|_| {}).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn panics_surface_on_join() {
        let worker = Worker::new("boom");
        worker.spawn(|_| panic!("driver exploded")).unwrap();
        let err = worker.join().unwrap_err().to_string();
        assert!(err.contains("driver exploded"));
    }
}
