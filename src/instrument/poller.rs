//! Per-instrument polling thread.

use super::physical::Binding;
use super::vinstrument::VirtualInstrument;
use super::worker::{run_periodic, Worker};
use crate::error::AppResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Reads one instrument's getter at a fixed interval.
///
/// Each cycle first writes any deferred command, then reads the getter and
/// pushes the result through [`VirtualInstrument::set_value`]. A failing read
/// is logged and that cycle's sample is skipped.
#[derive(Debug)]
pub struct Poller {
    instrument: Arc<VirtualInstrument>,
    getter: Binding,
    interval: Duration,
    worker: Worker,
}

impl Poller {
    /// Create an idle poller.
    pub fn new(instrument: Arc<VirtualInstrument>, getter: Binding, interval: Duration) -> Self {
        let worker = Worker::new(format!("poll-{}", instrument.uid()));
        Self {
            instrument,
            getter,
            interval,
            worker,
        }
    }

    /// Polled instrument.
    pub fn instrument(&self) -> &Arc<VirtualInstrument> {
        &self.instrument
    }

    /// Polling period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one cycle on the calling thread.
    pub fn poll_once(&self) {
        poll_cycle(&self.instrument, &self.getter);
    }

    /// Spawn the polling thread.
    pub fn start(&self) -> AppResult<()> {
        let instrument = Arc::clone(&self.instrument);
        let getter = self.getter.clone();
        let interval = self.interval;
        let label = self.worker.name().to_string();
        self.worker.spawn(move |stop| {
            run_periodic(&label, interval, &stop, || poll_cycle(&instrument, &getter));
        })?;
        info!(
            instrument = %self.instrument.uid(),
            interval_ms = self.interval.as_millis() as u64,
            "Poller started"
        );
        Ok(())
    }

    /// Ask the thread to exit.
    pub fn signal_stop(&self) {
        self.worker.signal_stop();
    }

    /// Wait for the thread to exit.
    pub fn join(&self) -> AppResult<()> {
        self.worker.join()
    }

    /// Whether the thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}

fn poll_cycle(instrument: &VirtualInstrument, getter: &Binding) {
    if let Err(e) = instrument.flush_pending_command() {
        warn!(instrument = %instrument.uid(), error = %e, "Deferred command failed");
    }
    match getter.read_value() {
        Ok(value) => instrument.set_value(value),
        Err(e) => warn!(instrument = %instrument.uid(), error = %e, "Poll failed, sample skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::context::InstrumentContext;
    use crate::instrument::physical::{Arguments, PhysicalInstrument, Reading};
    use crate::instrument::vinstrument::InstrumentKind;
    use crate::value::Value;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Instant;

    struct Counter {
        reads: AtomicI64,
    }

    impl PhysicalInstrument for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn read(&self, _: &str, _: &Arguments) -> anyhow::Result<Reading> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n == 1 {
                anyhow::bail!("glitch");
            }
            Ok(Reading::Scalar(Value::Int(n)))
        }
        fn write(&self, _: &str, _: &Value, _: &Arguments) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn poller(interval: Duration) -> (Poller, Arc<Counter>) {
        let driver = Arc::new(Counter {
            reads: AtomicI64::new(0),
        });
        let inst = Arc::new(VirtualInstrument::new(
            "count",
            "Count",
            InstrumentKind::polling(None, false),
            InstrumentContext::default(),
        ));
        let getter = Binding::new(driver.clone(), "count", Arguments::new());
        (Poller::new(inst, getter, interval), driver)
    }

    #[test]
    fn failed_read_skips_sample() {
        let (poller, _) = poller(Duration::from_millis(10));
        poller.poll_once();
        poller.poll_once();
        assert_eq!(poller.instrument().value(), Value::Int(0));
        poller.poll_once();
        assert_eq!(poller.instrument().value(), Value::Int(2));
        assert_eq!(poller.instrument().rolling_points().len(), 2);
    }

    #[test]
    fn thread_polls_until_stopped() {
        let (poller, driver) = poller(Duration::from_millis(5));
        poller.start().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        let started = Instant::now();
        poller.signal_stop();
        poller.join().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(driver.reads.load(Ordering::SeqCst) > 3);
        assert!(!poller.is_running());
    }
}
