//! Composite instruments computed from other instruments.
//!
//! A [`CompositeUpdater`] registers itself as a dependant of each source. Every
//! source value change releases its semaphore; the updater thread wakes,
//! recomputes the composition over the current source values and publishes
//! the result on the composite instrument. Bursts of source updates coalesce
//! into one recomputation.

use super::vinstrument::VirtualInstrument;
use super::worker::Worker;
use crate::error::{AppResult, TestbenchError};
use crate::signal::Semaphore;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Combines source values into one value.
pub type CompositionFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

fn numeric(values: &[Value]) -> anyhow::Result<Vec<f64>> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_f64()
                .ok_or_else(|| anyhow::anyhow!("source {i} has no numeric value ({v})"))
        })
        .collect()
}

fn pair(values: &[Value]) -> anyhow::Result<(f64, f64)> {
    match numeric(values)?.as_slice() {
        [a, b] => Ok((*a, *b)),
        other => anyhow::bail!("expected exactly 2 sources, got {}", other.len()),
    }
}

fn nonempty(values: &[Value]) -> anyhow::Result<Vec<f64>> {
    let xs = numeric(values)?;
    if xs.is_empty() {
        anyhow::bail!("no sources");
    }
    Ok(xs)
}

/// Look up a built-in composition by name.
///
/// `mean`, `sum`, `product`, `min` and `max` take any number of sources;
/// `difference` (a - b) and `ratio` (a / b) take exactly two.
pub fn builtin(name: &str) -> Option<CompositionFn> {
    let f: CompositionFn = match name {
        "mean" => Arc::new(|v: &[Value]| {
            let xs = nonempty(v)?;
            Ok(Value::Float(xs.iter().sum::<f64>() / xs.len() as f64))
        }),
        "sum" => Arc::new(|v: &[Value]| Ok(Value::Float(numeric(v)?.iter().sum()))),
        "product" => Arc::new(|v: &[Value]| Ok(Value::Float(numeric(v)?.iter().product()))),
        "min" => Arc::new(|v: &[Value]| {
            Ok(Value::Float(nonempty(v)?.into_iter().fold(f64::INFINITY, f64::min)))
        }),
        "max" => Arc::new(|v: &[Value]| {
            Ok(Value::Float(
                nonempty(v)?.into_iter().fold(f64::NEG_INFINITY, f64::max),
            ))
        }),
        "difference" => Arc::new(|v: &[Value]| {
            let (a, b) = pair(v)?;
            Ok(Value::Float(a - b))
        }),
        "ratio" => Arc::new(|v: &[Value]| {
            let (a, b) = pair(v)?;
            if b == 0.0 {
                anyhow::bail!("division by zero");
            }
            Ok(Value::Float(a / b))
        }),
        _ => return None,
    };
    Some(f)
}

/// Background recomputation of one composite instrument.
pub struct CompositeUpdater {
    instrument: Arc<VirtualInstrument>,
    sources: Vec<Arc<VirtualInstrument>>,
    function: CompositionFn,
    wake: Arc<Semaphore>,
    worker: Worker,
}

impl fmt::Debug for CompositeUpdater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeUpdater")
            .field("instrument", &self.instrument.uid())
            .field(
                "sources",
                &self.sources.iter().map(|s| s.uid()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CompositeUpdater {
    /// Register on every source. The thread is not started.
    pub fn new(
        instrument: Arc<VirtualInstrument>,
        sources: Vec<Arc<VirtualInstrument>>,
        function: CompositionFn,
    ) -> AppResult<Self> {
        if sources.is_empty() {
            return Err(TestbenchError::Configuration(format!(
                "composite '{}' has no sources",
                instrument.uid()
            )));
        }
        let wake = Arc::new(Semaphore::new(0));
        for source in &sources {
            source.add_dependant(instrument.uid(), &wake);
        }
        let worker = Worker::new(format!("composite-{}", instrument.uid()));
        Ok(Self {
            instrument,
            sources,
            function,
            wake,
            worker,
        })
    }

    /// Composite instrument.
    pub fn instrument(&self) -> &Arc<VirtualInstrument> {
        &self.instrument
    }

    /// Recompute on the calling thread.
    pub fn recompute(&self) {
        recompute(&self.instrument, &self.sources, &self.function);
    }

    /// Spawn the updater thread. An initial computation runs immediately.
    pub fn start(&self) -> AppResult<()> {
        let instrument = Arc::clone(&self.instrument);
        let sources = self.sources.clone();
        let function = Arc::clone(&self.function);
        let wake = Arc::clone(&self.wake);
        self.worker.spawn(move |stop| loop {
            wake.acquire();
            if stop.is_set() {
                break;
            }
            wake.drain();
            recompute(&instrument, &sources, &function);
        })?;
        self.wake.release();
        info!(
            instrument = %self.instrument.uid(),
            sources = self.sources.len(),
            "Composite updater started"
        );
        Ok(())
    }

    /// Ask the thread to exit.
    pub fn signal_stop(&self) {
        self.worker.signal_stop();
        self.wake.release();
    }

    /// Wait for the thread to exit.
    pub fn join(&self) -> AppResult<()> {
        self.worker.join()
    }

    /// Unregister from every source.
    pub fn detach(&self) {
        for source in &self.sources {
            source.remove_dependant(self.instrument.uid());
        }
    }
}

fn recompute(instrument: &VirtualInstrument, sources: &[Arc<VirtualInstrument>], function: &CompositionFn) {
    let values: Vec<Value> = sources.iter().map(|s| s.value()).collect();
    match function(&values) {
        Ok(value) => instrument.set_value(value),
        Err(e) => {
            warn!(instrument = %instrument.uid(), error = %e, "Composition failed");
            instrument.set_value(Value::None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::context::InstrumentContext;
    use crate::instrument::vinstrument::InstrumentKind;
    use std::time::{Duration, Instant};

    fn manual(uid: &str) -> Arc<VirtualInstrument> {
        Arc::new(VirtualInstrument::new(
            uid,
            uid,
            InstrumentKind::Manual,
            InstrumentContext::default(),
        ))
    }

    fn wait_for(inst: &VirtualInstrument, expected: Value) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if inst.value() == expected {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn builtins() {
        let v = [Value::Int(2), Value::Float(6.0)];
        let call = |name: &str| builtin(name).unwrap()(&v).unwrap();
        assert_eq!(call("mean"), Value::Float(4.0));
        assert_eq!(call("sum"), Value::Float(8.0));
        assert_eq!(call("product"), Value::Float(12.0));
        assert_eq!(call("min"), Value::Float(2.0));
        assert_eq!(call("max"), Value::Float(6.0));
        assert_eq!(call("difference"), Value::Float(-4.0));
        assert_eq!(call("ratio"), Value::Float(1.0 / 3.0));
        assert!(builtin("median").is_none());
        assert!(builtin("mean").unwrap()(&[Value::None]).is_err());
    }

    #[test]
    fn follows_sources_and_falls_back_to_none() {
        let a = manual("a");
        let b = manual("b");
        let avg = manual("avg");
        let updater = CompositeUpdater::new(
            avg.clone(),
            vec![a.clone(), b.clone()],
            builtin("mean").unwrap(),
        )
        .unwrap();
        updater.start().unwrap();

        a.set_value(Value::Float(4.0));
        b.set_value(Value::Float(10.0));
        assert!(wait_for(&avg, Value::Float(7.0)));

        b.set_value(Value::Str("overload".into()));
        assert!(wait_for(&avg, Value::None));

        updater.signal_stop();
        updater.join().unwrap();
        updater.detach();
        assert_eq!(a.dependant_count(), 0);
    }
}
