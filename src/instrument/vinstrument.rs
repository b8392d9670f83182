//! Virtual instruments.
//!
//! A [`VirtualInstrument`] is one named, typed channel of the apparatus. It keeps
//! the latest value, a rolling display recorder and any number of named
//! recordings. Every variant shares the same value path ([`VirtualInstrument::set_value`]);
//! they differ in where values come from and whether they accept commands,
//! which is captured by [`InstrumentKind`].

use super::context::InstrumentContext;
use super::physical::Binding;
use crate::error::{AppResult, TestbenchError};
use crate::recording::{
    notify_observer, now_seconds, NamedRecording, Recorder, RecorderConfig, Sample, SampleUpdate,
};
use crate::signal::Semaphore;
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// How an instrument obtains values and handles commands.
pub enum InstrumentKind {
    /// Periodically read by a poller. Commands go to `setter`, either
    /// immediately or on the next poll cycle when `defer` is set.
    Polling {
        /// Setter binding, if the channel is writable
        setter: Option<Binding>,
        /// Queue commands for the poller thread
        defer: bool,
        /// Most recent deferred command
        pending: Mutex<Option<Value>>,
    },
    /// No poller: the value is refreshed by reading `getter` after each command.
    CommandDriven {
        /// Setter binding
        setter: Binding,
        /// Getter used to refresh the value
        getter: Binding,
    },
    /// One channel of a batcher; values arrive from the batch read.
    Batched {
        /// Setter binding, if the channel is writable
        setter: Option<Binding>,
    },
    /// Computed from other instruments by a composite updater.
    Composite,
    /// Value typed in by an operator.
    Manual,
    /// Accepts and discards commands. Stands in for absent hardware.
    Null,
    /// Published by the experiment sequencer.
    ExperimentStatus,
}

impl InstrumentKind {
    /// A polling channel with an optional setter.
    pub fn polling(setter: Option<Binding>, defer: bool) -> Self {
        InstrumentKind::Polling {
            setter,
            defer,
            pending: Mutex::new(None),
        }
    }

    /// Short label used in logs and errors.
    pub fn label(&self) -> &'static str {
        match self {
            InstrumentKind::Polling { .. } => "polling",
            InstrumentKind::CommandDriven { .. } => "command_driven",
            InstrumentKind::Batched { .. } => "batched",
            InstrumentKind::Composite => "composite",
            InstrumentKind::Manual => "manual",
            InstrumentKind::Null => "null",
            InstrumentKind::ExperimentStatus => "experiment_status",
        }
    }
}

impl fmt::Debug for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

struct InstrumentState {
    value: Value,
    rolling: Recorder,
    recordings: HashMap<String, NamedRecording>,
}

struct Dependant {
    uid: String,
    wake: Weak<Semaphore>,
}

/// One channel of the apparatus.
pub struct VirtualInstrument {
    uid: String,
    name: String,
    unit: Option<String>,
    kind: InstrumentKind,
    context: InstrumentContext,
    state: Mutex<InstrumentState>,
    dependants: Mutex<Vec<Dependant>>,
}

impl fmt::Debug for VirtualInstrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualInstrument")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("value", &self.value())
            .finish()
    }
}

impl VirtualInstrument {
    /// Create an instrument with an empty value.
    pub fn new(
        uid: impl Into<String>,
        name: impl Into<String>,
        kind: InstrumentKind,
        context: InstrumentContext,
    ) -> Self {
        let mut rolling = Recorder::new(RecorderConfig::rolling(context.rolling_samples));
        rolling.start();
        Self {
            uid: uid.into(),
            name: name.into(),
            unit: None,
            kind,
            context,
            state: Mutex::new(InstrumentState {
                value: Value::None,
                rolling,
                recordings: HashMap::new(),
            }),
            dependants: Mutex::new(Vec::new()),
        }
    }

    /// Set the display unit.
    pub fn with_unit(mut self, unit: Option<String>) -> Self {
        self.unit = unit;
        self
    }

    /// Unique id within the apparatus.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display unit.
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Variant.
    pub fn kind(&self) -> &InstrumentKind {
        &self.kind
    }

    /// Latest value.
    pub fn value(&self) -> Value {
        self.state.lock().value.clone()
    }

    /// Store a new value and fan it out.
    ///
    /// The value goes to the rolling recorder and to every running named
    /// recording (recordings that hit their limits are stopped instead), the
    /// display observer is told about each change, and dependant composites
    /// are woken. Runs on the thread that produced the value.
    pub fn set_value(&self, value: Value) {
        let time = now_seconds();
        let segment = self.context.active_segment.current();
        let mut updates: Vec<(Option<String>, SampleUpdate)> = Vec::new();
        {
            let mut state = self.state.lock();
            state.value = value.clone();
            if let Some(v) = value.as_f64() {
                updates.push((None, state.rolling.add_sample(v, Some(time))));
            }
            for (record_id, recording) in state.recordings.iter_mut() {
                if !recording.recorder.is_recording() {
                    continue;
                }
                if !recording.recorder.active() {
                    info!(
                        instrument = %self.uid,
                        record = %record_id,
                        samples = recording.recorder.raw_count(),
                        "Recording reached its limit, stopping"
                    );
                    recording.stop();
                    continue;
                }
                if let Some(update) = recording.record(&self.uid, record_id, &value, time, &segment)
                {
                    updates.push((Some(record_id.clone()), update));
                }
            }
        }

        if let Some(observer) = self.context.observer.as_deref() {
            for (record_id, update) in updates {
                notify_observer(observer, &self.uid, record_id.as_deref(), update);
            }
        }

        self.wake_dependants();
    }

    /// Send a command to the instrument.
    ///
    /// Polling instruments with `defer` set queue the command for the poller
    /// thread; command-driven instruments refresh their value from the getter
    /// once the setter returns.
    pub fn command(&self, value: impl Into<Value>) -> AppResult<()> {
        let value = value.into();
        debug!(instrument = %self.uid, value = %value, "Command");
        match &self.kind {
            InstrumentKind::Polling {
                setter: Some(setter),
                defer,
                pending,
            } => {
                if *defer {
                    *pending.lock() = Some(value);
                    Ok(())
                } else {
                    setter.write(&value)
                }
            }
            InstrumentKind::CommandDriven { setter, getter } => {
                setter.write(&value)?;
                let refreshed = getter.read_value()?;
                self.set_value(refreshed);
                Ok(())
            }
            InstrumentKind::Batched {
                setter: Some(setter),
            } => setter.write(&value),
            InstrumentKind::Null => Ok(()),
            _ => Err(self.unsupported()),
        }
    }

    /// Take the queued deferred command, if any.
    pub fn take_pending_command(&self) -> Option<Value> {
        match &self.kind {
            InstrumentKind::Polling { pending, .. } => pending.lock().take(),
            _ => None,
        }
    }

    /// Write a queued deferred command to the setter. Called by the poller.
    pub fn flush_pending_command(&self) -> AppResult<()> {
        let Some(value) = self.take_pending_command() else {
            return Ok(());
        };
        match &self.kind {
            InstrumentKind::Polling {
                setter: Some(setter),
                ..
            } => setter.write(&value),
            _ => Ok(()),
        }
    }

    /// Operator entry for manual instruments.
    pub fn set_manual_value(&self, value: impl Into<Value>) -> AppResult<()> {
        match self.kind {
            InstrumentKind::Manual => {
                self.set_value(value.into());
                Ok(())
            }
            _ => Err(self.unsupported()),
        }
    }

    fn unsupported(&self) -> TestbenchError {
        TestbenchError::UnsupportedCommand {
            uid: self.uid.clone(),
            name: self.name.clone(),
            kind: self.kind.label(),
        }
    }

    // --- dependants ---

    /// Register a composite to be woken on every value change.
    pub fn add_dependant(&self, uid: &str, wake: &Arc<Semaphore>) {
        let mut dependants = self.dependants.lock();
        dependants.retain(|d| d.uid != uid);
        dependants.push(Dependant {
            uid: uid.to_string(),
            wake: Arc::downgrade(wake),
        });
    }

    /// Remove a composite registration.
    pub fn remove_dependant(&self, uid: &str) {
        self.dependants.lock().retain(|d| d.uid != uid);
    }

    /// Number of registered composites still alive.
    pub fn dependant_count(&self) -> usize {
        self.dependants
            .lock()
            .iter()
            .filter(|d| d.wake.strong_count() > 0)
            .count()
    }

    fn wake_dependants(&self) {
        let mut dependants = self.dependants.lock();
        dependants.retain(|d| match d.wake.upgrade() {
            Some(wake) => {
                wake.release();
                true
            }
            None => false,
        });
    }

    // --- recordings ---

    /// Start a named recording with the default retention, replacing any
    /// recording with the same id.
    pub fn begin_recording(
        &self,
        record_id: &str,
        record_name: &str,
        file_path: Option<&Path>,
    ) -> AppResult<()> {
        let config = RecorderConfig::downsampling(self.context.stored_samples);
        self.begin_recording_with(record_id, record_name, config, file_path)
    }

    /// Start a named recording with an explicit recorder configuration.
    pub fn begin_recording_with(
        &self,
        record_id: &str,
        record_name: &str,
        config: RecorderConfig,
        file_path: Option<&Path>,
    ) -> AppResult<()> {
        let recording = NamedRecording::begin(record_name, config, file_path)?;
        let mut state = self.state.lock();
        if let Some(mut previous) = state.recordings.insert(record_id.to_string(), recording) {
            previous.stop();
            warn!(instrument = %self.uid, record = record_id, "Replaced existing recording");
        }
        info!(
            instrument = %self.uid,
            record = record_id,
            file = ?file_path,
            "Recording started"
        );
        Ok(())
    }

    /// Resume a stopped recording, appending to its file.
    pub fn resume_recording(&self, record_id: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        let recording = state
            .recordings
            .get_mut(record_id)
            .ok_or_else(|| self.no_recording(record_id))?;
        recording.resume()?;
        info!(instrument = %self.uid, record = record_id, "Recording resumed");
        Ok(())
    }

    /// Stop a recording and close its file. The in-memory series is kept.
    pub fn stop_recording(&self, record_id: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        let recording = state
            .recordings
            .get_mut(record_id)
            .ok_or_else(|| self.no_recording(record_id))?;
        recording.stop();
        info!(instrument = %self.uid, record = record_id, "Recording stopped");
        Ok(())
    }

    /// Stop every recording. Used at shutdown.
    pub fn stop_all_recordings(&self) {
        let mut state = self.state.lock();
        for recording in state.recordings.values_mut() {
            recording.stop();
        }
    }

    /// Whether a recording with this id was ever started.
    pub fn recording_exists(&self, record_id: &str) -> bool {
        self.state.lock().recordings.contains_key(record_id)
    }

    /// Whether the recording is currently accepting samples.
    pub fn is_recording(&self, record_id: &str) -> bool {
        self.state
            .lock()
            .recordings
            .get(record_id)
            .is_some_and(|r| r.recorder.is_recording())
    }

    /// File backing a recording.
    pub fn recording_file(&self, record_id: &str) -> Option<PathBuf> {
        self.state
            .lock()
            .recordings
            .get(record_id)
            .and_then(|r| r.file_path().map(Path::to_path_buf))
    }

    /// Stored points of a recording.
    pub fn recording_points(&self, record_id: &str) -> Option<Vec<Sample>> {
        self.state
            .lock()
            .recordings
            .get(record_id)
            .map(|r| r.recorder.points())
    }

    /// Ids of every recording on this instrument.
    pub fn recording_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().recordings.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Points of the rolling display recorder.
    pub fn rolling_points(&self) -> Vec<Sample> {
        self.state.lock().rolling.points()
    }

    fn no_recording(&self, record_id: &str) -> TestbenchError {
        TestbenchError::Recording(format!(
            "{} has no recording '{}'",
            self.uid, record_id
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::physical::{Arguments, PhysicalInstrument, Reading};
    use tempfile::tempdir;

    #[derive(Default)]
    struct Loopback {
        value: Mutex<Value>,
        writes: Mutex<Vec<Value>>,
    }

    impl PhysicalInstrument for Loopback {
        fn name(&self) -> &str {
            "loopback"
        }
        fn read(&self, _: &str, _: &Arguments) -> anyhow::Result<Reading> {
            Ok(Reading::Scalar(self.value.lock().clone()))
        }
        fn write(&self, _: &str, value: &Value, _: &Arguments) -> anyhow::Result<()> {
            *self.value.lock() = value.clone();
            self.writes.lock().push(value.clone());
            Ok(())
        }
    }

    fn binding(driver: &Arc<Loopback>) -> Binding {
        Binding::new(driver.clone(), "value", Arguments::new())
    }

    #[test]
    fn manual_value_reaches_recordings() {
        let dir = tempdir().unwrap();
        let inst = VirtualInstrument::new(
            "operator",
            "Operator",
            InstrumentKind::Manual,
            InstrumentContext::default(),
        );
        inst.active_segment_for_test("leak_check");
        let path = dir.path().join("operator.csv");
        inst.begin_recording("notes", "Notes", Some(&path)).unwrap();
        inst.set_manual_value(3.5).unwrap();
        inst.stop_recording("notes").unwrap();

        assert_eq!(inst.value(), Value::Float(3.5));
        assert_eq!(inst.rolling_points().len(), 1);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.lines().nth(1).unwrap().ends_with(",3.5,leak_check"));
    }

    #[test]
    fn unsupported_commands_name_the_instrument() {
        let inst = VirtualInstrument::new(
            "avg",
            "Average",
            InstrumentKind::Composite,
            InstrumentContext::default(),
        );
        let err = inst.command(1.0).unwrap_err().to_string();
        assert!(err.contains("Average"));
        assert!(err.contains("composite"));
        assert!(inst.set_manual_value(1.0).is_err());
    }

    #[test]
    fn command_driven_refreshes_from_getter() {
        let driver = Arc::new(Loopback::default());
        let inst = VirtualInstrument::new(
            "valve",
            "Valve",
            InstrumentKind::CommandDriven {
                setter: binding(&driver),
                getter: binding(&driver),
            },
            InstrumentContext::default(),
        );
        inst.command(true).unwrap();
        assert_eq!(inst.value(), Value::Bool(true));
    }

    #[test]
    fn deferred_commands_wait_for_flush() {
        let driver = Arc::new(Loopback::default());
        let inst = VirtualInstrument::new(
            "heater",
            "Heater",
            InstrumentKind::polling(Some(binding(&driver)), true),
            InstrumentContext::default(),
        );
        inst.command(10.0).unwrap();
        inst.command(20.0).unwrap();
        assert!(driver.writes.lock().is_empty());
        inst.flush_pending_command().unwrap();
        assert_eq!(*driver.writes.lock(), vec![Value::Float(20.0)]);
    }

    #[test]
    fn dependants_are_released_and_pruned() {
        let inst = VirtualInstrument::new(
            "src",
            "Source",
            InstrumentKind::Manual,
            InstrumentContext::default(),
        );
        let wake = Arc::new(Semaphore::new(0));
        inst.add_dependant("avg", &wake);
        inst.set_value(Value::Int(1));
        assert_eq!(wake.drain(), 1);

        drop(wake);
        inst.set_value(Value::Int(2));
        assert_eq!(inst.dependant_count(), 0);
    }

    #[test]
    fn capped_recording_stops_itself() {
        let inst = VirtualInstrument::new(
            "src",
            "Source",
            InstrumentKind::Manual,
            InstrumentContext::default(),
        );
        inst.begin_recording_with(
            "short",
            "Short",
            RecorderConfig::downsampling(10).with_max_samples(2),
            None,
        )
        .unwrap();
        for i in 0..5 {
            inst.set_value(Value::Int(i));
        }
        assert!(!inst.is_recording("short"));
        assert_eq!(inst.recording_points("short").unwrap().len(), 2);
    }

    impl VirtualInstrument {
        fn active_segment_for_test(&self, uid: &str) {
            self.context.active_segment.set(uid);
        }
    }
}
