//! Experiment segments.
//!
//! A [`Segment`] is one step of an experiment. Every segment has the same
//! lifecycle, driven by the sequencer:
//!
//! 1. `prerun` starts (or resumes) the segment's recordings
//! 2. `run` performs the segment's work
//! 3. `postrun` stops the recordings
//!
//! The work itself depends on [`SegmentKind`]. All sleeps wait on the run's
//! abort signal, so an abort request ends any segment promptly.

use super::threshold::{Comparison, ThresholdLastNValues};
use crate::error::{AppResult, TestbenchError};
use crate::instrument::{EmergencyStop, VirtualInstrument};
use crate::recording::recording_path;
use crate::signal::StopSignal;
use crate::value::Value;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a segment did not complete.
#[derive(Error, Debug)]
pub enum SegmentError {
    /// Deliberate stop of the whole experiment (abort request, timeout with
    /// `action != continue`). The reason is shown to the operator verbatim.
    #[error("{reason}")]
    Aborted {
        /// Human-readable reason
        reason: String,
    },

    /// Any other error raised while running the segment.
    #[error(transparent)]
    Failed(#[from] TestbenchError),
}

impl SegmentError {
    /// Build an aborting failure.
    pub fn aborted(reason: impl Into<String>) -> Self {
        SegmentError::Aborted {
            reason: reason.into(),
        }
    }

    /// Whether this is a deliberate abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, SegmentError::Aborted { .. })
    }
}

/// Per-run values every segment needs.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// `<experiment uid>_<timestamp>`
    pub run_id: String,
    /// Root of all run directories
    pub log_dir: PathBuf,
    /// Set by `Experiment::request_abort`
    pub abort: Arc<StopSignal>,
}

impl RunContext {
    /// Directory holding this run's recording files.
    pub fn run_dir(&self) -> PathBuf {
        self.log_dir.join(&self.run_id)
    }

    /// Fail with an abort if one was requested.
    pub fn check_abort(&self, segment_uid: &str) -> Result<(), SegmentError> {
        if self.abort.is_set() {
            Err(SegmentError::aborted(format!(
                "abort requested during segment '{segment_uid}'"
            )))
        } else {
            Ok(())
        }
    }

    /// Sleep, returning early with an abort if one is requested.
    pub fn sleep(&self, duration: Duration, segment_uid: &str) -> Result<(), SegmentError> {
        if self.abort.wait_timeout(duration) {
            return self.check_abort(segment_uid);
        }
        Ok(())
    }

    /// Sleep until `deadline`, returning early with an abort if one is requested.
    pub fn sleep_until(&self, deadline: Instant, segment_uid: &str) -> Result<(), SegmentError> {
        if self.abort.wait_until(deadline) {
            return self.check_abort(segment_uid);
        }
        Ok(())
    }
}

/// A recording kept running for the duration of a segment.
#[derive(Debug, Clone)]
pub struct RecordingBinding {
    /// Recorded instrument
    pub instrument: Arc<VirtualInstrument>,
    /// Recording id on that instrument
    pub record_id: String,
    /// Display name
    pub record_name: String,
}

/// Validation rule attached to a segment. Kept for reporting; not evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Rule name
    pub name: String,
    /// Parameters
    pub params: toml::Table,
}

/// What a pressure segment does when its timeout expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Treat as success and move on
    Continue,
    /// Abort the experiment
    Abort,
}

impl TimeoutAction {
    /// `continue` (any case) continues; anything else aborts.
    pub fn parse(action: &str) -> Self {
        if action.trim().eq_ignore_ascii_case("continue") {
            TimeoutAction::Continue
        } else {
            TimeoutAction::Abort
        }
    }
}

/// Wait for a pressure reading to pass a threshold.
#[derive(Debug, Clone)]
pub struct PressureTarget {
    /// Pressure instrument
    pub pressure: Arc<VirtualInstrument>,
    /// Threshold in mbar
    pub threshold: f64,
    /// Test that counts as reached
    pub comparison: Comparison,
    /// Time limit
    pub timeout: Duration,
    /// What to do when the time limit expires
    pub timeout_action: TimeoutAction,
    /// Interval between readings
    pub time_resolution: Duration,
    /// Consecutive passing readings required
    pub window: usize,
}

/// Command a setpoint, optionally enable an output, wait, then restore.
#[derive(Debug, Clone)]
pub struct Hold {
    /// Setpoint instrument
    pub setpoint_instrument: Arc<VirtualInstrument>,
    /// Commanded value
    pub setpoint: Value,
    /// Hold duration
    pub hold: Duration,
    /// Output-enable instrument
    pub output: Option<Arc<VirtualInstrument>>,
    /// Read before commanding; its value is restored on exit when present
    pub reset_from: Option<Arc<VirtualInstrument>>,
}

/// Command a setpoint and optionally set an output.
#[derive(Debug, Clone)]
pub struct SetPoint {
    /// Setpoint instrument
    pub setpoint_instrument: Arc<VirtualInstrument>,
    /// Commanded value
    pub setpoint: Value,
    /// Output-enable instrument
    pub output: Option<Arc<VirtualInstrument>>,
    /// Value sent to the output
    pub enable: bool,
}

/// Sweep a setpoint linearly.
#[derive(Debug, Clone)]
pub struct Step {
    /// Setpoint instrument
    pub setpoint_instrument: Arc<VirtualInstrument>,
    /// First value
    pub start: f64,
    /// Last value
    pub stop: f64,
    /// Number of values, endpoints included
    pub num_steps: usize,
    /// Delay after each value
    pub step_delay: Duration,
    /// Output-enable instrument
    pub output: Option<Arc<VirtualInstrument>>,
    /// Disable the output afterwards
    pub reset: bool,
}

/// Filament and bias supply channels.
#[derive(Debug, Clone)]
pub struct FilamentSupplies {
    /// Filament voltage setpoint
    pub filament_voltage: Arc<VirtualInstrument>,
    /// Filament current limit
    pub filament_current_limit: Arc<VirtualInstrument>,
    /// Filament output enable
    pub filament_output: Arc<VirtualInstrument>,
    /// Bias voltage setpoint
    pub bias_voltage: Arc<VirtualInstrument>,
    /// Bias current limit
    pub bias_current_limit: Arc<VirtualInstrument>,
    /// Bias output enable
    pub bias_output: Arc<VirtualInstrument>,
}

/// What the filament voltage does while both supplies are on.
#[derive(Debug, Clone, PartialEq)]
pub enum FilamentProgram {
    /// One voltage for a fixed time
    Hold {
        /// Filament voltage
        voltage: f64,
        /// Hold duration
        hold: Duration,
    },
    /// Evenly spaced voltages
    Step {
        /// First voltage
        min_voltage: f64,
        /// Last voltage
        max_voltage: f64,
        /// Number of voltages
        num_steps: usize,
        /// Time at each voltage
        step_delay: Duration,
    },
}

impl FilamentProgram {
    fn start_voltage(&self) -> f64 {
        match self {
            FilamentProgram::Hold { voltage, .. } => *voltage,
            FilamentProgram::Step { min_voltage, .. } => *min_voltage,
        }
    }
}

/// Energize an isolated filament and its bias supply, run a program, then
/// switch both outputs off.
#[derive(Debug, Clone)]
pub struct IsoFilament {
    /// Supply channels
    pub supplies: FilamentSupplies,
    /// Filament voltage program
    pub program: FilamentProgram,
    /// Filament current limit
    pub filament_current_limit: f64,
    /// Bias voltage
    pub bias_voltage: f64,
    /// Bias current limit
    pub bias_current_limit: f64,
}

/// Segment variants.
#[derive(Debug)]
pub enum SegmentKind {
    /// Sleep
    Wait(Duration),
    /// Wait for pressure to fall to a setpoint
    Pumpdown(PressureTarget),
    /// Wait for pressure to rise past a threshold
    MeasureLeaks(PressureTarget),
    /// Command and hold
    Hold(Hold),
    /// Command and return
    Set(SetPoint),
    /// Setpoint sweep
    Step(Step),
    /// Child segments, one per swept value
    LinearStep(Vec<Segment>),
    /// Filament and bias supply program
    IsoFilament(IsoFilament),
    /// Fire the emergency stop
    EmergencyStop {
        /// Apparatus relay
        estop: Arc<EmergencyStop>,
        /// Shown in the abort message
        reason: String,
    },
}

impl SegmentKind {
    /// Configuration `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            SegmentKind::Wait(_) => "wait",
            SegmentKind::Pumpdown(_) => "pumpdown",
            SegmentKind::MeasureLeaks(_) => "measure_leaks",
            SegmentKind::Hold(_) => "hold",
            SegmentKind::Set(_) => "set",
            SegmentKind::Step(_) => "step",
            SegmentKind::LinearStep(_) => "linear_step",
            SegmentKind::IsoFilament(iso) => match iso.program {
                FilamentProgram::Hold { .. } => "iso_filament_hold",
                FilamentProgram::Step { .. } => "iso_filament_voltage_step",
            },
            SegmentKind::EmergencyStop { .. } => "emergency_stop",
        }
    }
}

/// Lifecycle of one segment within the latest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentState {
    /// Not run yet
    Pending,
    /// `run` is executing
    Running,
    /// `run` returned successfully
    Complete,
    /// `run` ended with an abort
    Aborted,
    /// `run` ended with an error
    Failed,
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SegmentState::Pending => "pending",
            SegmentState::Running => "running",
            SegmentState::Complete => "complete",
            SegmentState::Aborted => "aborted",
            SegmentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One step of an experiment.
#[derive(Debug)]
pub struct Segment {
    /// Unique id within the experiment
    pub uid: String,
    /// Display name
    pub name: String,
    /// Validation rules
    pub rules: Vec<Rule>,
    /// Recordings active during the segment
    pub recordings: Vec<RecordingBinding>,
    /// Variant
    pub kind: SegmentKind,
    state: Mutex<SegmentState>,
}

impl Segment {
    /// Create a pending segment.
    pub fn new(uid: impl Into<String>, name: impl Into<String>, kind: SegmentKind) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            rules: Vec::new(),
            recordings: Vec::new(),
            kind,
            state: Mutex::new(SegmentState::Pending),
        }
    }

    /// Attach recordings.
    pub fn with_recordings(mut self, recordings: Vec<RecordingBinding>) -> Self {
        self.recordings = recordings;
        self
    }

    /// Attach rules.
    pub fn with_rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }

    /// State within the latest run.
    pub fn state(&self) -> SegmentState {
        *self.state.lock()
    }

    /// Return to `Pending` before a new run.
    pub fn reset_state(&self) {
        *self.state.lock() = SegmentState::Pending;
        if let SegmentKind::LinearStep(children) = &self.kind {
            for child in children {
                child.reset_state();
            }
        }
    }

    /// Start every bound recording.
    ///
    /// A recording that already has a file inside this run's directory (the
    /// same recording bound to an earlier segment) is resumed so the run keeps
    /// one continuous file per recording. Anything else starts a new file.
    /// If one binding fails, the ones already started are stopped again
    /// before the error is returned.
    pub fn prerun(&self, ctx: &RunContext) -> Result<(), SegmentError> {
        let run_dir = ctx.run_dir();
        for (started, binding) in self.recordings.iter().enumerate() {
            if let Err(e) = start_binding(binding, ctx, &run_dir) {
                warn!(
                    segment = %self.uid,
                    record = %binding.record_id,
                    error = %e,
                    "Failed to start recording"
                );
                // Cleanup errors are already logged; the start failure is the one reported.
                let _ = self.stop_bindings(&self.recordings[..started]);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Perform the segment's work.
    pub fn run(&self, ctx: &RunContext) -> Result<(), SegmentError> {
        *self.state.lock() = SegmentState::Running;
        info!(
            run_id = %ctx.run_id,
            segment = %self.uid,
            kind = self.kind.type_name(),
            "Segment started"
        );
        let started = Instant::now();
        let result = self.run_kind(ctx);
        let state = match &result {
            Ok(()) => SegmentState::Complete,
            Err(e) if e.is_abort() => SegmentState::Aborted,
            Err(_) => SegmentState::Failed,
        };
        *self.state.lock() = state;
        info!(
            run_id = %ctx.run_id,
            segment = %self.uid,
            %state,
            elapsed_s = started.elapsed().as_secs_f64(),
            "Segment finished"
        );
        result
    }

    /// Stop every bound recording. All are attempted; the first error is returned.
    pub fn postrun(&self, _ctx: &RunContext) -> Result<(), SegmentError> {
        self.stop_bindings(&self.recordings).map_err(SegmentError::from)
    }

    fn stop_bindings(&self, bindings: &[RecordingBinding]) -> Result<(), TestbenchError> {
        let mut first_error = None;
        for binding in bindings {
            if let Err(e) = binding.instrument.stop_recording(&binding.record_id) {
                warn!(segment = %self.uid, record = %binding.record_id, error = %e, "Failed to stop recording");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn run_kind(&self, ctx: &RunContext) -> Result<(), SegmentError> {
        match &self.kind {
            SegmentKind::Wait(duration) => ctx.sleep(*duration, &self.uid),
            SegmentKind::Pumpdown(target) | SegmentKind::MeasureLeaks(target) => {
                self.wait_for_pressure(target, ctx)
            }
            SegmentKind::Hold(hold) => self.hold(hold, ctx),
            SegmentKind::Set(set) => {
                set.setpoint_instrument.command(set.setpoint.clone())?;
                if let Some(output) = &set.output {
                    output.command(set.enable)?;
                }
                Ok(())
            }
            SegmentKind::Step(step) => self.step(step, ctx),
            SegmentKind::LinearStep(children) => {
                for child in children {
                    child.prerun(ctx)?;
                    let result = child.run(ctx);
                    let stopped = child.postrun(ctx);
                    result?;
                    stopped?;
                }
                Ok(())
            }
            SegmentKind::IsoFilament(iso) => self.iso_filament(iso, ctx),
            SegmentKind::EmergencyStop { estop, reason } => {
                if !estop.fire()? {
                    return Ok(());
                }
                let mut message = format!("emergency stop fired by segment '{}'", self.uid);
                if !reason.is_empty() {
                    message = format!("{message}: {reason}");
                }
                Err(SegmentError::aborted(message))
            }
        }
    }

    fn wait_for_pressure(&self, target: &PressureTarget, ctx: &RunContext) -> Result<(), SegmentError> {
        let started = Instant::now();
        let deadline = started + target.timeout;
        let mut debounce =
            ThresholdLastNValues::new(target.window, target.comparison, target.threshold);
        loop {
            let next = Instant::now() + target.time_resolution;
            let reading = target.pressure.value().as_f64();
            if !debounce.update_evaluate(reading) {
                info!(
                    segment = %self.uid,
                    pressure = ?reading,
                    threshold = target.threshold,
                    elapsed_s = started.elapsed().as_secs_f64(),
                    "Pressure target reached"
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                let reason = format!(
                    "segment '{}' timed out after {:.1} min waiting for pressure {} {} mbar (last reading: {})",
                    self.uid,
                    target.timeout.as_secs_f64() / 60.0,
                    target.comparison,
                    target.threshold,
                    target.pressure.value(),
                );
                return match target.timeout_action {
                    TimeoutAction::Continue => {
                        warn!(segment = %self.uid, "{reason}, continuing");
                        Ok(())
                    }
                    TimeoutAction::Abort => Err(SegmentError::aborted(reason)),
                };
            }
            ctx.sleep_until(next.min(deadline), &self.uid)?;
        }
    }

    /// The setpoint is restored (or the output disabled) even when the hold
    /// fails or is aborted. The first error wins.
    fn hold(&self, hold: &Hold, ctx: &RunContext) -> Result<(), SegmentError> {
        let reset_value = hold.reset_from.as_ref().map(|inst| inst.value());
        let held = self.apply_hold(hold, ctx);

        let restored = if let Some(value) = reset_value {
            debug!(segment = %self.uid, value = %value, "Restoring setpoint");
            hold.setpoint_instrument.command(value)
        } else if let Some(output) = &hold.output {
            output.command(false)
        } else {
            Ok(())
        };
        held.and(self.cleanup_result(restored))
    }

    fn apply_hold(&self, hold: &Hold, ctx: &RunContext) -> Result<(), SegmentError> {
        hold.setpoint_instrument.command(hold.setpoint.clone())?;
        if let Some(output) = &hold.output {
            output.command(true)?;
        }
        ctx.sleep(hold.hold, &self.uid)
    }

    fn step(&self, step: &Step, ctx: &RunContext) -> Result<(), SegmentError> {
        let swept = self.sweep(step, ctx);
        match (&step.output, step.reset) {
            (Some(output), true) => swept.and(self.cleanup_result(output.command(false))),
            _ => swept,
        }
    }

    /// Both outputs are switched off however the program ends.
    fn iso_filament(&self, iso: &IsoFilament, ctx: &RunContext) -> Result<(), SegmentError> {
        let ran = self.energize_filament(iso, ctx);
        let supplies = &iso.supplies;
        let filament_off = supplies.filament_output.command(false);
        let bias_off = supplies.bias_output.command(false);
        ran.and(self.cleanup_result(filament_off.and(bias_off)))
    }

    fn energize_filament(&self, iso: &IsoFilament, ctx: &RunContext) -> Result<(), SegmentError> {
        let supplies = &iso.supplies;
        supplies.bias_current_limit.command(iso.bias_current_limit)?;
        supplies.bias_voltage.command(iso.bias_voltage)?;
        supplies.filament_current_limit.command(iso.filament_current_limit)?;
        supplies.filament_voltage.command(iso.program.start_voltage())?;
        supplies.filament_output.command(true)?;
        supplies.bias_output.command(true)?;

        match &iso.program {
            FilamentProgram::Hold { hold, .. } => ctx.sleep(*hold, &self.uid),
            FilamentProgram::Step {
                min_voltage,
                max_voltage,
                num_steps,
                step_delay,
            } => {
                for voltage in linspace(*min_voltage, *max_voltage, *num_steps) {
                    ctx.check_abort(&self.uid)?;
                    debug!(segment = %self.uid, voltage, "Filament step");
                    supplies.filament_voltage.command(voltage)?;
                    ctx.sleep(*step_delay, &self.uid)?;
                }
                Ok(())
            }
        }
    }

    fn cleanup_result(&self, result: AppResult<()>) -> Result<(), SegmentError> {
        if let Err(e) = &result {
            warn!(segment = %self.uid, error = %e, "Failed to restore instrument after segment");
        }
        result.map_err(SegmentError::from)
    }

    fn sweep(&self, step: &Step, ctx: &RunContext) -> Result<(), SegmentError> {
        step.setpoint_instrument.command(step.start)?;
        if let Some(output) = &step.output {
            output.command(true)?;
        }
        for value in linspace(step.start, step.stop, step.num_steps) {
            ctx.check_abort(&self.uid)?;
            debug!(segment = %self.uid, value, "Step");
            step.setpoint_instrument.command(value)?;
            ctx.sleep(step.step_delay, &self.uid)?;
        }
        Ok(())
    }
}

fn start_binding(binding: &RecordingBinding, ctx: &RunContext, run_dir: &Path) -> AppResult<()> {
    let instrument = &binding.instrument;
    let same_run = instrument
        .recording_file(&binding.record_id)
        .is_some_and(|path| path.starts_with(run_dir));
    if same_run {
        instrument.resume_recording(&binding.record_id)
    } else {
        let path = recording_path(&ctx.log_dir, &ctx.run_id, instrument.uid(), &binding.record_id);
        instrument.begin_recording(&binding.record_id, &binding.record_name, Some(&path))
    }
}

/// `n` evenly spaced values from `start` to `stop`, both included.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}
