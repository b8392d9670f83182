//! Experiment description: header, experiment-wide recordings, ordered segments.
//!
//! ```toml
//! [experiment]
//! uid = "leak_check"
//! name = "Leak check"
//!
//! [[recordings]]
//! instrument = "chamber_pressure"
//! record_id = "pressure"
//! record_name = "Chamber pressure"
//!
//! [[segments]]
//! uid = "pump"
//! name = "Pump down"
//! type = "pumpdown"
//! setpoint_mbar = 1e-5
//! time_resolution_s = 1.0
//! timeout = { minutes = 30, action = "abort" }
//! ```

use crate::error::{AppResult, TestbenchError};
use crate::experiment::threshold::Comparison;
use crate::value::Value;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default pressure instrument for pumpdown and leak segments.
pub const DEFAULT_PRESSURE_INSTRUMENT: &str = "vacuum_chamber_pressure";

/// Default debounce window for pressure thresholds.
pub const DEFAULT_THRESHOLD_WINDOW: usize = 20;

/// A whole experiment file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Identity
    pub experiment: ExperimentHeader,
    /// Recordings attached to every top-level segment
    #[serde(default)]
    pub recordings: Vec<RecordingConfig>,
    /// Segments in execution order
    pub segments: Vec<SegmentConfig>,
}

/// Experiment identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentHeader {
    /// Unique id, prefix of every run id
    pub uid: String,
    /// Display name
    pub name: String,
    /// Free text
    #[serde(default)]
    pub description: String,
}

/// Binds a segment to a named recording on an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Instrument uid
    pub instrument: String,
    /// Recording id, unique per instrument
    pub record_id: String,
    /// Display name
    pub record_name: String,
}

/// Rule attached to a segment. Parsed and kept, not evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule name
    pub name: String,
    /// Rule parameters
    #[serde(default)]
    pub params: toml::Table,
}

/// One segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Unique id within the experiment
    pub uid: String,
    /// Display name
    pub name: String,
    /// Recordings running for the duration of the segment
    #[serde(default)]
    pub recordings: Vec<RecordingConfig>,
    /// Validation rules
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Variant parameters
    #[serde(flatten)]
    pub params: SegmentParams,
}

/// Segment variant parameters, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentParams {
    /// Sleep
    Wait {
        /// Duration
        seconds: f64,
    },
    /// Wait for pressure to fall to a setpoint
    Pumpdown(PumpdownParams),
    /// Wait for pressure to rise to a threshold
    MeasureLeaks(MeasureLeaksParams),
    /// Command a setpoint and hold it
    Hold(HoldParams),
    /// Command a setpoint and return
    Set(SetParams),
    /// Sweep a setpoint
    Step(StepParams),
    /// Repeat another segment over a swept parameter
    LinearStep(LinearStepParams),
    /// Hold the filament and bias supplies at fixed values
    IsoFilamentHold(IsoFilamentHoldParams),
    /// Sweep the filament voltage with the bias supply held
    #[serde(alias = "iso_filament_voltage_stepup")]
    IsoFilamentVoltageStep(IsoFilamentStepParams),
    /// Fire the apparatus emergency stop and abort the run
    EmergencyStop {
        /// Shown in the abort message
        #[serde(default)]
        reason: String,
    },
}

impl SegmentParams {
    /// The `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            SegmentParams::Wait { .. } => "wait",
            SegmentParams::Pumpdown(_) => "pumpdown",
            SegmentParams::MeasureLeaks(_) => "measure_leaks",
            SegmentParams::Hold(_) => "hold",
            SegmentParams::Set(_) => "set",
            SegmentParams::Step(_) => "step",
            SegmentParams::LinearStep(_) => "linear_step",
            SegmentParams::IsoFilamentHold(_) => "iso_filament_hold",
            SegmentParams::IsoFilamentVoltageStep(_) => "iso_filament_voltage_step",
            SegmentParams::EmergencyStop { .. } => "emergency_stop",
        }
    }
}

/// Timeout of a pressure segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Time limit
    pub minutes: f64,
    /// `continue` proceeds to the next segment; anything else aborts the run
    pub action: String,
}

/// Pumpdown parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpdownParams {
    /// Pressure instrument uid
    #[serde(default = "default_pressure_instrument")]
    pub pressure_instrument: String,
    /// Target pressure
    pub setpoint_mbar: f64,
    /// Reading vs setpoint test that ends the wait
    #[serde(default = "default_pumpdown_comparison")]
    pub comparison: Comparison,
    /// Time limit and what to do when it expires
    pub timeout: TimeoutConfig,
    /// Interval between readings
    pub time_resolution_s: f64,
    /// Consecutive readings required
    #[serde(default = "default_window")]
    pub window: usize,
}

/// Leak-up parameters. The comparison has no default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureLeaksParams {
    /// Pressure instrument uid
    #[serde(default = "default_pressure_instrument")]
    pub pressure_instrument: String,
    /// Pressure that ends the measurement
    pub end_pressure_mbar: f64,
    /// Reading vs threshold test that ends the wait
    pub comparison: Comparison,
    /// Time limit and what to do when it expires
    pub timeout: TimeoutConfig,
    /// Interval between readings
    pub time_resolution_s: f64,
    /// Consecutive readings required
    #[serde(default = "default_window")]
    pub window: usize,
}

/// Hold parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldParams {
    /// Setpoint instrument uid
    pub commanded_vinstrument_setpoint: String,
    /// Commanded value
    pub setpoint: Value,
    /// Hold duration
    pub hold_s: f64,
    /// Output-enable instrument uid
    #[serde(default)]
    pub commanded_vinstrument_output: Option<String>,
    /// Instrument read for the value restored on exit
    #[serde(default)]
    pub value_vinstrument: Option<String>,
    /// Restore the setpoint on exit (needs `value_vinstrument`)
    #[serde(default)]
    pub reset: bool,
}

/// Set parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetParams {
    /// Setpoint instrument uid
    pub commanded_vinstrument_setpoint: String,
    /// Commanded value
    pub setpoint: Value,
    /// Output-enable instrument uid
    #[serde(default)]
    pub commanded_vinstrument_output: Option<String>,
    /// Value sent to the output instrument
    #[serde(default = "default_true")]
    pub enable: bool,
}

/// Step parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepParams {
    /// Setpoint instrument uid
    pub commanded_vinstrument_setpoint: String,
    /// First value
    pub start: f64,
    /// Last value
    pub stop: f64,
    /// Number of values, endpoints included
    pub num_steps: usize,
    /// Seconds between values
    pub step_delay: f64,
    /// Output-enable instrument uid
    #[serde(default)]
    pub commanded_vinstrument_output: Option<String>,
    /// Disable the output after the sweep
    #[serde(default)]
    pub reset: bool,
}

/// LinearStep parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearStepParams {
    /// `type` of the repeated segment
    pub segment: String,
    /// Parameter substituted with each swept value
    pub variable: String,
    /// First value
    pub min_value: f64,
    /// Last value
    pub max_value: f64,
    /// Number of values, endpoints included
    pub num_steps: usize,
    /// Parameters shared by every child
    #[serde(default)]
    pub constants: toml::Table,
}

/// Uids of the six supply channels an iso-filament segment drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilamentInstruments {
    /// Filament voltage setpoint
    pub filament_voltage: String,
    /// Filament current limit
    pub filament_current_limit: String,
    /// Filament output enable
    pub filament_output: String,
    /// Bias voltage setpoint
    pub bias_voltage: String,
    /// Bias current limit
    pub bias_current_limit: String,
    /// Bias output enable
    pub bias_output: String,
}

impl Default for FilamentInstruments {
    fn default() -> Self {
        Self {
            filament_voltage: "filament_voltage".into(),
            filament_current_limit: "filament_current_limit".into(),
            filament_output: "filament_output".into(),
            bias_voltage: "bias_voltage".into(),
            bias_current_limit: "bias_current_limit".into(),
            bias_output: "bias_output".into(),
        }
    }
}

/// IsoFilamentHold parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoFilamentHoldParams {
    /// Supply channel uids
    #[serde(default)]
    pub instruments: FilamentInstruments,
    /// Filament voltage
    pub filament_voltage: f64,
    /// Filament current limit
    pub filament_current_limit: f64,
    /// Bias voltage
    pub bias_voltage: f64,
    /// Bias current limit
    pub bias_current_limit: f64,
    /// Hold duration
    pub hold_s: f64,
}

/// IsoFilamentVoltageStep parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoFilamentStepParams {
    /// Supply channel uids
    #[serde(default)]
    pub instruments: FilamentInstruments,
    /// First filament voltage
    pub min_filament_voltage: f64,
    /// Last filament voltage
    pub max_filament_voltage: f64,
    /// Number of voltages, endpoints included
    pub num_steps: usize,
    /// Filament current limit
    pub filament_current_limit: f64,
    /// Bias voltage
    pub bias_voltage: f64,
    /// Bias current limit
    pub bias_current_limit: f64,
    /// Seconds between voltages
    pub step_delay: f64,
}

fn default_pressure_instrument() -> String {
    DEFAULT_PRESSURE_INSTRUMENT.to_string()
}

fn default_pumpdown_comparison() -> Comparison {
    Comparison::Le
}

fn default_window() -> usize {
    DEFAULT_THRESHOLD_WINDOW
}

fn default_true() -> bool {
    true
}

impl ExperimentConfig {
    /// Load from a TOML file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TestbenchError::Configuration(format!(
                "experiment file {} does not exist",
                path.display()
            )));
        }
        let config: Self = Figment::new().merge(Toml::file(path)).extract()?;
        config.validate().map_err(TestbenchError::Configuration)?;
        Ok(config)
    }

    /// Parse from a TOML string.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(text)).extract()?;
        config.validate().map_err(TestbenchError::Configuration)?;
        Ok(config)
    }

    /// Check ids and numeric ranges. Instrument references are checked when
    /// the experiment is built against an apparatus.
    pub fn validate(&self) -> Result<(), String> {
        if self.experiment.uid.trim().is_empty() {
            return Err("experiment uid is empty".to_string());
        }
        let mut uids = HashSet::new();
        for segment in &self.segments {
            if !uids.insert(segment.uid.as_str()) {
                return Err(format!("duplicate segment uid '{}'", segment.uid));
            }
            segment.validate()?;
        }
        Ok(())
    }
}

impl SegmentConfig {
    /// Check numeric ranges.
    pub fn validate(&self) -> Result<(), String> {
        let uid = &self.uid;
        let non_negative = |what: &str, v: f64| {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(format!("segment '{uid}': {what} must be a non-negative number"))
            }
        };
        let positive = |what: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(format!("segment '{uid}': {what} must be greater than zero"))
            }
        };
        match &self.params {
            SegmentParams::Wait { seconds } => non_negative("seconds", *seconds),
            SegmentParams::Pumpdown(p) => {
                non_negative("timeout.minutes", p.timeout.minutes)?;
                positive("time_resolution_s", p.time_resolution_s)?;
                check_window(uid, p.window)
            }
            SegmentParams::MeasureLeaks(p) => {
                non_negative("timeout.minutes", p.timeout.minutes)?;
                positive("time_resolution_s", p.time_resolution_s)?;
                check_window(uid, p.window)
            }
            SegmentParams::Hold(p) => non_negative("hold_s", p.hold_s),
            SegmentParams::Set(_) => Ok(()),
            SegmentParams::Step(p) => non_negative("step_delay", p.step_delay),
            SegmentParams::IsoFilamentHold(p) => non_negative("hold_s", p.hold_s),
            SegmentParams::IsoFilamentVoltageStep(p) => {
                non_negative("step_delay", p.step_delay)?;
                if p.num_steps == 0 {
                    return Err(format!("segment '{uid}': num_steps must be at least 1"));
                }
                Ok(())
            }
            SegmentParams::EmergencyStop { .. } => Ok(()),
            SegmentParams::LinearStep(p) => {
                if p.segment == "linear_step" {
                    return Err(format!("segment '{uid}': linear_step cannot repeat itself"));
                }
                if p.num_steps == 0 {
                    return Err(format!("segment '{uid}': num_steps must be at least 1"));
                }
                Ok(())
            }
        }
    }
}

fn check_window(uid: &str, window: usize) -> Result<(), String> {
    if window == 0 {
        Err(format!("segment '{uid}': window must be at least 1"))
    } else {
        Ok(())
    }
}
