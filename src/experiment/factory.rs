//! Builds segments and experiments from configuration.
//!
//! Every instrument reference is resolved against the live [`Apparatus`] here,
//! so a typo in an experiment file fails at load time rather than mid-run.

use super::lock::ExperimentLock;
use super::segment::{
    linspace, FilamentProgram, FilamentSupplies, Hold, IsoFilament, PressureTarget,
    RecordingBinding, Rule, Segment, SegmentKind, SetPoint, Step, TimeoutAction,
};
use super::sequencer::{Experiment, ExperimentServices};
use crate::config::experiment::{
    ExperimentConfig, FilamentInstruments, LinearStepParams, RecordingConfig, SegmentConfig,
    SegmentParams, TimeoutConfig,
};
use crate::error::{AppResult, TestbenchError};
use crate::instrument::{Apparatus, VirtualInstrument};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Build an experiment bound to `apparatus`, sharing `lock` with its siblings.
pub fn build_experiment(
    config: &ExperimentConfig,
    apparatus: &Apparatus,
    lock: ExperimentLock,
    services: ExperimentServices,
) -> AppResult<Experiment> {
    config.validate().map_err(TestbenchError::Configuration)?;
    let segments = config
        .segments
        .iter()
        .map(|segment| build_segment(segment, &config.recordings, apparatus))
        .collect::<AppResult<Vec<_>>>()?;
    debug!(
        experiment = %config.experiment.uid,
        segments = segments.len(),
        "Experiment built"
    );
    Ok(Experiment::new(
        config.experiment.clone(),
        segments,
        lock,
        apparatus.status_instruments().clone(),
        apparatus.context().active_segment.clone(),
        services,
    ))
}

/// Build one segment. `shared_recordings` are appended to the segment's own.
pub fn build_segment(
    config: &SegmentConfig,
    shared_recordings: &[RecordingConfig],
    apparatus: &Apparatus,
) -> AppResult<Segment> {
    config.validate().map_err(TestbenchError::Configuration)?;
    let find = |uid: &str| lookup(apparatus, &config.uid, uid);
    let optional = |uid: &Option<String>| uid.as_deref().map(find).transpose();

    let kind = match &config.params {
        SegmentParams::Wait { seconds } => SegmentKind::Wait(seconds_f64(*seconds)),
        SegmentParams::Pumpdown(p) => SegmentKind::Pumpdown(PressureTarget {
            pressure: find(&p.pressure_instrument)?,
            threshold: p.setpoint_mbar,
            comparison: p.comparison,
            timeout: timeout(&p.timeout),
            timeout_action: TimeoutAction::parse(&p.timeout.action),
            time_resolution: seconds_f64(p.time_resolution_s),
            window: p.window,
        }),
        SegmentParams::MeasureLeaks(p) => SegmentKind::MeasureLeaks(PressureTarget {
            pressure: find(&p.pressure_instrument)?,
            threshold: p.end_pressure_mbar,
            comparison: p.comparison,
            timeout: timeout(&p.timeout),
            timeout_action: TimeoutAction::parse(&p.timeout.action),
            time_resolution: seconds_f64(p.time_resolution_s),
            window: p.window,
        }),
        SegmentParams::Hold(p) => {
            let value_instrument = optional(&p.value_vinstrument)?;
            SegmentKind::Hold(Hold {
                setpoint_instrument: find(&p.commanded_vinstrument_setpoint)?,
                setpoint: p.setpoint.clone(),
                hold: seconds_f64(p.hold_s),
                output: optional(&p.commanded_vinstrument_output)?,
                reset_from: value_instrument.filter(|_| p.reset),
            })
        }
        SegmentParams::Set(p) => SegmentKind::Set(SetPoint {
            setpoint_instrument: find(&p.commanded_vinstrument_setpoint)?,
            setpoint: p.setpoint.clone(),
            output: optional(&p.commanded_vinstrument_output)?,
            enable: p.enable,
        }),
        SegmentParams::Step(p) => SegmentKind::Step(Step {
            setpoint_instrument: find(&p.commanded_vinstrument_setpoint)?,
            start: p.start,
            stop: p.stop,
            num_steps: p.num_steps,
            step_delay: seconds_f64(p.step_delay),
            output: optional(&p.commanded_vinstrument_output)?,
            reset: p.reset,
        }),
        SegmentParams::LinearStep(p) => {
            let children = linear_step_children(config, p)?
                .iter()
                .map(|child| build_segment(child, &[], apparatus))
                .collect::<AppResult<Vec<_>>>()?;
            SegmentKind::LinearStep(children)
        }
        SegmentParams::IsoFilamentHold(p) => SegmentKind::IsoFilament(IsoFilament {
            supplies: filament_supplies(&p.instruments, &find)?,
            program: FilamentProgram::Hold {
                voltage: p.filament_voltage,
                hold: seconds_f64(p.hold_s),
            },
            filament_current_limit: p.filament_current_limit,
            bias_voltage: p.bias_voltage,
            bias_current_limit: p.bias_current_limit,
        }),
        SegmentParams::IsoFilamentVoltageStep(p) => SegmentKind::IsoFilament(IsoFilament {
            supplies: filament_supplies(&p.instruments, &find)?,
            program: FilamentProgram::Step {
                min_voltage: p.min_filament_voltage,
                max_voltage: p.max_filament_voltage,
                num_steps: p.num_steps,
                step_delay: seconds_f64(p.step_delay),
            },
            filament_current_limit: p.filament_current_limit,
            bias_voltage: p.bias_voltage,
            bias_current_limit: p.bias_current_limit,
        }),
        SegmentParams::EmergencyStop { reason } => {
            let estop = apparatus.emergency_stop().cloned().ok_or_else(|| {
                TestbenchError::Configuration(format!(
                    "segment '{}': apparatus '{}' has no emergency stop",
                    config.uid,
                    apparatus.name()
                ))
            })?;
            SegmentKind::EmergencyStop {
                estop,
                reason: reason.clone(),
            }
        }
    };

    let mut recordings: Vec<RecordingBinding> = Vec::new();
    for recording in config.recordings.iter().chain(shared_recordings) {
        let duplicate = recordings.iter().any(|r| {
            r.instrument.uid() == recording.instrument && r.record_id == recording.record_id
        });
        if duplicate {
            continue;
        }
        recordings.push(RecordingBinding {
            instrument: find(&recording.instrument)?,
            record_id: recording.record_id.clone(),
            record_name: recording.record_name.clone(),
        });
    }
    let rules = config
        .rules
        .iter()
        .map(|rule| Rule {
            name: rule.name.clone(),
            params: rule.params.clone(),
        })
        .collect();

    Ok(Segment::new(config.uid.clone(), config.name.clone(), kind)
        .with_recordings(recordings)
        .with_rules(rules))
}

/// Expand a linear step into one child configuration per swept value.
///
/// Each child is `constants` plus `variable = value`, with uid
/// `<uid>_step_<i>` and name `<name> Step: <value>`.
pub fn linear_step_children(
    parent: &SegmentConfig,
    params: &LinearStepParams,
) -> AppResult<Vec<SegmentConfig>> {
    if params.segment == "linear_step" {
        return Err(TestbenchError::Configuration(format!(
            "segment '{}': linear_step cannot repeat itself",
            parent.uid
        )));
    }
    linspace(params.min_value, params.max_value, params.num_steps)
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            let mut table = params.constants.clone();
            table.insert(params.variable.clone(), swept_value(value));
            table.insert("type".into(), toml::Value::String(params.segment.clone()));
            table.insert(
                "uid".into(),
                toml::Value::String(format!("{}_step_{}", parent.uid, i)),
            );
            table.insert(
                "name".into(),
                toml::Value::String(format!("{} Step: {}", parent.name, value)),
            );
            toml::Value::Table(table)
                .try_into::<SegmentConfig>()
                .map_err(|e| {
                    TestbenchError::Configuration(format!(
                        "segment '{}': step {} is not a valid '{}' segment: {}",
                        parent.uid, i, params.segment, e
                    ))
                })
        })
        .collect()
}

/// Integral values are inserted as integers so count-like parameters parse.
fn swept_value(value: f64) -> toml::Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        toml::Value::Integer(value as i64)
    } else {
        toml::Value::Float(value)
    }
}

fn filament_supplies(
    uids: &FilamentInstruments,
    find: impl Fn(&str) -> AppResult<Arc<VirtualInstrument>>,
) -> AppResult<FilamentSupplies> {
    Ok(FilamentSupplies {
        filament_voltage: find(&uids.filament_voltage)?,
        filament_current_limit: find(&uids.filament_current_limit)?,
        filament_output: find(&uids.filament_output)?,
        bias_voltage: find(&uids.bias_voltage)?,
        bias_current_limit: find(&uids.bias_current_limit)?,
        bias_output: find(&uids.bias_output)?,
    })
}

fn lookup(apparatus: &Apparatus, segment: &str, uid: &str) -> AppResult<Arc<VirtualInstrument>> {
    apparatus.instrument(uid).map_err(|_| {
        TestbenchError::Configuration(format!(
            "segment '{segment}' references unknown instrument '{uid}'"
        ))
    })
}

fn seconds_f64(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
}

fn timeout(config: &TimeoutConfig) -> Duration {
    seconds_f64(config.minutes * 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::apparatus::ApparatusConfig;
    use crate::instrument::{InstrumentContext, PhysicalRegistry};
    use crate::value::Value;

    const APPARATUS: &str = r#"
        [virtual_instruments.heater]
        type = "null"
        name = "Heater"

        [virtual_instruments.heater_output]
        type = "null"
        name = "Heater output"

        [virtual_instruments.vacuum_chamber_pressure]
        type = "manual"
        name = "Chamber pressure"
        initial = 1000.0
    "#;

    const EXPERIMENT: &str = r#"
        [experiment]
        uid = "sweep"
        name = "Sweep"

        [[recordings]]
        instrument = "vacuum_chamber_pressure"
        record_id = "pressure"
        record_name = "Pressure"

        [[segments]]
        uid = "pump"
        name = "Pump"
        type = "pumpdown"
        setpoint_mbar = 1e-5
        time_resolution_s = 0.5
        timeout = { minutes = 1, action = "Continue" }

        [[segments]]
        uid = "ramp"
        name = "Ramp"
        type = "linear_step"
        segment = "hold"
        variable = "setpoint"
        min_value = 1.0
        max_value = 2.0
        num_steps = 3
        constants = { commanded_vinstrument_setpoint = "heater", commanded_vinstrument_output = "heater_output", hold_s = 0.5 }
    "#;

    fn apparatus() -> Apparatus {
        let config = ApparatusConfig::from_toml_str(APPARATUS).unwrap();
        Apparatus::build(&config, &PhysicalRegistry::new(), InstrumentContext::default()).unwrap()
    }

    #[test]
    fn builds_pressure_segment_with_shared_recording() {
        let apparatus = apparatus();
        let config = ExperimentConfig::from_toml_str(EXPERIMENT).unwrap();
        let segment = build_segment(&config.segments[0], &config.recordings, &apparatus).unwrap();
        match &segment.kind {
            SegmentKind::Pumpdown(target) => {
                assert_eq!(target.timeout, Duration::from_secs(60));
                assert_eq!(target.timeout_action, TimeoutAction::Continue);
                assert_eq!(target.time_resolution, Duration::from_millis(500));
                assert_eq!(target.pressure.uid(), "vacuum_chamber_pressure");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(segment.recordings.len(), 1);
    }

    #[test]
    fn linear_step_expands_children() {
        let apparatus = apparatus();
        let config = ExperimentConfig::from_toml_str(EXPERIMENT).unwrap();
        let segment = build_segment(&config.segments[1], &[], &apparatus).unwrap();
        let SegmentKind::LinearStep(children) = &segment.kind else {
            panic!("expected linear step");
        };
        let names: Vec<_> = children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Ramp Step: 1", "Ramp Step: 1.5", "Ramp Step: 2"]);
        assert_eq!(children[2].uid, "ramp_step_2");
        match &children[1].kind {
            SegmentKind::Hold(hold) => {
                assert_eq!(hold.setpoint, Value::Float(1.5));
                assert!(hold.output.is_some());
                assert!(hold.reset_from.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_instrument_names_the_segment() {
        let apparatus = apparatus();
        let text = EXPERIMENT.replace("\"heater\"", "\"oven\"");
        let config = ExperimentConfig::from_toml_str(&text).unwrap();
        let err = build_segment(&config.segments[1], &[], &apparatus).unwrap_err();
        assert!(err.to_string().contains("oven"));
    }

    #[test]
    fn invalid_child_parameters_are_reported() {
        let apparatus = apparatus();
        let text = EXPERIMENT.replace("hold_s = 0.5", "hold_seconds = 0.5");
        let config = ExperimentConfig::from_toml_str(&text).unwrap();
        let err = build_segment(&config.segments[1], &[], &apparatus).unwrap_err();
        assert!(err.to_string().contains("not a valid 'hold' segment"));
    }

    const FILAMENT: &str = r#"
        [experiment]
        uid = "condition"
        name = "Condition"

        [[segments]]
        uid = "warm"
        name = "Warm"
        type = "linear_step"
        segment = "iso_filament_hold"
        variable = "filament_voltage"
        min_value = 2.0
        max_value = 3.0
        num_steps = 2
        constants = { filament_current_limit = 4.0, bias_voltage = 30.0, bias_current_limit = 0.1, hold_s = 1 }

        [[segments]]
        uid = "stop"
        name = "Stop"
        type = "emergency_stop"
        reason = "end of conditioning"
    "#;

    fn filament_apparatus(with_estop: bool) -> Apparatus {
        let mut text = String::from(APPARATUS);
        for uid in [
            "filament_voltage",
            "filament_current_limit",
            "filament_output",
            "bias_voltage",
            "bias_current_limit",
            "bias_output",
        ] {
            text.push_str(&format!("\n[virtual_instruments.{uid}]\ntype = \"null\"\nname = \"{uid}\"\n"));
        }
        if with_estop {
            text.push_str("\n[estop]\nrelay = \"heater_output\"\n");
        }
        let config = ApparatusConfig::from_toml_str(&text).unwrap();
        Apparatus::build(&config, &PhysicalRegistry::new(), InstrumentContext::default()).unwrap()
    }

    #[test]
    fn iso_filament_hold_repeats_over_filament_voltage() {
        let apparatus = filament_apparatus(true);
        let config = ExperimentConfig::from_toml_str(FILAMENT).unwrap();
        let segment = build_segment(&config.segments[0], &[], &apparatus).unwrap();
        let SegmentKind::LinearStep(children) = &segment.kind else {
            panic!("expected linear step");
        };
        let programs: Vec<_> = children
            .iter()
            .map(|child| match &child.kind {
                SegmentKind::IsoFilament(iso) => {
                    assert_eq!(iso.supplies.bias_output.uid(), "bias_output");
                    iso.program.clone()
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            programs,
            [2.0, 3.0].map(|voltage| FilamentProgram::Hold {
                voltage,
                hold: Duration::from_secs(1),
            })
        );
    }

    #[test]
    fn emergency_stop_needs_a_relay() {
        let config = ExperimentConfig::from_toml_str(FILAMENT).unwrap();
        let segment = build_segment(&config.segments[1], &[], &filament_apparatus(true)).unwrap();
        match &segment.kind {
            SegmentKind::EmergencyStop { estop, reason } => {
                assert_eq!(estop.relay().uid(), "heater_output");
                assert_eq!(reason, "end of conditioning");
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = build_segment(&config.segments[1], &[], &filament_apparatus(false)).unwrap_err();
        assert!(err.to_string().contains("no emergency stop"));
    }
}
