//! Integration tests for experiment sequencing: threshold debouncing, the
//! shared run lock, abort propagation and full runs against an apparatus.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use testbench::config::apparatus::ApparatusConfig;
use testbench::config::experiment::ExperimentConfig;
use testbench::experiment::{
    Comparison, ExperimentRunner, ExperimentServices, ExperimentState, RunSummary, SegmentKind,
    SegmentState, ThresholdLastNValues,
};
use testbench::instrument::{
    Apparatus, ConnectionManager, DriverRegistry, InstrumentContext, PhysicalInstrument,
    PhysicalRegistry, SimulatedInstrument,
};
use testbench::notify::{AlertSeverity, DirectoryArchiver, Notifier};
use testbench::value::Value;

/// Notifier that keeps every alert for inspection.
#[derive(Default)]
struct CapturedAlerts {
    alerts: Mutex<Vec<(AlertSeverity, String)>>,
    files: Mutex<Vec<String>>,
}

impl CapturedAlerts {
    fn messages(&self) -> Vec<String> {
        self.alerts.lock().iter().map(|(_, m)| m.clone()).collect()
    }
}

impl Notifier for CapturedAlerts {
    fn send_alert(
        &self,
        message: &str,
        severity: AlertSeverity,
        _target: Option<&str>,
    ) -> anyhow::Result<()> {
        self.alerts.lock().push((severity, message.to_string()));
        Ok(())
    }

    fn send_file(&self, path: &Path, _severity: AlertSeverity) -> anyhow::Result<()> {
        self.files.lock().push(path.display().to_string());
        Ok(())
    }
}

fn services(dir: &Path, alerts: Arc<CapturedAlerts>) -> ExperimentServices {
    ExperimentServices {
        notifier: alerts,
        archiver: Arc::new(DirectoryArchiver::new(dir.join("logs"), dir.join("archives"))),
        log_dir: dir.join("logs"),
    }
}

const BENCH: &str = r#"
    name = "bench"

    [physical_instruments.psu]
    driver = "simulated"

    [virtual_instruments.setpoint]
    type = "command_driven"
    name = "Setpoint"
    unit = "V"
    physical_instrument = "psu"
    getter_function = "read"
    getter_kwargs = { channel = "voltage" }
    setter_function = "write"
    setter_kwargs = { channel = "voltage" }

    [virtual_instruments.readback]
    type = "manual"
    name = "Readback"
    initial = 1.5

    [virtual_instruments.vacuum_chamber_pressure]
    type = "manual"
    name = "Chamber pressure"
    initial = 1e-7
"#;

/// Bench apparatus with the supply driver handed back for inspection.
fn bench() -> (Arc<Apparatus>, Arc<SimulatedInstrument>) {
    let config = ApparatusConfig::from_toml_str(BENCH).unwrap();
    let psu = Arc::new(SimulatedInstrument::new("psu"));
    let mut drivers = PhysicalRegistry::new();
    drivers.insert("psu".to_string(), psu.clone() as Arc<dyn PhysicalInstrument>);
    let apparatus = Apparatus::build(&config, &drivers, InstrumentContext::default()).unwrap();
    apparatus.start().unwrap();
    (Arc::new(apparatus), psu)
}

fn waits(uid: &str, seconds: &[f64]) -> ExperimentConfig {
    let mut text = format!("[experiment]\nuid = \"{uid}\"\nname = \"{uid}\"\n");
    for (i, s) in seconds.iter().enumerate() {
        text.push_str(&format!(
            "\n[[segments]]\nuid = \"w{i}\"\nname = \"Wait {i}\"\ntype = \"wait\"\nseconds = {s:?}\n"
        ));
    }
    ExperimentConfig::from_toml_str(&text).unwrap()
}

#[test]
fn test_threshold_needs_twenty_consecutive_readings() {
    let mut threshold = ThresholdLastNValues::new(20, Comparison::Le, 1e-5);
    for _ in 0..19 {
        assert!(threshold.update_evaluate(Some(1e-6)));
    }
    // A single noisy reading restarts the count.
    assert!(threshold.update_evaluate(Some(2e-5)));
    assert_eq!(threshold.consecutive(), 0);
    for _ in 0..19 {
        assert!(threshold.update_evaluate(Some(1e-6)));
    }
    assert!(!threshold.update_evaluate(Some(1e-6)));

    let mut missing = ThresholdLastNValues::new(2, Comparison::Ge, 1.0);
    assert!(missing.update_evaluate(Some(3.0)));
    assert!(missing.update_evaluate(None));
    assert!(missing.update_evaluate(Some(3.0)));
    assert!(!missing.update_evaluate(Some(1.0)));
}

#[test]
fn test_wait_then_hold_commands_and_restores_setpoint() {
    let dir = tempfile::tempdir().unwrap();
    let alerts = Arc::new(CapturedAlerts::default());
    let (apparatus, psu) = bench();
    let runner = ExperimentRunner::new(apparatus.clone(), services(dir.path(), alerts.clone()));
    let experiment = runner
        .add_experiment(
            &ExperimentConfig::from_toml_str(
                r#"
                [experiment]
                uid = "hold_check"
                name = "Hold check"

                [[recordings]]
                instrument = "setpoint"
                record_id = "voltage"
                record_name = "Voltage"

                [[segments]]
                uid = "settle"
                name = "Settle"
                type = "wait"
                seconds = 0.05

                [[segments]]
                uid = "hold"
                name = "Hold 5 V"
                type = "hold"
                commanded_vinstrument_setpoint = "setpoint"
                setpoint = 5.0
                hold_s = 0.05
                value_vinstrument = "readback"
                reset = true
                "#,
            )
            .unwrap(),
        )
        .unwrap();

    let run_id = runner
        .run_experiment("hold_check", Some("alice"))
        .unwrap()
        .unwrap();
    assert!(runner.wait_idle(Duration::from_secs(10)));
    experiment.join().unwrap();

    assert_eq!(experiment.state(), ExperimentState::Complete);
    assert_eq!(experiment.current_segment_id(), 2);
    assert!(!runner.lock().is_locked());
    assert!(runner.active_run().is_none());
    assert_eq!(
        psu.writes(),
        vec![
            ("voltage".to_string(), Value::Float(5.0)),
            ("voltage".to_string(), Value::Float(1.5)),
        ]
    );
    assert_eq!(apparatus.instrument("setpoint").unwrap().value(), Value::Float(1.5));

    let status = apparatus.status_instruments();
    assert_eq!(status.index.value(), Value::Int(2));
    assert!(status.uid.value().is_none());

    let summary = RunSummary::load(RunSummary::path_in(&dir.path().join("logs"), &run_id)).unwrap();
    assert_eq!(summary.state, ExperimentState::Complete);
    assert_eq!(summary.completed_segments(), 2);
    assert!(dir.path().join("archives").join(&run_id).is_dir());
    assert_eq!(alerts.files.lock().len(), 1);

    let messages = alerts.messages();
    assert!(messages.first().unwrap().contains("Starting experiment"));
    assert!(messages.iter().any(|m| m.contains("Hold 5 V")));
    assert!(messages.last().unwrap().contains("completed"));
}

#[test]
fn test_second_run_is_rejected_while_first_is_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let (apparatus, _) = bench();
    let runner = ExperimentRunner::new(
        apparatus,
        services(dir.path(), Arc::new(CapturedAlerts::default())),
    );
    runner.add_experiment(&waits("slow", &[30.0])).unwrap();
    let fast = runner.add_experiment(&waits("fast", &[0.0])).unwrap();

    let first = runner.run_experiment("slow", Some("alice")).unwrap();
    assert!(first.is_some());
    assert_eq!(runner.run_experiment("fast", Some("bob")).unwrap(), None);
    assert_eq!(runner.run_experiment("slow", None).unwrap(), None);
    assert_eq!(fast.current_segment_id(), -1);
    assert_eq!(fast.state(), ExperimentState::Idle);
    assert!(!fast.is_running());
    assert_eq!(runner.active_run().unwrap().experiment_uid, "slow");

    assert!(runner.abort_current());
    assert!(runner.wait_idle(Duration::from_secs(10)));
    assert!(runner.run_experiment("fast", None).unwrap().is_some());
    assert!(runner.wait_idle(Duration::from_secs(10)));
    assert_eq!(fast.state(), ExperimentState::Complete);
}

#[test]
fn test_abort_stops_before_next_segment() {
    let dir = tempfile::tempdir().unwrap();
    let alerts = Arc::new(CapturedAlerts::default());
    let (apparatus, _) = bench();
    let runner = ExperimentRunner::new(apparatus, services(dir.path(), alerts.clone()));
    let experiment = runner.add_experiment(&waits("long", &[30.0, 0.0])).unwrap();

    runner.run_experiment("long", None).unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(runner.abort_current());
    assert!(runner.wait_idle(Duration::from_secs(10)));

    assert_eq!(experiment.state(), ExperimentState::Aborted);
    assert_eq!(experiment.current_segment_id(), 0);
    assert_eq!(experiment.segments()[1].state(), SegmentState::Pending);
    assert!(!runner.lock().is_locked());
    assert!(alerts
        .alerts
        .lock()
        .iter()
        .any(|(severity, m)| *severity == AlertSeverity::Warning && m.contains("abort")));

    let summary = experiment.last_summary().unwrap();
    assert_eq!(summary.state, ExperimentState::Aborted);
    assert_eq!(summary.completed_segments(), 0);
}

#[test]
fn test_pumpdown_timeout_action() {
    let dir = tempfile::tempdir().unwrap();
    let (apparatus, _) = bench();
    let pressure = apparatus.instrument("vacuum_chamber_pressure").unwrap();
    let runner = ExperimentRunner::new(
        apparatus,
        services(dir.path(), Arc::new(CapturedAlerts::default())),
    );
    let pumpdown = |uid: &str, action: &str| {
        ExperimentConfig::from_toml_str(&format!(
            r#"
            [experiment]
            uid = "{uid}"
            name = "{uid}"

            [[segments]]
            uid = "pump"
            name = "Pump down"
            type = "pumpdown"
            setpoint_mbar = 1e-5
            time_resolution_s = 0.005
            window = 3
            timeout = {{ minutes = 0.002, action = "{action}" }}

            [[segments]]
            uid = "after"
            name = "After"
            type = "wait"
            seconds = 0.0
            "#
        ))
        .unwrap()
    };

    // Already below the setpoint: reached after three readings.
    let reached = runner.add_experiment(&pumpdown("reached", "abort")).unwrap();
    runner.run_experiment("reached", None).unwrap().unwrap();
    assert!(runner.wait_idle(Duration::from_secs(10)));
    assert_eq!(reached.state(), ExperimentState::Complete);

    pressure.set_manual_value(900.0).unwrap();

    let soft = runner.add_experiment(&pumpdown("soft", "continue")).unwrap();
    runner.run_experiment("soft", None).unwrap().unwrap();
    assert!(runner.wait_idle(Duration::from_secs(10)));
    assert_eq!(soft.state(), ExperimentState::Complete);
    assert_eq!(soft.current_segment_id(), 2);

    let hard = runner.add_experiment(&pumpdown("hard", "abort")).unwrap();
    runner.run_experiment("hard", None).unwrap().unwrap();
    assert!(runner.wait_idle(Duration::from_secs(10)));
    assert_eq!(hard.state(), ExperimentState::Aborted);
    assert_eq!(hard.segments()[1].state(), SegmentState::Pending);
}

#[test]
fn test_sample_experiments_build_against_sample_bench() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("config");
    let apparatus_config = ApparatusConfig::load_from(root.join("apparatus/bench.toml")).unwrap();
    let manager = ConnectionManager::new(DriverRegistry::with_builtin(), InstrumentContext::default());
    let apparatus = manager.load_apparatus(&apparatus_config).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let runner = ExperimentRunner::new(
        apparatus,
        services(dir.path(), Arc::new(CapturedAlerts::default())),
    );
    let leak = ExperimentConfig::load_from(root.join("experiments/leak_check.toml")).unwrap();
    let sweep = ExperimentConfig::load_from(root.join("experiments/voltage_sweep.toml")).unwrap();
    let leak = runner.add_experiment(&leak).unwrap();
    let sweep = runner.add_experiment(&sweep).unwrap();

    assert_eq!(leak.segments().len(), 3);
    // The ramp plus one linear_step that owns its expanded holds.
    assert_eq!(sweep.segments().len(), 2);
    let SegmentKind::LinearStep(holds) = &sweep.segments()[1].kind else {
        panic!("second sweep segment is not a linear_step");
    };
    let names: Vec<&str> = holds.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["Hold Step: 2", "Hold Step: 4", "Hold Step: 6"]);
    assert!(holds.iter().all(|s| s.kind.type_name() == "hold"));

    let filament =
        ExperimentConfig::load_from(root.join("experiments/filament_conditioning.toml")).unwrap();
    let filament = runner.add_experiment(&filament).unwrap();
    let kinds: Vec<&str> = filament.segments().iter().map(|s| s.kind.type_name()).collect();
    assert_eq!(kinds, ["pumpdown", "linear_step", "iso_filament_voltage_step"]);
    assert!(apparatus_has_estop(&manager));
    assert_eq!(
        runner.experiment_uids(),
        vec!["filament_conditioning", "leak_check", "voltage_sweep"]
    );

    manager.shutdown().unwrap();
}

fn apparatus_has_estop(manager: &ConnectionManager) -> bool {
    manager
        .apparatus()
        .and_then(|a| a.emergency_stop().map(|e| e.relay().uid() == "estop_relay"))
        .unwrap_or(false)
}
