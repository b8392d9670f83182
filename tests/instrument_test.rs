//! Integration tests for batch polling, composite instruments and apparatus
//! lifecycle.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use testbench::config::apparatus::ApparatusConfig;
use testbench::instrument::{
    Apparatus, Arguments, Batcher, BatchingScheme, Binding, ConnectionManager, DriverRegistry,
    InstrumentContext, InstrumentKind, PhysicalInstrument, PhysicalRegistry, Reading,
    SimulatedInstrument, VirtualInstrument,
};
use testbench::value::Value;
use testbench::TestbenchError;

/// Driver whose getter returns whatever list the test put in `reply`.
struct Multiplexer {
    reply: Mutex<Vec<Value>>,
}

impl PhysicalInstrument for Multiplexer {
    fn name(&self) -> &str {
        "mux"
    }

    fn read(&self, _function: &str, _args: &Arguments) -> anyhow::Result<Reading> {
        Ok(Reading::List(self.reply.lock().clone()))
    }

    fn write(&self, _function: &str, _value: &Value, _args: &Arguments) -> anyhow::Result<()> {
        Ok(())
    }
}

fn batched(uid: &str) -> Arc<VirtualInstrument> {
    Arc::new(VirtualInstrument::new(
        uid,
        uid,
        InstrumentKind::Batched { setter: None },
        InstrumentContext::default(),
    ))
}

/// Poll until `check` holds or five seconds pass.
fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

#[test]
fn test_batch_demux_assigns_by_position() {
    let driver = Arc::new(Multiplexer {
        reply: Mutex::new(vec![Value::Float(1.5), Value::Int(2), Value::from("open")]),
    });
    let getter = Binding::new(driver.clone(), "measure", Arguments::new());
    let batcher = Batcher::new(
        "scanner",
        getter,
        BatchingScheme::ChannelList,
        Duration::from_millis(100),
    );
    let channels = [batched("a"), batched("b"), batched("c")];
    for (i, inst) in channels.iter().enumerate() {
        batcher.register(format!("@10{i}"), inst.clone()).unwrap();
    }

    batcher.poll_once().unwrap();
    assert_eq!(channels[0].value(), Value::Float(1.5));
    assert_eq!(channels[1].value(), Value::Int(2));
    assert_eq!(channels[2].value(), Value::from("open"));

    *driver.reply.lock() = vec![Value::Float(9.0), Value::Float(9.0)];
    let err = batcher.poll_once().unwrap_err();
    assert!(matches!(err, TestbenchError::Demux(_)));
    assert_eq!(channels[0].value(), Value::Float(1.5));
    assert_eq!(channels[1].value(), Value::Int(2));
    assert_eq!(channels[2].value(), Value::from("open"));
}

#[test]
fn test_composite_follows_sources_without_polling() {
    let config = ApparatusConfig::from_toml_str(
        r#"
        name = "composite"

        [virtual_instruments.left]
        type = "manual"
        name = "Left"
        initial = 2.0

        [virtual_instruments.right]
        type = "manual"
        name = "Right"
        initial = 4.0

        [virtual_instruments.average]
        type = "composite"
        name = "Average"
        sources = ["left", "right"]
        function = "mean"
        "#,
    )
    .unwrap();
    let apparatus =
        Apparatus::build(&config, &PhysicalRegistry::new(), InstrumentContext::default()).unwrap();
    apparatus.start().unwrap();

    let average = apparatus.instrument("average").unwrap();
    assert!(eventually(|| average.value() == Value::Float(3.0)));

    apparatus.instrument("left").unwrap().set_manual_value(6.0).unwrap();
    apparatus.instrument("right").unwrap().set_manual_value(8.0).unwrap();
    assert!(eventually(|| average.value() == Value::Float(7.0)));

    apparatus.shutdown().unwrap();
    assert!(!apparatus.is_running());
}

#[test]
fn test_apparatus_batcher_polls_simulated_scanner() {
    let config = ApparatusConfig::from_toml_str(
        r#"
        name = "scanner"

        [physical_instruments.scanner]
        driver = "simulated"

        [batchers.thermocouples]
        physical_instrument = "scanner"
        getter_function = "read_channels"
        polling_interval_ms = 10

        [virtual_instruments.tc1]
        type = "batched"
        name = "TC1"
        batcher = "thermocouples"
        channel = "tc1"

        [virtual_instruments.tc2]
        type = "batched"
        name = "TC2"
        batcher = "thermocouples"
        channel = "tc2"
        "#,
    )
    .unwrap();
    let scanner = Arc::new(
        SimulatedInstrument::new("scanner")
            .with_channel("tc1", 21.0)
            .with_channel("tc2", 35.0),
    );
    let mut drivers = PhysicalRegistry::new();
    drivers.insert("scanner".to_string(), scanner as Arc<dyn PhysicalInstrument>);

    let apparatus = Apparatus::build(&config, &drivers, InstrumentContext::default()).unwrap();
    apparatus.start().unwrap();
    let tc1 = apparatus.instrument("tc1").unwrap();
    let tc2 = apparatus.instrument("tc2").unwrap();
    assert!(eventually(|| {
        tc1.value() == Value::Float(21.0) && tc2.value() == Value::Float(35.0)
    }));
    apparatus.shutdown().unwrap();
}

#[test]
fn test_named_batcher_distributes_by_channel_key() {
    let config = ApparatusConfig::from_toml_str(
        r#"
        name = "named"

        [physical_instruments.scanner]
        driver = "simulated"
        [physical_instruments.scanner.channels.left]
        initial = 4.0
        [physical_instruments.scanner.channels.right]
        initial = 9.0

        [batchers.gauges]
        physical_instrument = "scanner"
        getter_function = "read_named"
        batching_scheme = "named"
        polling_interval_ms = 10

        [virtual_instruments.right_gauge]
        type = "batched"
        name = "Right"
        batcher = "gauges"
        channel = "right"
        setter_function = "set_level"
        setter_kwargs = { channel = "right" }

        [virtual_instruments.left_gauge]
        type = "batched"
        name = "Left"
        batcher = "gauges"
        channel = "left"
        "#,
    )
    .unwrap();
    assert_eq!(config.batchers["gauges"].batching_scheme, BatchingScheme::Named);

    let drivers = DriverRegistry::with_builtin().build_all(&config).unwrap();
    let apparatus = Apparatus::build(&config, &drivers, InstrumentContext::default()).unwrap();
    apparatus.start().unwrap();
    let left = apparatus.instrument("left_gauge").unwrap();
    let right = apparatus.instrument("right_gauge").unwrap();
    assert!(eventually(|| {
        left.value() == Value::Float(4.0) && right.value() == Value::Float(9.0)
    }));

    // A write through one member shows up on the next batch read, and only there.
    right.command(12.5).unwrap();
    assert!(eventually(|| right.value() == Value::Float(12.5)));
    assert_eq!(left.value(), Value::Float(4.0));
    apparatus.shutdown().unwrap();
}

#[test]
fn test_sample_bench_configuration_loads() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/apparatus/bench.toml");
    let config = ApparatusConfig::load_from(path).unwrap();

    let manager = ConnectionManager::new(DriverRegistry::with_builtin(), InstrumentContext::default());
    let apparatus = manager.load_apparatus(&config).unwrap();
    assert!(apparatus.is_running());
    assert!(apparatus.instrument("vacuum_chamber_pressure").is_ok());
    assert!(apparatus.instrument("mean_temperature").is_ok());
    assert!(matches!(
        apparatus.instrument("missing"),
        Err(TestbenchError::UnknownInstrument(_))
    ));

    manager.shutdown().unwrap();
    assert!(!apparatus.is_running());
    assert!(manager.apparatus().is_none());
}
