//! Simulated physical instrument.
//!
//! An in-memory driver with named channels, used when no hardware is attached
//! and throughout the tests. Channels can hold a settable value, drift towards
//! a target on every read (a pump bringing a chamber down, a heater warming
//! up) and carry gaussian noise.
//!
//! # Functions
//!
//! | function | arguments | reply |
//! |---|---|---|
//! | `read` / any channel name | `channel` (optional) | scalar |
//! | `read_channels` | `channels = [..]` | list, request order |
//! | `read_named` | `channels = [..]` | table keyed by channel |
//! | any (write) | `channel` (optional) | stores the value |
//!
//! Without a `channel` argument the function name is the channel.

use super::batcher::CHANNELS_ARGUMENT;
use super::physical::{Arguments, DriverFactory, PhysicalInstrument, Reading};
use crate::config::apparatus::{PhysicalInstrumentConfig, SimulatedChannelConfig};
use crate::value::Value;
use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::Arc;

/// Driver name used in apparatus files.
pub const DRIVER_NAME: &str = "simulated";

#[derive(Debug, Clone)]
struct Channel {
    value: Value,
    noise: f64,
    target: Option<f64>,
    rate: f64,
}

impl From<&SimulatedChannelConfig> for Channel {
    fn from(config: &SimulatedChannelConfig) -> Self {
        Self {
            value: config.initial.clone(),
            noise: config.noise.max(0.0),
            target: config.target,
            rate: config.rate.clamp(0.0, 1.0),
        }
    }
}

/// In-memory multi-channel driver.
pub struct SimulatedInstrument {
    name: String,
    channels: Mutex<BTreeMap<String, Channel>>,
    rng: Mutex<StdRng>,
    writes: Mutex<Vec<(String, Value)>>,
}

impl std::fmt::Debug for SimulatedInstrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedInstrument")
            .field("name", &self.name)
            .field("channels", &self.channels.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SimulatedInstrument {
    /// Driver with no channels and an entropy-seeded generator.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channels: Mutex::new(BTreeMap::new()),
            rng: Mutex::new(StdRng::from_entropy()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Build from an apparatus entry.
    pub fn from_config(name: &str, config: &PhysicalInstrumentConfig) -> Self {
        let sim = Self::new(name);
        if let Some(seed) = config.settings.get("seed").and_then(toml::Value::as_integer) {
            sim.reseed(seed as u64);
        }
        for (channel, channel_config) in &config.channels {
            sim.add_channel(channel, channel_config);
        }
        sim
    }

    /// Make the noise reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        self.reseed(seed);
        self
    }

    fn reseed(&self, seed: u64) {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
    }

    /// Add or replace a channel.
    pub fn add_channel(&self, channel: &str, config: &SimulatedChannelConfig) {
        self.channels
            .lock()
            .insert(channel.to_string(), Channel::from(config));
    }

    /// Add a plain settable channel.
    pub fn with_channel(self, channel: &str, initial: impl Into<Value>) -> Self {
        self.add_channel(
            channel,
            &SimulatedChannelConfig {
                initial: initial.into(),
                ..SimulatedChannelConfig::default()
            },
        );
        self
    }

    /// Every write received, oldest first.
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.writes.lock().clone()
    }

    fn read_channel(&self, channel: &str) -> anyhow::Result<Value> {
        let mut channels = self.channels.lock();
        let state = channels
            .get_mut(channel)
            .ok_or_else(|| anyhow!("{} has no channel '{}'", self.name, channel))?;

        let Some(mut current) = state.value.as_f64().filter(|_| !matches!(state.value, Value::Bool(_)))
        else {
            return Ok(state.value.clone());
        };
        if let Some(target) = state.target {
            current += (target - current) * state.rate;
            state.value = Value::Float(current);
        }
        if state.noise > 0.0 {
            current += gaussian(&mut self.rng.lock(), state.noise);
        }
        Ok(Value::Float(current))
    }

    fn requested_channels(args: &Arguments) -> anyhow::Result<Vec<String>> {
        let list = args
            .get(CHANNELS_ARGUMENT)
            .and_then(toml::Value::as_array)
            .ok_or_else(|| anyhow!("missing '{CHANNELS_ARGUMENT}' list argument"))?;
        list.iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("channel names must be strings, got {v}"))
            })
            .collect()
    }
}

/// Zero-mean normal sample (Box-Muller).
fn gaussian(rng: &mut StdRng, standard_deviation: f64) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    standard_deviation * (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

fn channel_argument<'a>(function: &'a str, args: &'a Arguments) -> &'a str {
    args.get("channel")
        .and_then(toml::Value::as_str)
        .unwrap_or(function)
}

impl PhysicalInstrument for SimulatedInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, function: &str, args: &Arguments) -> anyhow::Result<Reading> {
        match function {
            "read_channels" => {
                let values = Self::requested_channels(args)?
                    .iter()
                    .map(|c| self.read_channel(c))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Ok(Reading::List(values))
            }
            "read_named" => {
                let mut values = BTreeMap::new();
                for channel in Self::requested_channels(args)? {
                    let value = self.read_channel(&channel)?;
                    values.insert(channel, value);
                }
                Ok(Reading::Named(values))
            }
            _ => Ok(Reading::Scalar(
                self.read_channel(channel_argument(function, args))?,
            )),
        }
    }

    fn write(&self, function: &str, value: &Value, args: &Arguments) -> anyhow::Result<()> {
        if matches!(function, "read_channels" | "read_named") {
            bail!("'{function}' is read-only");
        }
        let channel = channel_argument(function, args).to_string();
        self.channels
            .lock()
            .entry(channel.clone())
            .and_modify(|c| c.value = value.clone())
            .or_insert_with(|| Channel {
                value: value.clone(),
                noise: 0.0,
                target: None,
                rate: 0.0,
            });
        self.writes.lock().push((channel, value.clone()));
        Ok(())
    }
}

/// Factory for `driver = "simulated"` entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedFactory;

impl DriverFactory for SimulatedFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER_NAME
    }

    fn build(
        &self,
        id: &str,
        config: &PhysicalInstrumentConfig,
    ) -> anyhow::Result<Arc<dyn PhysicalInstrument>> {
        Ok(Arc::new(SimulatedInstrument::from_config(id, config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, toml::Value)]) -> Arguments {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn settable_channel_round_trip() {
        let sim = SimulatedInstrument::new("psu").with_channel("voltage", 0.0);
        let by_arg = args(&[("channel", "voltage".into())]);
        sim.write("set", &Value::Float(12.0), &by_arg).unwrap();
        assert_eq!(
            sim.read("read", &by_arg).unwrap(),
            Reading::Scalar(Value::Float(12.0))
        );
        assert_eq!(
            sim.read("voltage", &Arguments::new()).unwrap(),
            Reading::Scalar(Value::Float(12.0))
        );
        assert_eq!(sim.writes(), vec![("voltage".to_string(), Value::Float(12.0))]);
    }

    #[test]
    fn drift_approaches_target() {
        let sim = SimulatedInstrument::new("gauge");
        sim.add_channel(
            "pressure",
            &SimulatedChannelConfig {
                initial: Value::Float(1000.0),
                target: Some(0.0),
                rate: 0.5,
                ..SimulatedChannelConfig::default()
            },
        );
        let read = || sim.read("pressure", &Arguments::new()).unwrap();
        assert_eq!(read(), Reading::Scalar(Value::Float(500.0)));
        assert_eq!(read(), Reading::Scalar(Value::Float(250.0)));
    }

    #[test]
    fn noise_is_seeded_and_centred() {
        let noisy = SimulatedChannelConfig {
            initial: Value::Float(5.0),
            noise: 0.1,
            ..SimulatedChannelConfig::default()
        };
        let a = SimulatedInstrument::new("a").with_seed(7);
        let b = SimulatedInstrument::new("b").with_seed(7);
        a.add_channel("x", &noisy);
        b.add_channel("x", &noisy);
        let mut sum = 0.0;
        for _ in 0..500 {
            let ra = a.read("x", &Arguments::new()).unwrap();
            assert_eq!(ra, b.read("x", &Arguments::new()).unwrap());
            if let Reading::Scalar(v) = ra {
                sum += v.as_f64().unwrap();
            }
        }
        assert!((sum / 500.0 - 5.0).abs() < 0.05);
    }

    #[test]
    fn multi_channel_reads() {
        let sim = SimulatedInstrument::new("dmm")
            .with_channel("@101", 1.0)
            .with_channel("@102", 2.0);
        let list = args(&[(
            CHANNELS_ARGUMENT,
            toml::Value::Array(vec!["@102".into(), "@101".into()]),
        )]);
        assert_eq!(
            sim.read("read_channels", &list).unwrap(),
            Reading::List(vec![Value::Float(2.0), Value::Float(1.0)])
        );
        match sim.read("read_named", &list).unwrap() {
            Reading::Named(map) => assert_eq!(map["@101"], Value::Float(1.0)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(sim.read("read_channels", &Arguments::new()).is_err());
        assert!(sim.read("missing", &Arguments::new()).is_err());
    }
}
