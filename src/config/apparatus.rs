//! Apparatus description: physical drivers, batchers and virtual instruments.
//!
//! ```toml
//! name = "Leak bench"
//!
//! [physical_instruments.gauge]
//! driver = "simulated"
//! [physical_instruments.gauge.channels.pressure]
//! initial = 1000.0
//! target = 1e-3
//! rate = 0.2
//!
//! [virtual_instruments.chamber_pressure]
//! type = "polling"
//! name = "Chamber pressure"
//! unit = "mbar"
//! physical_instrument = "gauge"
//! getter_function = "read"
//! getter_kwargs = { channel = "pressure" }
//! polling_interval_ms = 250
//! ```

use crate::error::{AppResult, TestbenchError};
use crate::instrument::batcher::BatchingScheme;
use crate::instrument::physical::Arguments;
use crate::value::Value;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Whole apparatus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApparatusConfig {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Drivers keyed by id
    #[serde(default)]
    pub physical_instruments: BTreeMap<String, PhysicalInstrumentConfig>,
    /// Batch pollers keyed by id
    #[serde(default)]
    pub batchers: BTreeMap<String, BatcherConfig>,
    /// Virtual instruments keyed by uid
    #[serde(default)]
    pub virtual_instruments: BTreeMap<String, VirtualInstrumentConfig>,
    /// Emergency-stop relay
    #[serde(default)]
    pub estop: Option<EmergencyStopConfig>,
}

/// Emergency-stop relay, driven through a virtual instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyStopConfig {
    /// Ignore fire and reset requests when false
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Uid of the instrument commanded `true` to fire and `false` to reset
    pub relay: String,
}

/// A driver entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalInstrumentConfig {
    /// Driver name. Only `simulated` is built in; others are supplied by the host.
    pub driver: String,
    /// Channels of a simulated driver
    #[serde(default)]
    pub channels: BTreeMap<String, SimulatedChannelConfig>,
    /// Driver-specific settings passed through untouched
    #[serde(default)]
    pub settings: toml::Table,
}

/// One channel of the simulated driver.
///
/// Each read moves the stored value a fraction `rate` of the way to `target`
/// (if set) and adds gaussian noise with standard deviation `noise`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatedChannelConfig {
    /// Starting value
    #[serde(default)]
    pub initial: Value,
    /// Standard deviation of additive noise
    #[serde(default)]
    pub noise: f64,
    /// Value approached on every read
    #[serde(default)]
    pub target: Option<f64>,
    /// Fraction of the remaining distance covered per read
    #[serde(default)]
    pub rate: f64,
}

/// A batch poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Driver id
    pub physical_instrument: String,
    /// Getter function on the driver
    pub getter_function: String,
    /// Extra getter arguments; `channels` is added per cycle
    #[serde(default)]
    pub getter_kwargs: Arguments,
    /// Mux/demux scheme
    #[serde(default)]
    pub batching_scheme: BatchingScheme,
    /// Polling period
    #[serde(default = "default_polling_interval")]
    pub polling_interval_ms: u64,
}

/// A virtual instrument entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualInstrumentConfig {
    /// Display name
    pub name: String,
    /// Display unit
    #[serde(default)]
    pub unit: Option<String>,
    /// Variant-specific settings
    #[serde(flatten)]
    pub kind: VirtualKindConfig,
}

/// Variant-specific virtual instrument settings, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VirtualKindConfig {
    /// Read periodically by its own poller
    Polling {
        /// Driver id
        physical_instrument: String,
        /// Getter function
        getter_function: String,
        /// Getter arguments
        #[serde(default)]
        getter_kwargs: Arguments,
        /// Setter function, if writable
        #[serde(default)]
        setter_function: Option<String>,
        /// Setter arguments
        #[serde(default)]
        setter_kwargs: Arguments,
        /// Polling period
        #[serde(default = "default_polling_interval")]
        polling_interval_ms: u64,
        /// Queue commands for the poller thread
        #[serde(default)]
        defer_commands: bool,
    },
    /// Refreshed by reading back after every command
    CommandDriven {
        /// Driver id
        physical_instrument: String,
        /// Getter function
        getter_function: String,
        /// Getter arguments
        #[serde(default)]
        getter_kwargs: Arguments,
        /// Setter function
        setter_function: String,
        /// Setter arguments
        #[serde(default)]
        setter_kwargs: Arguments,
    },
    /// One channel of a batcher
    Batched {
        /// Batcher id
        batcher: String,
        /// Channel key sent in the channel list
        channel: String,
        /// Setter function on the batcher's driver
        #[serde(default)]
        setter_function: Option<String>,
        /// Setter arguments
        #[serde(default)]
        setter_kwargs: Arguments,
    },
    /// Computed from other instruments
    Composite {
        /// Source instrument uids, in argument order
        sources: Vec<String>,
        /// Built-in composition name
        function: String,
    },
    /// Gaussian noise source
    Noise {
        /// Mean
        mean: f64,
        /// Standard deviation
        standard_deviation: f64,
        /// Polling period
        #[serde(default = "default_noise_interval")]
        polling_interval_ms: u64,
    },
    /// Operator-entered value
    Manual {
        /// Starting value
        #[serde(default)]
        initial: Value,
    },
    /// Discards commands
    Null,
}

fn default_polling_interval() -> u64 {
    500
}

fn default_noise_interval() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl ApparatusConfig {
    /// Load from a TOML file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TestbenchError::Configuration(format!(
                "apparatus file {} does not exist",
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

    /// Check cross references.
    pub fn validate(&self) -> Result<(), String> {
        for (id, batcher) in &self.batchers {
            if !self.physical_instruments.contains_key(&batcher.physical_instrument) {
                return Err(format!(
                    "batcher '{}' references unknown physical instrument '{}'",
                    id, batcher.physical_instrument
                ));
            }
            if batcher.polling_interval_ms == 0 {
                return Err(format!("batcher '{id}' has a zero polling interval"));
            }
        }

        let mut batch_channels = HashSet::new();
        for (uid, instrument) in &self.virtual_instruments {
            match &instrument.kind {
                VirtualKindConfig::Polling {
                    physical_instrument,
                    polling_interval_ms,
                    ..
                } => {
                    self.require_physical(uid, physical_instrument)?;
                    if *polling_interval_ms == 0 {
                        return Err(format!("'{uid}' has a zero polling interval"));
                    }
                }
                VirtualKindConfig::CommandDriven {
                    physical_instrument,
                    ..
                } => self.require_physical(uid, physical_instrument)?,
                VirtualKindConfig::Batched {
                    batcher, channel, ..
                } => {
                    if !self.batchers.contains_key(batcher) {
                        return Err(format!(
                            "'{uid}' references unknown batcher '{batcher}'"
                        ));
                    }
                    if !batch_channels.insert((batcher.clone(), channel.clone())) {
                        return Err(format!(
                            "channel '{channel}' of batcher '{batcher}' is used twice"
                        ));
                    }
                }
                VirtualKindConfig::Composite { sources, .. } => {
                    if sources.is_empty() {
                        return Err(format!("composite '{uid}' has no sources"));
                    }
                    if let Some(missing) = sources
                        .iter()
                        .find(|s| !self.virtual_instruments.contains_key(*s))
                    {
                        return Err(format!(
                            "composite '{uid}' references unknown instrument '{missing}'"
                        ));
                    }
                }
                VirtualKindConfig::Noise {
                    standard_deviation,
                    polling_interval_ms,
                    ..
                } => {
                    if *standard_deviation < 0.0 {
                        return Err(format!("'{uid}' has a negative standard deviation"));
                    }
                    if *polling_interval_ms == 0 {
                        return Err(format!("'{uid}' has a zero polling interval"));
                    }
                }
                VirtualKindConfig::Manual { .. } | VirtualKindConfig::Null => {}
            }
        }
        if let Some(estop) = &self.estop {
            if !self.virtual_instruments.contains_key(&estop.relay) {
                return Err(format!(
                    "emergency stop references unknown relay instrument '{}'",
                    estop.relay
                ));
            }
        }
        Ok(())
    }

    fn require_physical(&self, uid: &str, physical: &str) -> Result<(), String> {
        if self.physical_instruments.contains_key(physical) {
            Ok(())
        } else {
            Err(format!(
                "'{uid}' references unknown physical instrument '{physical}'"
            ))
        }
    }
}
