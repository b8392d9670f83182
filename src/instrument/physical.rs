//! Physical instrument seam.
//!
//! Hardware drivers live outside this crate. A virtual instrument talks to its
//! driver through [`PhysicalInstrument`] using the getter/setter function names
//! and keyword arguments from the apparatus configuration; a [`Binding`] bundles
//! a driver with one such function call.
//!
//! # Contract
//! - Implementations must be thread-safe: a driver may be read by a poller
//!   thread while a segment commands it from the experiment thread.
//! - Errors are transient by default; the caller logs them and skips the sample.

use crate::config::apparatus::{ApparatusConfig, PhysicalInstrumentConfig};
use crate::error::{AppResult, TestbenchError};
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Keyword arguments passed to getter/setter functions.
pub type Arguments = toml::Table;

/// Driver objects available to an apparatus, keyed by physical instrument id.
pub type PhysicalRegistry = HashMap<String, Arc<dyn PhysicalInstrument>>;

/// Result of a getter call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// A single value
    Scalar(Value),
    /// One value per requested channel, in request order
    List(Vec<Value>),
    /// Values keyed by channel name
    Named(BTreeMap<String, Value>),
}

impl Reading {
    /// Collapse to a single value. One-element lists are accepted.
    pub fn into_scalar(self) -> AppResult<Value> {
        match self {
            Reading::Scalar(v) => Ok(v),
            Reading::List(mut values) if values.len() == 1 => Ok(values.remove(0)),
            Reading::List(values) => Err(TestbenchError::Instrument(format!(
                "expected a single value, got a list of {}",
                values.len()
            ))),
            Reading::Named(map) if map.len() == 1 => {
                Ok(map.into_values().next().unwrap_or_default())
            }
            Reading::Named(map) => Err(TestbenchError::Instrument(format!(
                "expected a single value, got {} named values",
                map.len()
            ))),
        }
    }
}

impl From<Value> for Reading {
    fn from(value: Value) -> Self {
        Reading::Scalar(value)
    }
}

/// A hardware driver, or anything standing in for one.
pub trait PhysicalInstrument: Send + Sync {
    /// Driver name used in logs and thread names.
    fn name(&self) -> &str;

    /// Call a getter function.
    fn read(&self, function: &str, args: &Arguments) -> anyhow::Result<Reading>;

    /// Call a setter function with the commanded value.
    fn write(&self, function: &str, value: &Value, args: &Arguments) -> anyhow::Result<()>;
}

/// A driver plus the function and arguments used to call it.
#[derive(Clone)]
pub struct Binding {
    /// Driver
    pub instrument: Arc<dyn PhysicalInstrument>,
    /// Function name on the driver
    pub function: String,
    /// Keyword arguments
    pub args: Arguments,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("instrument", &self.instrument.name())
            .field("function", &self.function)
            .field("args", &self.args)
            .finish()
    }
}

impl Binding {
    /// Bind a driver function.
    pub fn new(
        instrument: Arc<dyn PhysicalInstrument>,
        function: impl Into<String>,
        args: Arguments,
    ) -> Self {
        Self {
            instrument,
            function: function.into(),
            args,
        }
    }

    /// Call the getter with the bound arguments.
    pub fn read(&self) -> AppResult<Reading> {
        self.read_with(&self.args)
    }

    /// Call the getter with replacement arguments.
    pub fn read_with(&self, args: &Arguments) -> AppResult<Reading> {
        self.instrument
            .read(&self.function, args)
            .map_err(|e| self.failure("read", e))
    }

    /// Call the getter and collapse the result to one value.
    pub fn read_value(&self) -> AppResult<Value> {
        self.read()?.into_scalar()
    }

    /// Call the setter.
    pub fn write(&self, value: &Value) -> AppResult<()> {
        self.instrument
            .write(&self.function, value, &self.args)
            .map_err(|e| self.failure("write", e))
    }

    fn failure(&self, op: &str, err: anyhow::Error) -> TestbenchError {
        TestbenchError::Instrument(format!(
            "{} {} via '{}' failed: {:#}",
            self.instrument.name(),
            op,
            self.function,
            err
        ))
    }
}

/// Builds driver objects for one `driver` name of the apparatus file.
pub trait DriverFactory: Send + Sync + 'static {
    /// Value of the `driver` field this factory handles.
    fn driver_type(&self) -> &'static str;

    /// Construct the driver for physical instrument `id`.
    fn build(
        &self,
        id: &str,
        config: &PhysicalInstrumentConfig,
    ) -> anyhow::Result<Arc<dyn PhysicalInstrument>>;
}

/// Driver factories known to the host, keyed by driver type.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<&'static str, Arc<dyn DriverFactory>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("DriverRegistry").field("drivers", &types).finish()
    }
}

impl DriverRegistry {
    /// Registry with no drivers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in simulated driver.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::simulated::SimulatedFactory));
        registry
    }

    /// Add a factory, replacing one with the same driver type.
    pub fn register(&mut self, factory: Arc<dyn DriverFactory>) {
        self.factories.insert(factory.driver_type(), factory);
    }

    /// Construct every physical instrument of an apparatus.
    pub fn build_all(&self, config: &ApparatusConfig) -> AppResult<PhysicalRegistry> {
        let mut drivers = PhysicalRegistry::new();
        for (id, entry) in &config.physical_instruments {
            let factory = self.factories.get(entry.driver.as_str()).ok_or_else(|| {
                TestbenchError::Configuration(format!(
                    "physical instrument '{}' uses unknown driver '{}'",
                    id, entry.driver
                ))
            })?;
            let driver = factory.build(id, entry).map_err(|e| {
                TestbenchError::Instrument(format!("failed to construct '{id}': {e:#}"))
            })?;
            info!(id = %id, driver = %entry.driver, "Physical instrument constructed");
            drivers.insert(id.clone(), driver);
        }
        Ok(drivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl PhysicalInstrument for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn read(&self, _: &str, _: &Arguments) -> anyhow::Result<Reading> {
            anyhow::bail!("timeout")
        }
        fn write(&self, _: &str, _: &Value, _: &Arguments) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn scalar_collapse() {
        assert_eq!(
            Reading::List(vec![Value::Int(1)]).into_scalar().unwrap(),
            Value::Int(1)
        );
        assert!(Reading::List(vec![Value::Int(1), Value::Int(2)])
            .into_scalar()
            .is_err());
    }

    #[test]
    fn unknown_driver_is_a_configuration_error() {
        let config = ApparatusConfig::from_toml_str(
            "[physical_instruments.psu]\ndriver = \"visa\"\n",
        )
        .unwrap();
        let Err(err) = DriverRegistry::with_builtin().build_all(&config) else {
            panic!("unknown driver was accepted");
        };
        assert!(matches!(err, TestbenchError::Configuration(_)));
        assert!(err.to_string().contains("visa"));
    }

    #[test]
    fn binding_errors_name_the_driver() {
        let binding = Binding::new(Arc::new(Failing), "measure", Arguments::new());
        let err = binding.read_value().unwrap_err().to_string();
        assert!(err.contains("failing"));
        assert!(err.contains("measure"));
        assert!(err.contains("timeout"));
    }
}
