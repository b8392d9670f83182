//! Apparatus assembly and lifecycle.
//!
//! An [`Apparatus`] owns every virtual instrument built from one
//! [`ApparatusConfig`] together with the threads that feed them: one
//! [`Poller`] per polling instrument, one [`Batcher`] per batch group and one
//! [`CompositeUpdater`] per composite. [`ConnectionManager`] swaps apparatus
//! configurations, joining every thread of the old one before the new
//! physical drivers are constructed.

use super::batcher::Batcher;
use super::composite::{builtin, CompositeUpdater};
use super::context::InstrumentContext;
use super::estop::EmergencyStop;
use super::physical::{Binding, DriverRegistry, PhysicalInstrument, PhysicalRegistry};
use super::poller::Poller;
use super::simulated::SimulatedInstrument;
use super::vinstrument::{InstrumentKind, VirtualInstrument};
use crate::config::apparatus::{
    ApparatusConfig, SimulatedChannelConfig, VirtualInstrumentConfig, VirtualKindConfig,
};
use crate::error::{AppResult, TestbenchError};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Uid of the status instrument holding the running segment index.
pub const STATUS_SEGMENT_INDEX: &str = "experiment_segment_index";
/// Uid of the status instrument holding the running segment uid.
pub const STATUS_SEGMENT_UID: &str = "experiment_segment_uid";
/// Uid of the status instrument holding the running segment name.
pub const STATUS_SEGMENT_NAME: &str = "experiment_segment_name";

const NOISE_CHANNEL: &str = "noise";

/// The three instruments the sequencer publishes progress to.
#[derive(Debug, Clone)]
pub struct StatusInstruments {
    /// Segment index, -1 before the first segment
    pub index: Arc<VirtualInstrument>,
    /// Segment uid
    pub uid: Arc<VirtualInstrument>,
    /// Segment display name
    pub name: Arc<VirtualInstrument>,
}

impl StatusInstruments {
    fn new(context: &InstrumentContext) -> Self {
        let make = |uid: &str, name: &str| {
            Arc::new(VirtualInstrument::new(
                uid,
                name,
                InstrumentKind::ExperimentStatus,
                context.clone(),
            ))
        };
        Self {
            index: make(STATUS_SEGMENT_INDEX, "Experiment segment index"),
            uid: make(STATUS_SEGMENT_UID, "Experiment segment UID"),
            name: make(STATUS_SEGMENT_NAME, "Experiment segment name"),
        }
    }

    /// Publish the running segment.
    pub fn publish(&self, index: i64, uid: impl Into<Value>, name: impl Into<Value>) {
        self.index.set_value(Value::Int(index));
        self.uid.set_value(uid.into());
        self.name.set_value(name.into());
    }

    fn all(&self) -> [&Arc<VirtualInstrument>; 3] {
        [&self.index, &self.uid, &self.name]
    }
}

/// Every virtual instrument of one apparatus plus its worker threads.
pub struct Apparatus {
    name: String,
    context: InstrumentContext,
    instruments: BTreeMap<String, Arc<VirtualInstrument>>,
    status: StatusInstruments,
    pollers: Vec<Poller>,
    batchers: Vec<Batcher>,
    composites: Vec<CompositeUpdater>,
    estop: Option<Arc<EmergencyStop>>,
    running: AtomicBool,
}

impl std::fmt::Debug for Apparatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Apparatus")
            .field("name", &self.name)
            .field("instruments", &self.instruments.keys().collect::<Vec<_>>())
            .field("pollers", &self.pollers.len())
            .field("batchers", &self.batchers.len())
            .field("composites", &self.composites.len())
            .field("estop", &self.estop.as_ref().map(|e| e.relay().uid()))
            .field("running", &self.is_running())
            .finish()
    }
}

impl Apparatus {
    /// Build every virtual instrument. No thread is started.
    ///
    /// Composites are built after their sources; a reference cycle between
    /// composites is a configuration error.
    pub fn build(
        config: &ApparatusConfig,
        drivers: &PhysicalRegistry,
        context: InstrumentContext,
    ) -> AppResult<Self> {
        config.validate().map_err(TestbenchError::Configuration)?;

        let status = StatusInstruments::new(&context);
        let mut instruments = BTreeMap::new();
        for inst in status.all() {
            if config.virtual_instruments.contains_key(inst.uid()) {
                return Err(TestbenchError::Configuration(format!(
                    "'{}' is reserved for experiment status",
                    inst.uid()
                )));
            }
            instruments.insert(inst.uid().to_string(), Arc::clone(inst));
        }

        let mut batchers = BTreeMap::new();
        for (id, entry) in &config.batchers {
            let driver = lookup_driver(drivers, &entry.physical_instrument)?;
            let getter = Binding::new(
                driver,
                entry.getter_function.clone(),
                entry.getter_kwargs.clone(),
            );
            let batcher = Batcher::new(
                id.clone(),
                getter,
                entry.batching_scheme,
                Duration::from_millis(entry.polling_interval_ms),
            );
            batchers.insert(id.clone(), batcher);
        }

        let mut pollers = Vec::new();
        let mut composite_configs = Vec::new();
        for (uid, entry) in &config.virtual_instruments {
            let build = |kind| {
                Arc::new(
                    VirtualInstrument::new(uid.clone(), entry.name.clone(), kind, context.clone())
                        .with_unit(entry.unit.clone()),
                )
            };
            let instrument = match &entry.kind {
                VirtualKindConfig::Polling {
                    physical_instrument,
                    getter_function,
                    getter_kwargs,
                    setter_function,
                    setter_kwargs,
                    polling_interval_ms,
                    defer_commands,
                } => {
                    let driver = lookup_driver(drivers, physical_instrument)?;
                    let setter = setter_function.as_ref().map(|function| {
                        Binding::new(Arc::clone(&driver), function.clone(), setter_kwargs.clone())
                    });
                    let getter = Binding::new(driver, getter_function.clone(), getter_kwargs.clone());
                    let instrument = build(InstrumentKind::polling(setter, *defer_commands));
                    pollers.push(Poller::new(
                        Arc::clone(&instrument),
                        getter,
                        Duration::from_millis(*polling_interval_ms),
                    ));
                    instrument
                }
                VirtualKindConfig::CommandDriven {
                    physical_instrument,
                    getter_function,
                    getter_kwargs,
                    setter_function,
                    setter_kwargs,
                } => {
                    let driver = lookup_driver(drivers, physical_instrument)?;
                    build(InstrumentKind::CommandDriven {
                        setter: Binding::new(
                            Arc::clone(&driver),
                            setter_function.clone(),
                            setter_kwargs.clone(),
                        ),
                        getter: Binding::new(driver, getter_function.clone(), getter_kwargs.clone()),
                    })
                }
                VirtualKindConfig::Batched {
                    batcher,
                    channel,
                    setter_function,
                    setter_kwargs,
                } => {
                    let group = batchers.get(batcher).ok_or_else(|| {
                        TestbenchError::Configuration(format!(
                            "'{uid}' references unknown batcher '{batcher}'"
                        ))
                    })?;
                    let setter = match setter_function {
                        Some(function) => {
                            let physical = &config.batchers[batcher].physical_instrument;
                            Some(Binding::new(
                                lookup_driver(drivers, physical)?,
                                function.clone(),
                                setter_kwargs.clone(),
                            ))
                        }
                        None => None,
                    };
                    let instrument = build(InstrumentKind::Batched { setter });
                    group.register(channel.clone(), Arc::clone(&instrument))?;
                    instrument
                }
                VirtualKindConfig::Noise {
                    mean,
                    standard_deviation,
                    polling_interval_ms,
                } => {
                    let source = SimulatedInstrument::new(format!("{uid}-noise"));
                    source.add_channel(
                        NOISE_CHANNEL,
                        &SimulatedChannelConfig {
                            initial: Value::Float(*mean),
                            noise: *standard_deviation,
                            ..SimulatedChannelConfig::default()
                        },
                    );
                    let source: Arc<dyn PhysicalInstrument> = Arc::new(source);
                    let instrument = build(InstrumentKind::polling(None, false));
                    pollers.push(Poller::new(
                        Arc::clone(&instrument),
                        Binding::new(source, NOISE_CHANNEL, Default::default()),
                        Duration::from_millis(*polling_interval_ms),
                    ));
                    instrument
                }
                VirtualKindConfig::Manual { initial } => {
                    let instrument = build(InstrumentKind::Manual);
                    if !initial.is_none() {
                        instrument.set_value(initial.clone());
                    }
                    instrument
                }
                VirtualKindConfig::Null => build(InstrumentKind::Null),
                VirtualKindConfig::Composite { .. } => {
                    composite_configs.push((uid, entry));
                    continue;
                }
            };
            debug!(uid = %uid, kind = instrument.kind().label(), "Virtual instrument built");
            instruments.insert(uid.clone(), instrument);
        }

        let composites = build_composites(composite_configs, &mut instruments, &context)?;
        let estop = match &config.estop {
            Some(entry) => {
                let relay = instruments
                    .get(&entry.relay)
                    .cloned()
                    .ok_or_else(|| TestbenchError::UnknownInstrument(entry.relay.clone()))?;
                Some(Arc::new(EmergencyStop::new(relay, entry.enabled)))
            }
            None => None,
        };

        info!(
            apparatus = %config.name,
            instruments = instruments.len(),
            pollers = pollers.len(),
            batchers = batchers.len(),
            composites = composites.len(),
            "Apparatus built"
        );
        Ok(Self {
            name: config.name.clone(),
            context,
            instruments,
            status,
            pollers,
            batchers: batchers.into_values().collect(),
            composites,
            estop,
            running: AtomicBool::new(false),
        })
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Context shared by every instrument.
    pub fn context(&self) -> &InstrumentContext {
        &self.context
    }

    /// Look up an instrument by uid.
    pub fn instrument(&self, uid: &str) -> AppResult<Arc<VirtualInstrument>> {
        self.instruments
            .get(uid)
            .cloned()
            .ok_or_else(|| TestbenchError::UnknownInstrument(uid.to_string()))
    }

    /// Every instrument, keyed by uid.
    pub fn instruments(&self) -> &BTreeMap<String, Arc<VirtualInstrument>> {
        &self.instruments
    }

    /// Emergency-stop relay, if one is configured.
    pub fn emergency_stop(&self) -> Option<&Arc<EmergencyStop>> {
        self.estop.as_ref()
    }

    /// Sequencer progress instruments.
    pub fn status_instruments(&self) -> &StatusInstruments {
        &self.status
    }

    /// Whether the worker threads are running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start every poller, batcher and composite updater.
    ///
    /// If any thread fails to start, the ones already started are stopped
    /// again before the error is returned.
    pub fn start(&self) -> AppResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let started = self
            .composites
            .iter()
            .try_for_each(CompositeUpdater::start)
            .and_then(|_| self.batchers.iter().try_for_each(Batcher::start))
            .and_then(|_| self.pollers.iter().try_for_each(Poller::start));
        if let Err(e) = started {
            error!(apparatus = %self.name, error = %e, "Apparatus failed to start");
            if let Err(stop_err) = self.stop_workers() {
                warn!(error = %stop_err, "Errors while stopping partially started apparatus");
            }
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!(apparatus = %self.name, "Apparatus started");
        Ok(())
    }

    /// Stop and join every thread, unregister composites and close recordings.
    ///
    /// Every stop flag is raised before the first join so the threads wind
    /// down in parallel. Calling this on a stopped apparatus is a no-op.
    pub fn shutdown(&self) -> AppResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(apparatus = %self.name, "Shutting down apparatus");
        let result = self.stop_workers();
        for composite in &self.composites {
            composite.detach();
        }
        for instrument in self.instruments.values() {
            instrument.stop_all_recordings();
        }
        match &result {
            Ok(()) => info!(apparatus = %self.name, "Apparatus stopped"),
            Err(e) => error!(apparatus = %self.name, error = %e, "Apparatus stopped with errors"),
        }
        result
    }

    fn stop_workers(&self) -> AppResult<()> {
        for poller in &self.pollers {
            poller.signal_stop();
        }
        for batcher in &self.batchers {
            batcher.signal_stop();
        }
        for composite in &self.composites {
            composite.signal_stop();
        }

        let mut errors = Vec::new();
        let joins = self
            .pollers
            .iter()
            .map(Poller::join)
            .chain(self.batchers.iter().map(Batcher::join))
            .chain(self.composites.iter().map(CompositeUpdater::join));
        for joined in joins {
            if let Err(e) = joined {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TestbenchError::ShutdownFailed(errors))
        }
    }
}

impl Drop for Apparatus {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(apparatus = %self.name, error = %e, "Apparatus shutdown on drop failed");
        }
    }
}

fn lookup_driver(drivers: &PhysicalRegistry, id: &str) -> AppResult<Arc<dyn PhysicalInstrument>> {
    drivers.get(id).cloned().ok_or_else(|| {
        TestbenchError::Configuration(format!("physical instrument '{id}' was not constructed"))
    })
}

/// Build composites once all of their sources exist.
fn build_composites(
    mut pending: Vec<(&String, &VirtualInstrumentConfig)>,
    instruments: &mut BTreeMap<String, Arc<VirtualInstrument>>,
    context: &InstrumentContext,
) -> AppResult<Vec<CompositeUpdater>> {
    let mut updaters = Vec::new();
    while !pending.is_empty() {
        let before = pending.len();
        let mut blocked = Vec::new();
        for (uid, entry) in pending {
            let VirtualKindConfig::Composite { sources, function } = &entry.kind else {
                continue;
            };
            if !sources.iter().all(|s| instruments.contains_key(s)) {
                blocked.push((uid, entry));
                continue;
            }
            let function = builtin(function).ok_or_else(|| {
                TestbenchError::Configuration(format!(
                    "composite '{uid}' uses unknown function '{function}'"
                ))
            })?;
            let sources = sources.iter().map(|s| Arc::clone(&instruments[s])).collect();
            let instrument = Arc::new(
                VirtualInstrument::new(
                    uid.clone(),
                    entry.name.clone(),
                    InstrumentKind::Composite,
                    context.clone(),
                )
                .with_unit(entry.unit.clone()),
            );
            updaters.push(CompositeUpdater::new(Arc::clone(&instrument), sources, function)?);
            instruments.insert(uid.clone(), instrument);
        }
        if blocked.len() == before {
            let uids: Vec<&str> = blocked.iter().map(|(uid, _)| uid.as_str()).collect();
            return Err(TestbenchError::Configuration(format!(
                "composite instruments form a cycle: {}",
                uids.join(", ")
            )));
        }
        pending = blocked;
    }
    Ok(updaters)
}

/// Owns the live apparatus and swaps it on reconfiguration.
#[derive(Debug)]
pub struct ConnectionManager {
    drivers: DriverRegistry,
    context: InstrumentContext,
    apparatus: Mutex<Option<Arc<Apparatus>>>,
}

impl ConnectionManager {
    /// Manager with no apparatus loaded.
    pub fn new(drivers: DriverRegistry, context: InstrumentContext) -> Self {
        Self {
            drivers,
            context,
            apparatus: Mutex::new(None),
        }
    }

    /// Replace the live apparatus.
    ///
    /// The old apparatus is fully stopped and joined before any driver of the
    /// new one is constructed, so no two threads ever drive the same hardware.
    pub fn load_apparatus(&self, config: &ApparatusConfig) -> AppResult<Arc<Apparatus>> {
        let mut slot = self.apparatus.lock();
        if let Some(old) = slot.take() {
            info!(apparatus = %old.name(), "Unloading apparatus");
            old.shutdown()?;
        }
        let drivers = self.drivers.build_all(config)?;
        let apparatus = Arc::new(Apparatus::build(config, &drivers, self.context.clone())?);
        apparatus.start()?;
        *slot = Some(Arc::clone(&apparatus));
        Ok(apparatus)
    }

    /// Live apparatus, if any.
    pub fn apparatus(&self) -> Option<Arc<Apparatus>> {
        self.apparatus.lock().clone()
    }

    /// Stop the live apparatus.
    pub fn shutdown(&self) -> AppResult<()> {
        match self.apparatus.lock().take() {
            Some(apparatus) => apparatus.shutdown(),
            None => Ok(()),
        }
    }
}
