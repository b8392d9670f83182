//! Virtual instruments and the threads that feed them.
//!
//! - [`physical`]: the driver seam ([`PhysicalInstrument`]) and driver factories
//! - [`vinstrument`]: [`VirtualInstrument`], the shared value/recording model
//! - [`poller`], [`batcher`], [`composite`]: worker threads
//! - [`apparatus`]: assembly from configuration and lifecycle
//! - [`simulated`]: built-in in-memory driver
//! - [`estop`]: emergency-stop relay

pub mod apparatus;
pub mod batcher;
pub mod composite;
pub mod context;
pub mod estop;
pub mod physical;
pub mod poller;
pub mod simulated;
pub mod vinstrument;
pub mod worker;

pub use apparatus::{
    Apparatus, ConnectionManager, StatusInstruments, STATUS_SEGMENT_INDEX, STATUS_SEGMENT_NAME,
    STATUS_SEGMENT_UID,
};
pub use batcher::{Batcher, BatchingScheme};
pub use composite::{builtin as composition, CompositeUpdater, CompositionFn};
pub use context::{ActiveSegment, InstrumentContext};
pub use estop::EmergencyStop;
pub use physical::{
    Arguments, Binding, DriverFactory, DriverRegistry, PhysicalInstrument, PhysicalRegistry,
    Reading,
};
pub use poller::Poller;
pub use simulated::{SimulatedFactory, SimulatedInstrument};
pub use vinstrument::{InstrumentKind, VirtualInstrument};
pub use worker::Worker;
