//! Experiment execution.
//!
//! Experiments are ordered lists of [`Segment`]s built from configuration by
//! the [`factory`], run one at a time under a shared [`ExperimentLock`] by the
//! [`sequencer`], and registered per apparatus in an [`ExperimentRunner`].

pub mod factory;
pub mod lock;
pub mod runner;
pub mod segment;
pub mod sequencer;
pub mod state;
pub mod threshold;

pub use factory::{build_experiment, build_segment};
pub use lock::{ExperimentLock, ExperimentLockGuard};
pub use runner::{ActiveRun, ExperimentRunner};
pub use segment::{RunContext, Segment, SegmentError, SegmentKind, SegmentState};
pub use sequencer::{Experiment, ExperimentServices, ExperimentStatus};
pub use state::{ExperimentState, RunSummary};
pub use threshold::{Comparison, ThresholdLastNValues};
