//! # Testbench
//!
//! Laboratory testbench orchestrator: polls physical instruments through
//! virtual instruments, runs scripted multi-segment experiments against them
//! one at a time, and records every run to CSV with memory-bounded,
//! progressively downsampled in-memory copies for display.
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-based settings plus the apparatus and experiment
//!   description types.
//! - **`error`**: the crate-wide `TestbenchError` enum.
//! - **`experiment`**: segments, the sequencer with its shared run lock, and
//!   the experiment runner.
//! - **`instrument`**: virtual instruments, pollers, batchers, composite
//!   updaters, the driver seam and apparatus lifecycle.
//! - **`logging`**: tracing subscriber setup.
//! - **`notify`**: operator alerts and run archiving collaborators.
//! - **`recording`**: the downsampling recorder and CSV recording files.
//! - **`signal`**: stop signals and the semaphore used by worker threads.
//! - **`value`**: the dynamically typed instrument value.
//!
//! ## Threads
//!
//! Each polled instrument, batcher, composite updater and running experiment
//! owns one OS thread. Instrument values are guarded by a short-held mutex, so
//! readers on other threads (dashboards, chat) never block on hardware.

pub mod config;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod logging;
pub mod notify;
pub mod recording;
pub mod signal;
pub mod value;

pub use error::{AppResult, TestbenchError};
pub use value::Value;
