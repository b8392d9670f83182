//! Custom error types for the testbench.
//!
//! This module defines the primary error type, `TestbenchError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur, from configuration and I/O issues to
//! instrument-specific problems.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or format issues.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine but is
//!   logically wrong (unknown segment type, dangling instrument reference, ...).
//! - **`Io`**: Wraps `std::io::Error`, covering file I/O for recordings and archives.
//! - **`UnsupportedCommand`**: A command was sent to an instrument that does not accept
//!   commands. This indicates a configuration or logic bug and is never silently ignored.
//! - **`Instrument`**: A physical instrument getter or setter failed.
//! - **`Demux`**: A batched reading could not be split back into its channels.
//!
//! By using `#[from]`, `TestbenchError` can be created from underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, TestbenchError>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum TestbenchError {
    /// Configuration file could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is logically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV writer failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Command sent to an instrument that cannot be commanded.
    #[error("{name} (kind: {kind}, uid: {uid}) does not accept commands")]
    UnsupportedCommand {
        /// Instrument uid
        uid: String,
        /// Instrument display name
        name: String,
        /// Instrument kind label
        kind: &'static str,
    },

    /// No instrument with this uid is registered.
    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    /// Physical getter/setter failure.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Batched reading did not match the registered channels.
    #[error("Demultiplexing error: {0}")]
    Demux(String),

    /// Recording bookkeeping failure.
    #[error("Recording error: {0}")]
    Recording(String),

    /// Experiment bookkeeping failure.
    #[error("Experiment error: {0}")]
    Experiment(String),

    /// Worker thread could not be spawned or panicked.
    #[error("Worker thread error: {0}")]
    Worker(String),

    /// Shutdown finished but some workers reported errors.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<TestbenchError>),
}

impl From<figment::Error> for TestbenchError {
    fn from(value: figment::Error) -> Self {
        TestbenchError::Config(Box::new(value))
    }
}

impl From<toml::de::Error> for TestbenchError {
    fn from(value: toml::de::Error) -> Self {
        TestbenchError::Configuration(value.to_string())
    }
}

impl TestbenchError {
    /// Wrap a driver-level failure as an instrument error.
    pub fn instrument(err: impl std::fmt::Display) -> Self {
        TestbenchError::Instrument(err.to_string())
    }
}
