//! Batched polling of multi-channel physical instruments.
//!
//! Some hardware answers one request for many channels faster than many single
//! requests (a scanning multimeter with an SCPI channel list, for example). A
//! [`Batcher`] owns one polling thread per physical instrument, builds the
//! channel-selection arguments from the registered virtual instruments (mux),
//! issues one read, and distributes the reply back to them (demux).

use super::physical::{Arguments, Binding, Reading};
use super::vinstrument::VirtualInstrument;
use super::worker::{run_periodic, Worker};
use crate::error::{AppResult, TestbenchError};
use crate::value::Value;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Argument key carrying the channel list.
pub const CHANNELS_ARGUMENT: &str = "channels";

/// How channel selection is encoded and how replies are split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchingScheme {
    /// `channels = [..]` argument, reply is a list in the same order
    #[default]
    #[serde(alias = "SCPI_chanlist")]
    ChannelList,
    /// `channels = [..]` argument, reply is keyed by channel
    Named,
}

type Channel = (String, Arc<VirtualInstrument>);

/// One polling thread serving several virtual instruments.
#[derive(Debug)]
pub struct Batcher {
    uid: String,
    getter: Binding,
    scheme: BatchingScheme,
    interval: Duration,
    channels: Arc<RwLock<Vec<Channel>>>,
    worker: Worker,
}

impl Batcher {
    /// Create a batcher with no channels.
    pub fn new(
        uid: impl Into<String>,
        getter: Binding,
        scheme: BatchingScheme,
        interval: Duration,
    ) -> Self {
        let uid = uid.into();
        let worker = Worker::new(format!("batch-{uid}"));
        Self {
            uid,
            getter,
            scheme,
            interval,
            channels: Arc::new(RwLock::new(Vec::new())),
            worker,
        }
    }

    /// Batcher id.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Registered channel keys, in request order.
    pub fn channel_keys(&self) -> Vec<String> {
        self.channels.read().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Add a channel. Rejected once polling has started.
    pub fn register(&self, channel: impl Into<String>, instrument: Arc<VirtualInstrument>) -> AppResult<()> {
        let channel = channel.into();
        if self.worker.is_running() {
            return Err(TestbenchError::Configuration(format!(
                "cannot register channel '{}' on batcher '{}' while it is polling",
                channel, self.uid
            )));
        }
        let mut channels = self.channels.write();
        if channels.iter().any(|(k, _)| *k == channel) {
            return Err(TestbenchError::Configuration(format!(
                "channel '{}' is already registered on batcher '{}'",
                channel, self.uid
            )));
        }
        channels.push((channel, instrument));
        Ok(())
    }

    /// Run one batch cycle on the calling thread.
    pub fn poll_once(&self) -> AppResult<()> {
        batch_cycle(&self.getter, self.scheme, &self.channels.read())
    }

    /// Spawn the polling thread.
    pub fn start(&self) -> AppResult<()> {
        let getter = self.getter.clone();
        let scheme = self.scheme;
        let channels = Arc::clone(&self.channels);
        let interval = self.interval;
        let label = self.worker.name().to_string();
        self.worker.spawn(move |stop| {
            run_periodic(&label, interval, &stop, || {
                if let Err(e) = batch_cycle(&getter, scheme, &channels.read()) {
                    warn!(batcher = %label, error = %e, "Batch poll failed, samples skipped");
                }
            });
        })?;
        info!(
            batcher = %self.uid,
            channels = self.channels.read().len(),
            interval_ms = self.interval.as_millis() as u64,
            "Batcher started"
        );
        Ok(())
    }

    /// Ask the thread to exit.
    pub fn signal_stop(&self) {
        self.worker.signal_stop();
    }

    /// Wait for the thread to exit.
    pub fn join(&self) -> AppResult<()> {
        self.worker.join()
    }

    /// Whether the thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}

fn mux_arguments(base: &Arguments, channels: &[Channel]) -> Arguments {
    let mut args = base.clone();
    let keys = channels
        .iter()
        .map(|(key, _)| toml::Value::String(key.clone()))
        .collect();
    args.insert(CHANNELS_ARGUMENT.to_string(), toml::Value::Array(keys));
    args
}

/// Split a reply into one value per channel. Nothing is assigned unless the
/// whole reply is valid.
fn demux(scheme: BatchingScheme, reading: Reading, channels: &[Channel]) -> AppResult<Vec<Value>> {
    match (scheme, reading) {
        (BatchingScheme::ChannelList, Reading::List(values)) => {
            if values.len() != channels.len() {
                return Err(TestbenchError::Demux(format!(
                    "expected {} values, got {}",
                    channels.len(),
                    values.len()
                )));
            }
            Ok(values)
        }
        (BatchingScheme::ChannelList, Reading::Scalar(value)) if channels.len() == 1 => {
            Ok(vec![value])
        }
        (BatchingScheme::Named, Reading::Named(mut map)) => channels
            .iter()
            .map(|(key, _)| {
                map.remove(key).ok_or_else(|| {
                    TestbenchError::Demux(format!("reply has no value for channel '{key}'"))
                })
            })
            .collect(),
        (scheme, reading) => Err(TestbenchError::Demux(format!(
            "{scheme:?} cannot split reply {reading:?}"
        ))),
    }
}

fn batch_cycle(getter: &Binding, scheme: BatchingScheme, channels: &[Channel]) -> AppResult<()> {
    if channels.is_empty() {
        return Ok(());
    }
    let args = mux_arguments(&getter.args, channels);
    let reading = getter.read_with(&args)?;
    let values = demux(scheme, reading, channels)?;
    for ((_, instrument), value) in channels.iter().zip(values) {
        instrument.set_value(value);
    }
    Ok(())
}
