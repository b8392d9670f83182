//! Memory-bounded sample recorder with progressive downsampling.
//!
//! A `Recorder` holds the in-memory series shown on the dashboard. It runs in
//! one of two modes:
//!
//! - **Rolling**: a fixed-size ring buffer of the `stored_samples` most recent
//!   samples. Oldest samples are evicted, nothing is averaged.
//! - **Downsampling**: the first `stored_samples` samples are kept verbatim.
//!   After that new samples are averaged into an open slot until it holds
//!   `aggregation_level` raw samples, then the slot is sealed. When the number of
//!   slots exceeds `2 * stored_samples` the buffer is halved by averaging
//!   adjacent pairs and the aggregation level doubles.
//!
//! The downsampling mode keeps recent data at full resolution while older data
//! loses time resolution logarithmically, and memory stays below
//! `2 * stored_samples + 1` slots at all times.
//!
//! ```text
//! stored_samples = 4
//!
//! samples 1..4   [a b c d]                      level 1
//! samples 5..8   [a b c d e f g h]              level 1
//! sample  9      [ab cd ef gh | i]              level 2, i is the open slot
//! sample  10     [ab cd ef gh ij]               ij sealed
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One stored point. For downsampled slots both fields are averages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Seconds since the UNIX epoch
    pub time: f64,
    /// Sample value
    pub value: f64,
}

/// Recorder configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    /// Raw sample count after which a non-rolling recorder becomes inactive
    pub max_samples: Option<usize>,
    /// Wall time after which the recorder becomes inactive
    pub max_time: Option<Duration>,
    /// Ring buffer instead of downsampling
    pub rolling: bool,
    /// In-memory retention target (ring capacity when rolling)
    pub stored_samples: usize,
}

impl RecorderConfig {
    /// Fixed-capacity ring buffer, used for the live display recorder.
    pub fn rolling(capacity: usize) -> Self {
        Self {
            max_samples: None,
            max_time: None,
            rolling: true,
            stored_samples: capacity.max(1),
        }
    }

    /// Growth-with-compaction recorder keeping roughly `stored_samples` points.
    pub fn downsampling(stored_samples: usize) -> Self {
        Self {
            max_samples: None,
            max_time: None,
            rolling: false,
            stored_samples: stored_samples.max(1),
        }
    }

    /// Set the raw sample cap.
    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = Some(max_samples);
        self
    }

    /// Set the time cap.
    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }
}

/// What happened to the stored series when a sample was added.
///
/// Display observers use this to decide between appending one point and
/// redrawing the whole series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleUpdate {
    /// A new point was appended
    Appended(Sample),
    /// The last point was updated in place (running average)
    Updated(Sample),
    /// The series was rewritten (halving or ring eviction)
    Refreshed,
}

/// In-memory recorder. Not synchronized; owners guard it with their own lock.
#[derive(Debug)]
pub struct Recorder {
    config: RecorderConfig,
    slots: VecDeque<Sample>,
    /// Current aggregation level (raw samples per sealed slot)
    level: usize,
    /// Raw samples folded into the open slot, 0 when no slot is open
    open_count: usize,
    halvings: u32,
    raw_count: u64,
    started_at: Option<Instant>,
    recording: bool,
}

impl Recorder {
    /// Create a stopped recorder.
    pub fn new(config: RecorderConfig) -> Self {
        let capacity = if config.rolling {
            config.stored_samples
        } else {
            2 * config.stored_samples + 1
        };
        Self {
            config,
            slots: VecDeque::with_capacity(capacity),
            level: 1,
            open_count: 0,
            halvings: 0,
            raw_count: 0,
            started_at: None,
            recording: false,
        }
    }

    /// Recorder configuration.
    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Start (or resume) accepting samples. The time cap restarts.
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
        self.recording = true;
    }

    /// Stop accepting samples.
    pub fn stop(&mut self) {
        self.recording = false;
    }

    /// Whether `start` was called without a matching `stop`.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Whether more samples should be fed.
    ///
    /// A non-rolling recorder with `max_samples` goes inactive once that many raw
    /// samples have been added; otherwise `max_time` is checked against the last start.
    pub fn active(&self) -> bool {
        if let (Some(max_samples), false) = (self.config.max_samples, self.config.rolling) {
            if self.raw_count >= max_samples as u64 {
                return false;
            }
        } else if let (Some(max_time), Some(started_at)) = (self.config.max_time, self.started_at)
        {
            if started_at.elapsed() >= max_time {
                return false;
            }
        }
        true
    }

    /// Append a reading. `timestamp` defaults to wall-clock now.
    pub fn add_sample(&mut self, value: f64, timestamp: Option<f64>) -> SampleUpdate {
        let time = timestamp.unwrap_or_else(now_seconds);
        let sample = Sample { time, value };
        self.raw_count += 1;

        if self.config.rolling {
            self.slots.push_back(sample);
            if self.slots.len() > self.config.stored_samples {
                self.slots.pop_front();
                return SampleUpdate::Refreshed;
            }
            return SampleUpdate::Appended(sample);
        }

        if self.slots.len() < self.config.stored_samples {
            self.slots.push_back(sample);
            return SampleUpdate::Appended(sample);
        }

        let update = if self.open_count == 0 {
            self.slots.push_back(sample);
            self.open_count = 1;
            SampleUpdate::Appended(sample)
        } else {
            let n = self.open_count as f64;
            let merged = match self.slots.back_mut() {
                Some(last) => {
                    last.value = (last.value * n + value) / (n + 1.0);
                    last.time = (last.time * n + time) / (n + 1.0);
                    *last
                }
                None => sample,
            };
            self.open_count += 1;
            SampleUpdate::Updated(merged)
        };

        if self.open_count >= self.level {
            self.open_count = 0;
        }

        if self.slots.len() > 2 * self.config.stored_samples {
            self.halve(sample);
            return SampleUpdate::Refreshed;
        }

        update
    }

    /// Merge adjacent slot pairs; `trigger` becomes the new open slot.
    fn halve(&mut self, trigger: Sample) {
        // The newest slot holds only the trigger sample.
        self.slots.pop_back();

        let merged: VecDeque<Sample> = self
            .slots
            .make_contiguous()
            .chunks(2)
            .map(|pair| {
                let n = pair.len() as f64;
                Sample {
                    time: pair.iter().map(|s| s.time).sum::<f64>() / n,
                    value: pair.iter().map(|s| s.value).sum::<f64>() / n,
                }
            })
            .collect();

        self.slots = merged;
        self.level *= 2;
        self.halvings += 1;

        self.slots.push_back(trigger);
        self.open_count = 1;
        if self.open_count >= self.level {
            self.open_count = 0;
        }
    }

    /// Stored values, oldest first.
    pub fn samples(&self) -> Vec<f64> {
        self.slots.iter().map(|s| s.value).collect()
    }

    /// Stored timestamps, oldest first.
    pub fn times(&self) -> Vec<f64> {
        self.slots.iter().map(|s| s.time).collect()
    }

    /// Stored points, oldest first.
    pub fn points(&self) -> Vec<Sample> {
        self.slots.iter().copied().collect()
    }

    /// Number of stored slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Raw samples added since construction.
    pub fn raw_count(&self) -> u64 {
        self.raw_count
    }

    /// How many times the buffer has been halved.
    pub fn halvings(&self) -> u32 {
        self.halvings
    }

    /// Raw samples per sealed slot at the current resolution.
    pub fn aggregation_level(&self) -> usize {
        self.level
    }
}

/// Wall-clock time as seconds since the UNIX epoch.
pub fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}
