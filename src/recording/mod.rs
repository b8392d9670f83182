//! Sample recording.
//!
//! - [`Recorder`]: bounded in-memory series (rolling or downsampling)
//! - [`RecordingFile`]: append-only CSV mirror of a named recording
//! - [`RecordingObserver`]: display hook invoked on the sample-producing thread
//! - [`NamedRecording`]: a recorder plus its optional file, owned by an instrument

pub mod file;
pub mod recorder;

pub use file::{recording_path, RecordingFile};
pub use recorder::{now_seconds, Recorder, RecorderConfig, Sample, SampleUpdate};

use crate::value::Value;
use std::path::Path;

/// Display collaborator notified when a recorder changes.
///
/// Called synchronously from the polling or sequencing thread that produced the
/// sample, so implementations must return quickly.
pub trait RecordingObserver: Send + Sync {
    /// A point was appended to, or updated at the end of, a series.
    fn point(&self, instrument_uid: &str, record_id: Option<&str>, sample: Sample);

    /// The series changed shape and should be redrawn from `Recorder::points`.
    fn refresh(&self, instrument_uid: &str, record_id: Option<&str>);
}

/// Forward a recorder update to an observer.
pub fn notify_observer(
    observer: &dyn RecordingObserver,
    instrument_uid: &str,
    record_id: Option<&str>,
    update: SampleUpdate,
) {
    match update {
        SampleUpdate::Appended(sample) | SampleUpdate::Updated(sample) => {
            observer.point(instrument_uid, record_id, sample)
        }
        SampleUpdate::Refreshed => observer.refresh(instrument_uid, record_id),
    }
}

/// A user-visible recording attached to an instrument.
#[derive(Debug)]
pub struct NamedRecording {
    /// Display name
    pub name: String,
    /// In-memory series
    pub recorder: Recorder,
    /// On-disk mirror, present while the recording is running with a file
    pub file: Option<RecordingFile>,
}

impl NamedRecording {
    /// Create a running recording, optionally backed by a new file.
    pub fn begin(
        name: &str,
        config: RecorderConfig,
        file_path: Option<&Path>,
    ) -> crate::error::AppResult<Self> {
        let file = file_path.map(RecordingFile::create).transpose()?;
        let mut recorder = Recorder::new(config);
        recorder.start();
        Ok(Self {
            name: name.to_string(),
            recorder,
            file,
        })
    }

    /// Path of the backing file, if any.
    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_ref().map(RecordingFile::path)
    }

    /// Record one raw sample. Returns the in-memory update, if the value was numeric.
    ///
    /// File failures are logged and do not stop in-memory recording.
    pub fn record(
        &mut self,
        instrument_uid: &str,
        record_id: &str,
        value: &Value,
        time: f64,
        segment_uid: &str,
    ) -> Option<SampleUpdate> {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_row(time, value, segment_uid) {
                tracing::error!(
                    instrument = instrument_uid,
                    record = record_id,
                    error = %e,
                    "Failed to write recording row"
                );
            }
        }
        value
            .as_f64()
            .map(|v| self.recorder.add_sample(v, Some(time)))
    }

    /// Stop recording and close the file.
    pub fn stop(&mut self) {
        self.recorder.stop();
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.close() {
                tracing::warn!(error = %e, "Failed to close recording file");
            }
        }
    }

    /// Restart recording, re-opening the file for append.
    pub fn resume(&mut self) -> crate::error::AppResult<()> {
        if let Some(path) = self.file_path().map(Path::to_path_buf) {
            self.file = Some(RecordingFile::append(&path)?);
        }
        self.recorder.start();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct CountingObserver {
        points: Mutex<usize>,
        refreshes: Mutex<usize>,
    }

    impl RecordingObserver for CountingObserver {
        fn point(&self, _: &str, _: Option<&str>, _: Sample) {
            *self.points.lock() += 1;
        }
        fn refresh(&self, _: &str, _: Option<&str>) {
            *self.refreshes.lock() += 1;
        }
    }

    #[test]
    fn observer_sees_refresh_on_eviction() {
        let observer = CountingObserver::default();
        let mut rec = Recorder::new(RecorderConfig::rolling(2));
        for i in 0..3 {
            let update = rec.add_sample(i as f64, None);
            notify_observer(&observer, "gauge", None, update);
        }
        assert_eq!(*observer.points.lock(), 2);
        assert_eq!(*observer.refreshes.lock(), 1);
    }

    #[test]
    fn stopped_file_keeps_memory_recording() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.csv");
        let mut rec =
            NamedRecording::begin("Pressure", RecorderConfig::downsampling(10), Some(&path))
                .unwrap();
        rec.record("gauge", "r", &Value::Float(1.0), 1.0, "seg");
        if let Some(file) = rec.file.as_mut() {
            file.close().unwrap();
        }
        // File is closed: the write fails and is logged, the sample is still kept.
        let update = rec.record("gauge", "r", &Value::Float(2.0), 2.0, "seg");
        assert!(update.is_some());
        assert_eq!(rec.recorder.samples(), vec![1.0, 2.0]);
    }

    #[test]
    fn resume_appends_to_same_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.csv");
        let mut rec =
            NamedRecording::begin("P", RecorderConfig::downsampling(10), Some(&path)).unwrap();
        rec.record("g", "r", &Value::Int(1), 1.0, "a");
        rec.stop();
        assert!(!rec.recorder.is_recording());
        rec.resume().unwrap();
        rec.record("g", "r", &Value::Int(2), 2.0, "b");
        rec.stop();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
    }
}
