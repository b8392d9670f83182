//! Append-only CSV mirror of a named recording.
//!
//! One row per raw sample with the columns `Time, Value, Segment UID`. Rows are
//! flushed as they are written so the on-disk log is complete up to the last
//! sample even if the process dies.

use crate::error::AppResult;
use crate::value::Value;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Column header written to every new recording file.
pub const HEADER: [&str; 3] = ["Time", "Value", "Segment UID"];

/// An open recording file.
pub struct RecordingFile {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl std::fmt::Debug for RecordingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingFile")
            .field("path", &self.path)
            .field("open", &self.writer.is_some())
            .finish()
    }
}

impl RecordingFile {
    /// Create (or truncate) the file and write the header.
    pub fn create(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(HEADER)?;
        writer.flush()?;
        tracing::debug!(path = %path.display(), "Created recording file");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
        })
    }

    /// Re-open an existing file for appending. Falls back to `create` if it is missing.
    pub fn append(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            return Self::create(path);
        }
        let file = OpenOptions::new().append(true).open(path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        tracing::debug!(path = %path.display(), "Re-opened recording file");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
        })
    }

    /// File location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file is still open.
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Write and flush one row.
    pub fn write_row(&mut self, time: f64, value: &Value, segment_uid: &str) -> AppResult<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            crate::error::TestbenchError::Recording(format!(
                "recording file {} is closed",
                self.path.display()
            ))
        })?;
        writer.write_record([format_time(time), value.to_string(), segment_uid.to_string()])?;
        writer.flush()?;
        Ok(())
    }

    /// Flush and close. Further writes fail.
    pub fn close(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for RecordingFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to close recording file");
        }
    }
}

fn format_time(time: f64) -> String {
    let micros = (time * 1e6).round() as i64;
    DateTime::<Utc>::from_timestamp_micros(micros)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true))
        .unwrap_or_else(|| format!("{time:.6}"))
}

/// File name for a recording: `<instrument>_<record>_<timestamp>.csv` inside the run directory.
pub fn recording_path(log_dir: &Path, run_id: &str, instrument_uid: &str, record_id: &str) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    log_dir
        .join(run_id)
        .join(format!("{instrument_uid}_{record_id}_{stamp}.csv"))
}
