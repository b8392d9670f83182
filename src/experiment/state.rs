//! Experiment run state and the run summary file.
//!
//! Each run leaves a `run_summary.json` in its run directory, next to the
//! recording files, so the archive carries the outcome of every segment.

use super::segment::{Segment, SegmentState};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the summary inside a run directory.
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Lifecycle of an experiment.
///
/// ```text
/// Idle ──run──> Running ──> Complete
///                  │
///                  ├──abort──> Aborted
///                  └──error──> Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentState {
    /// Never run
    Idle,
    /// Run thread executing
    Running,
    /// Every segment completed
    Complete,
    /// Stopped by an abort request or an aborting timeout
    Aborted,
    /// Stopped by an error
    Error,
}

impl std::fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentState::Idle => write!(f, "Idle"),
            ExperimentState::Running => write!(f, "Running"),
            ExperimentState::Complete => write!(f, "Complete"),
            ExperimentState::Aborted => write!(f, "Aborted"),
            ExperimentState::Error => write!(f, "Error"),
        }
    }
}

impl ExperimentState {
    /// Whether a new run may start from this state.
    pub fn can_begin(&self) -> bool {
        !matches!(self, ExperimentState::Running)
    }

    /// Whether the run has ended.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ExperimentState::Complete | ExperimentState::Aborted | ExperimentState::Error
        )
    }
}

/// Outcome of one segment within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSummary {
    /// Segment uid
    pub uid: String,
    /// Display name
    pub name: String,
    /// Segment `type`
    pub kind: String,
    /// Final state
    pub state: String,
}

impl From<&Segment> for SegmentSummary {
    fn from(segment: &Segment) -> Self {
        Self {
            uid: segment.uid.clone(),
            name: segment.name.clone(),
            kind: segment.kind.type_name().to_string(),
            state: segment.state().to_string(),
        }
    }
}

/// Everything known about one run once it has ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier
    pub run_id: String,
    /// Experiment uid
    pub experiment_uid: String,
    /// Experiment display name
    pub experiment_name: String,
    /// Operator who started the run
    pub operator: Option<String>,
    /// Start time
    pub started: DateTime<Utc>,
    /// End time
    pub finished: DateTime<Utc>,
    /// Final experiment state
    pub state: ExperimentState,
    /// Abort reason or error message
    pub error: Option<String>,
    /// Per-segment outcome, in execution order
    pub segments: Vec<SegmentSummary>,
}

impl RunSummary {
    /// Number of segments that completed.
    pub fn completed_segments(&self) -> usize {
        let complete = SegmentState::Complete.to_string();
        self.segments.iter().filter(|s| s.state == complete).count()
    }

    /// Save to a JSON file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run summary")?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create run directory")?;
        }
        fs::write(&path, json)
            .with_context(|| format!("Failed to write run summary to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Load from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run summary from {:?}", path.as_ref()))?;
        serde_json::from_str(&json).context("Failed to deserialize run summary")
    }

    /// Path of the summary for `run_id` under `log_dir`.
    pub fn path_in(log_dir: &Path, run_id: &str) -> PathBuf {
        log_dir.join(run_id).join(RUN_SUMMARY_FILE)
    }
}
