//! Experiment sequencing.
//!
//! [`Experiment::run`] takes the shared [`ExperimentLock`], spawns one run
//! thread and returns immediately. The run thread executes the segments in
//! order, publishing progress to the apparatus status instruments, and always
//! finishes by releasing the lock, archiving the run directory and notifying
//! the operator.
//!
//! Abort is cooperative: [`Experiment::request_abort`] raises the run's abort
//! signal, which is checked at every segment boundary and wakes every
//! segment sleep.

use super::lock::{ExperimentLock, ExperimentLockGuard};
use super::segment::{RunContext, Segment, SegmentError};
use super::state::{ExperimentState, RunSummary, SegmentSummary};
use crate::config::experiment::ExperimentHeader;
use crate::error::{AppResult, TestbenchError};
use crate::instrument::worker::panic_message;
use crate::instrument::{ActiveSegment, StatusInstruments};
use crate::notify::{AlertSeverity, Archiver, Notifier};
use crate::signal::StopSignal;
use crate::value::Value;
use chrono::{Local, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Collaborators every experiment reports to.
#[derive(Clone)]
pub struct ExperimentServices {
    /// Operator alerts
    pub notifier: Arc<dyn Notifier>,
    /// Run directory packaging
    pub archiver: Arc<dyn Archiver>,
    /// Root of all run directories
    pub log_dir: PathBuf,
}

impl fmt::Debug for ExperimentServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentServices")
            .field("log_dir", &self.log_dir)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of an experiment, for dashboards and chat.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentStatus {
    /// Experiment uid
    pub uid: String,
    /// Display name
    pub name: String,
    /// Lifecycle state
    pub state: ExperimentState,
    /// -1 before the first segment, the segment count once finished
    pub current_segment_id: i64,
    /// Number of top-level segments
    pub segment_count: usize,
    /// Latest run
    pub run_id: Option<String>,
    /// Operator of the current run
    pub operator: Option<String>,
}

#[derive(Debug, Clone)]
struct CurrentRun {
    run_id: String,
    operator: Option<String>,
}

/// An ordered list of segments sharing one run lock with its siblings.
pub struct Experiment {
    header: ExperimentHeader,
    segments: Vec<Segment>,
    lock: ExperimentLock,
    status: StatusInstruments,
    active_segment: ActiveSegment,
    services: ExperimentServices,
    abort: Arc<StopSignal>,
    idle: StopSignal,
    current_segment_id: AtomicI64,
    state: Mutex<ExperimentState>,
    current: Mutex<Option<CurrentRun>>,
    last_run_id: Mutex<Option<String>>,
    last_summary: Mutex<Option<RunSummary>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("uid", &self.header.uid)
            .field("segments", &self.segments.len())
            .field("state", &self.state())
            .field("current_segment_id", &self.current_segment_id())
            .finish()
    }
}

impl Experiment {
    /// Assemble an experiment. Use [`super::factory::build_experiment`] to
    /// build one from configuration.
    pub fn new(
        header: ExperimentHeader,
        segments: Vec<Segment>,
        lock: ExperimentLock,
        status: StatusInstruments,
        active_segment: ActiveSegment,
        services: ExperimentServices,
    ) -> Self {
        let idle = StopSignal::new();
        idle.set();
        Self {
            header,
            segments,
            lock,
            status,
            active_segment,
            services,
            abort: Arc::new(StopSignal::new()),
            idle,
            current_segment_id: AtomicI64::new(-1),
            state: Mutex::new(ExperimentState::Idle),
            current: Mutex::new(None),
            last_run_id: Mutex::new(None),
            last_summary: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Experiment uid.
    pub fn uid(&self) -> &str {
        &self.header.uid
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.header.name
    }

    /// Free-text description.
    pub fn description(&self) -> &str {
        &self.header.description
    }

    /// Segments in execution order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Index of the running segment; -1 before the first, `len` once finished.
    pub fn current_segment_id(&self) -> i64 {
        self.current_segment_id.load(Ordering::SeqCst)
    }

    /// Lifecycle state.
    pub fn state(&self) -> ExperimentState {
        *self.state.lock()
    }

    /// Operator of the run in progress.
    pub fn operator(&self) -> Option<String> {
        self.current.lock().as_ref().and_then(|run| run.operator.clone())
    }

    /// Summary of the last finished run.
    pub fn last_summary(&self) -> Option<RunSummary> {
        self.last_summary.lock().clone()
    }

    /// Whether this experiment's run thread is executing.
    pub fn is_running(&self) -> bool {
        !self.idle.is_set()
    }

    /// Snapshot for display.
    pub fn status(&self) -> ExperimentStatus {
        ExperimentStatus {
            uid: self.header.uid.clone(),
            name: self.header.name.clone(),
            state: self.state(),
            current_segment_id: self.current_segment_id(),
            segment_count: self.segments.len(),
            run_id: self.last_run_id.lock().clone(),
            operator: self.operator(),
        }
    }

    /// Start a run on a new thread and return its run id.
    ///
    /// Returns `None` without touching any state if another experiment holds
    /// the lock.
    pub fn run(self: &Arc<Self>, operator: Option<&str>) -> Option<String> {
        let Some(guard) = self.lock.try_acquire() else {
            warn!(experiment = %self.header.uid, "An experiment is already running");
            return None;
        };

        let run_id = format!(
            "{}_{}",
            self.header.uid,
            Local::now().format("%Y%m%d_%H%M%S_%3f")
        );
        self.abort.clear();
        self.idle.clear();
        *self.state.lock() = ExperimentState::Running;
        *self.last_run_id.lock() = Some(run_id.clone());
        *self.current.lock() = Some(CurrentRun {
            run_id: run_id.clone(),
            operator: operator.map(str::to_string),
        });

        let this = Arc::clone(self);
        let thread_run_id = run_id.clone();
        let operator = operator.map(str::to_string);
        let spawned = thread::Builder::new()
            .name(format!("experiment-{}", self.header.uid))
            .spawn(move || this.execute(guard, thread_run_id, operator));
        match spawned {
            Ok(handle) => {
                let mut threads = self.threads.lock();
                threads.retain(|t| !t.is_finished());
                threads.push(handle);
                Some(run_id)
            }
            Err(e) => {
                error!(experiment = %self.header.uid, error = %e, "Failed to spawn run thread");
                *self.state.lock() = ExperimentState::Error;
                *self.current.lock() = None;
                self.idle.set();
                None
            }
        }
    }

    /// Ask the run in progress to stop at the next boundary or sleep.
    pub fn request_abort(&self) {
        if self.is_running() {
            info!(experiment = %self.header.uid, "Abort requested");
            self.abort.set();
        }
    }

    /// Wait for the run thread to finish. Returns `true` if it has.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.idle.wait_timeout(timeout)
    }

    /// Join every finished or running run thread.
    pub fn join(&self) -> AppResult<()> {
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            handle.join().map_err(|payload| {
                TestbenchError::Worker(format!(
                    "experiment '{}' run thread panicked: {}",
                    self.header.uid,
                    panic_message(payload.as_ref())
                ))
            })?;
        }
        Ok(())
    }

    /// `operator` is owned by this run. Once the guard is dropped another run
    /// may replace `current`, so nothing after that point reads it.
    fn execute(&self, guard: ExperimentLockGuard, run_id: String, operator: Option<String>) {
        let started = Instant::now();
        let started_at = Utc::now();
        let ctx = RunContext {
            run_id: run_id.clone(),
            log_dir: self.services.log_dir.clone(),
            abort: Arc::clone(&self.abort),
        };

        let operator = operator.as_deref();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.sequence(&ctx, operator)))
            .unwrap_or_else(|payload| {
                Err(SegmentError::Failed(TestbenchError::Experiment(format!(
                    "run thread panicked: {}",
                    panic_message(payload.as_ref())
                ))))
            });

        let (state, error) = match &outcome {
            Ok(()) => (ExperimentState::Complete, None),
            Err(e) if e.is_abort() => {
                warn!(experiment = %self.header.uid, run_id = %run_id, reason = %e, "Experiment aborted");
                self.notify(
                    &format!(
                        "Experiment '{}' aborted after {}: {}",
                        self.header.name,
                        format_elapsed(started.elapsed()),
                        e
                    ),
                    AlertSeverity::Warning,
                    operator,
                );
                (ExperimentState::Aborted, Some(e.to_string()))
            }
            Err(e) => {
                error!(experiment = %self.header.uid, run_id = %run_id, error = %e, "Experiment failed");
                self.notify(
                    &format!(
                        "Experiment '{}' failed after {}: {}",
                        self.header.name,
                        format_elapsed(started.elapsed()),
                        e
                    ),
                    AlertSeverity::Warning,
                    operator,
                );
                (ExperimentState::Error, Some(e.to_string()))
            }
        };

        *self.state.lock() = state;
        self.active_segment.clear();
        drop(guard);

        let elapsed = started.elapsed();
        let summary = RunSummary {
            run_id: run_id.clone(),
            experiment_uid: self.header.uid.clone(),
            experiment_name: self.header.name.clone(),
            operator: operator.map(str::to_string),
            started: started_at,
            finished: Utc::now(),
            state,
            error,
            segments: self.segments.iter().map(SegmentSummary::from).collect(),
        };
        let summary_path = RunSummary::path_in(&self.services.log_dir, &run_id);
        if let Err(e) = summary.save(&summary_path) {
            warn!(run_id = %run_id, error = %e, "Failed to write run summary");
        }
        *self.last_summary.lock() = Some(summary);

        let archive = self.archive(&run_id);
        self.notify(
            &format!(
                "Experiment '{}' completed ({}) in {}, run {}",
                self.header.name,
                state,
                format_elapsed(elapsed),
                run_id
            ),
            AlertSeverity::Info,
            operator,
        );
        if let Some(path) = archive {
            if let Err(e) = self.services.notifier.send_file(&path, AlertSeverity::Info) {
                warn!(run_id = %run_id, error = %e, "Failed to send archive");
            }
        }

        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|run| run.run_id == run_id) {
            *current = None;
            self.idle.set();
        }
        info!(experiment = %self.header.uid, run_id = %run_id, %state, "Run finished");
    }

    fn sequence(&self, ctx: &RunContext, operator: Option<&str>) -> Result<(), SegmentError> {
        for segment in &self.segments {
            segment.reset_state();
        }
        self.current_segment_id.store(-1, Ordering::SeqCst);
        self.notify(
            &format!(
                "Starting experiment '{}' ({} segments), run {}",
                self.header.name,
                self.segments.len(),
                ctx.run_id
            ),
            AlertSeverity::Info,
            operator,
        );

        let total = self.segments.len();
        for segment in &self.segments {
            let index = self.current_segment_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.status
                .publish(index, segment.uid.as_str(), segment.name.as_str());
            self.active_segment.set(&segment.uid);
            ctx.check_abort(&segment.uid)?;

            self.notify(
                &format!(
                    "Segment {}/{}: {} ({})",
                    index + 1,
                    total,
                    segment.name,
                    segment.kind.type_name()
                ),
                AlertSeverity::Info,
                operator,
            );
            segment.prerun(ctx)?;
            let result = segment.run(ctx);
            let stopped = segment.postrun(ctx);
            result?;
            stopped?;
        }

        let finished = total as i64;
        self.current_segment_id.store(finished, Ordering::SeqCst);
        self.status.publish(finished, Value::None, Value::None);
        Ok(())
    }

    fn archive(&self, run_id: &str) -> Option<PathBuf> {
        match self.services.archiver.create_archive(run_id, run_id) {
            Ok(path) => Some(path),
            Err(e) => {
                error!(run_id, error = %e, "Failed to archive run");
                None
            }
        }
    }

    fn notify(&self, message: &str, severity: AlertSeverity, operator: Option<&str>) {
        if let Err(e) = self.services.notifier.send_alert(message, severity, operator)
        {
            warn!(experiment = %self.header.uid, error = %e, "Failed to send alert");
        }
    }

    /// Directory holding the recordings of `run_id`.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.services.log_dir.join(run_id)
    }

    /// Root log directory.
    pub fn log_dir(&self) -> &Path {
        &self.services.log_dir
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}
