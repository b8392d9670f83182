//! Registry of experiments for one apparatus.
//!
//! [`ExperimentRunner`] owns the shared [`ExperimentLock`], builds experiments
//! from configuration and answers "who is running". The identity of the run
//! in progress is cleared by a watcher thread only once the lock is free
//! again, so it never disagrees with [`ExperimentRunner::is_running`].

use super::factory::build_experiment;
use super::lock::ExperimentLock;
use super::sequencer::{Experiment, ExperimentServices, ExperimentStatus};
use crate::config::experiment::ExperimentConfig;
use crate::error::{AppResult, TestbenchError};
use crate::instrument::Apparatus;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// The run in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveRun {
    /// Experiment uid
    pub experiment_uid: String,
    /// Operator who started it
    pub operator: Option<String>,
    /// Run identifier
    pub run_id: String,
}

/// Experiments available on one apparatus.
pub struct ExperimentRunner {
    apparatus: Arc<Apparatus>,
    services: ExperimentServices,
    lock: ExperimentLock,
    experiments: RwLock<BTreeMap<String, Arc<Experiment>>>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ExperimentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentRunner")
            .field("apparatus", &self.apparatus.name())
            .field("experiments", &self.experiment_uids())
            .field("active", &self.active_run())
            .finish()
    }
}

impl ExperimentRunner {
    /// Runner with no experiments.
    pub fn new(apparatus: Arc<Apparatus>, services: ExperimentServices) -> Self {
        Self {
            apparatus,
            services,
            lock: ExperimentLock::new(),
            experiments: RwLock::new(BTreeMap::new()),
            active: Arc::new(Mutex::new(None)),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Shared run lock.
    pub fn lock(&self) -> &ExperimentLock {
        &self.lock
    }

    /// Build and register an experiment, replacing one with the same uid.
    pub fn add_experiment(&self, config: &ExperimentConfig) -> AppResult<Arc<Experiment>> {
        let experiment = Arc::new(self.build(config)?);
        let uid = experiment.uid().to_string();
        if let Some(old) = self
            .experiments
            .write()
            .insert(uid.clone(), Arc::clone(&experiment))
        {
            if old.is_running() {
                warn!(experiment = %uid, "Replaced an experiment while it was running");
            }
        }
        info!(experiment = %uid, segments = experiment.segments().len(), "Experiment registered");
        Ok(experiment)
    }

    /// Unregister an experiment.
    pub fn remove_experiment(&self, uid: &str) -> Option<Arc<Experiment>> {
        self.experiments.write().remove(uid)
    }

    /// Registered experiment uids, sorted.
    pub fn experiment_uids(&self) -> Vec<String> {
        self.experiments.read().keys().cloned().collect()
    }

    /// Look up an experiment.
    pub fn experiment(&self, uid: &str) -> AppResult<Arc<Experiment>> {
        self.experiments
            .read()
            .get(uid)
            .cloned()
            .ok_or_else(|| TestbenchError::Experiment(format!("unknown experiment '{uid}'")))
    }

    /// Status of every experiment.
    pub fn statuses(&self) -> Vec<ExperimentStatus> {
        self.experiments.read().values().map(|e| e.status()).collect()
    }

    /// Start `uid`. Returns the run id, or `None` if another run holds the lock.
    pub fn run_experiment(&self, uid: &str, operator: Option<&str>) -> AppResult<Option<String>> {
        let experiment = self.experiment(uid)?;
        let Some(run_id) = experiment.run(operator) else {
            return Ok(None);
        };
        *self.active.lock() = Some(ActiveRun {
            experiment_uid: uid.to_string(),
            operator: operator.map(str::to_string),
            run_id: run_id.clone(),
        });
        self.spawn_watcher(run_id.clone())?;
        Ok(Some(run_id))
    }

    fn spawn_watcher(&self, run_id: String) -> AppResult<()> {
        let lock = self.lock.clone();
        let active = Arc::clone(&self.active);
        let handle = thread::Builder::new()
            .name("experiment-watcher".into())
            .spawn(move || {
                while !lock.wait_unlocked(WATCH_INTERVAL) {}
                let mut active = active.lock();
                if active.as_ref().is_some_and(|run| run.run_id == run_id) {
                    debug!(run_id = %run_id, "Clearing active run");
                    *active = None;
                }
            })
            .map_err(|e| TestbenchError::Worker(format!("failed to spawn run watcher: {e}")))?;
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| !w.is_finished());
        watchers.push(handle);
        Ok(())
    }

    /// The run in progress.
    pub fn active_run(&self) -> Option<ActiveRun> {
        self.active.lock().clone()
    }

    /// Whether any experiment holds the lock.
    pub fn is_running(&self) -> bool {
        self.lock.is_locked()
    }

    /// Abort the run in progress. Returns `false` if nothing is running.
    pub fn abort_current(&self) -> bool {
        let Some(run) = self.active_run() else {
            return false;
        };
        match self.experiments.read().get(&run.experiment_uid) {
            Some(experiment) => {
                experiment.request_abort();
                true
            }
            None => false,
        }
    }

    /// Replace every experiment. Refused while a run is in progress.
    pub fn reload(&self, configs: &[ExperimentConfig]) -> AppResult<()> {
        if self.is_running() {
            return Err(TestbenchError::Experiment(
                "cannot reload experiments while one is running".into(),
            ));
        }
        let mut built = BTreeMap::new();
        for config in configs {
            let experiment = Arc::new(self.build(config)?);
            built.insert(experiment.uid().to_string(), experiment);
        }
        info!(experiments = built.len(), "Experiments reloaded");
        *self.experiments.write() = built;
        Ok(())
    }

    /// Wait until no run is in progress and the watchers have finished.
    /// Returns `true` if idle before `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if !self.lock.wait_unlocked(timeout) {
            return false;
        }
        let experiments: Vec<_> = self.experiments.read().values().cloned().collect();
        for experiment in experiments {
            let left = deadline.saturating_duration_since(Instant::now());
            if !experiment.wait(left) {
                return false;
            }
        }
        let watchers: Vec<_> = self.watchers.lock().drain(..).collect();
        for watcher in watchers {
            if watcher.join().is_err() {
                warn!("Run watcher panicked");
            }
        }
        true
    }

    fn build(&self, config: &ExperimentConfig) -> AppResult<Experiment> {
        build_experiment(config, &self.apparatus, self.lock.clone(), self.services.clone())
    }
}
