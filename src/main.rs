//! CLI entry point for the testbench.
//!
//! # Usage
//!
//! Run an experiment and wait for it to finish:
//! ```bash
//! testbench run --apparatus config/apparatus/bench.toml config/experiments/leak_check.toml --operator alice
//! ```
//!
//! Check files without running anything:
//! ```bash
//! testbench validate --apparatus config/apparatus/bench.toml config/experiments/*.toml
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use testbench::config::apparatus::ApparatusConfig;
use testbench::config::experiment::ExperimentConfig;
use testbench::config::TestbenchConfig;
use testbench::experiment::{ExperimentRunner, ExperimentServices};
use testbench::instrument::{ConnectionManager, DriverRegistry, InstrumentContext};
use testbench::logging;
use testbench::notify::{DirectoryArchiver, LogNotifier};
use tracing::{error, info};

/// Wait used when no `--timeout-s` is given (30 days).
const UNBOUNDED_WAIT_S: u64 = 30 * 24 * 3600;

#[derive(Parser)]
#[command(name = "testbench")]
#[command(about = "Laboratory testbench orchestrator", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = testbench::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one experiment against an apparatus and wait for it to finish
    Run {
        /// Apparatus description
        #[arg(long)]
        apparatus: PathBuf,

        /// Experiment description
        experiment: PathBuf,

        /// Operator name attached to alerts
        #[arg(long)]
        operator: Option<String>,

        /// Give up waiting after this many seconds and abort the run
        #[arg(long)]
        timeout_s: Option<u64>,
    },

    /// Parse and build an apparatus and experiments without running them
    Validate {
        /// Apparatus description
        #[arg(long)]
        apparatus: PathBuf,

        /// Experiment descriptions
        experiments: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = TestbenchConfig::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    logging::init_from_config(&settings).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Run {
            apparatus,
            experiment,
            operator,
            timeout_s,
        } => run(&settings, &apparatus, &experiment, operator.as_deref(), timeout_s),
        Commands::Validate {
            apparatus,
            experiments,
        } => validate(&settings, &apparatus, &experiments),
    }
}

fn context(settings: &TestbenchConfig) -> InstrumentContext {
    InstrumentContext {
        rolling_samples: settings.recording.rolling_samples,
        stored_samples: settings.recording.stored_samples,
        ..InstrumentContext::default()
    }
}

fn services(settings: &TestbenchConfig) -> ExperimentServices {
    ExperimentServices {
        notifier: Arc::new(LogNotifier),
        archiver: Arc::new(DirectoryArchiver::new(
            &settings.storage.log_dir,
            &settings.storage.archive_dir,
        )),
        log_dir: settings.storage.log_dir.clone(),
    }
}

fn run(
    settings: &TestbenchConfig,
    apparatus_path: &Path,
    experiment_path: &Path,
    operator: Option<&str>,
    timeout_s: Option<u64>,
) -> Result<()> {
    let apparatus_config = ApparatusConfig::load_from(apparatus_path)?;
    let experiment_config = ExperimentConfig::load_from(experiment_path)?;

    let connections = ConnectionManager::new(DriverRegistry::with_builtin(), context(settings));
    let apparatus = connections.load_apparatus(&apparatus_config)?;
    let runner = ExperimentRunner::new(apparatus, services(settings));
    let experiment = runner.add_experiment(&experiment_config)?;

    let Some(run_id) = runner.run_experiment(experiment.uid(), operator)? else {
        bail!("another experiment is already running");
    };
    info!(run_id = %run_id, "Run started");

    let timeout = Duration::from_secs(timeout_s.unwrap_or(UNBOUNDED_WAIT_S));
    if !runner.wait_idle(timeout) {
        error!(run_id = %run_id, "Run did not finish in time, aborting");
        runner.abort_current();
        runner.wait_idle(Duration::from_secs(60));
    }
    experiment.join()?;
    connections.shutdown()?;

    let summary = experiment.last_summary();
    match summary {
        Some(summary) => {
            println!(
                "{}: {} ({}/{} segments complete)",
                summary.run_id,
                summary.state,
                summary.completed_segments(),
                summary.segments.len()
            );
            if let Some(reason) = summary.error {
                println!("  {reason}");
            }
            Ok(())
        }
        None => bail!("run {run_id} left no summary"),
    }
}

fn validate(settings: &TestbenchConfig, apparatus_path: &Path, experiments: &[PathBuf]) -> Result<()> {
    let apparatus_config = ApparatusConfig::load_from(apparatus_path)?;
    let drivers = DriverRegistry::with_builtin().build_all(&apparatus_config)?;
    let apparatus = testbench::instrument::Apparatus::build(&apparatus_config, &drivers, context(settings))?;
    println!(
        "{}: {} virtual instruments",
        apparatus_path.display(),
        apparatus.instruments().len()
    );

    let runner = ExperimentRunner::new(Arc::new(apparatus), services(settings));
    for path in experiments {
        let config = ExperimentConfig::load_from(path)?;
        let experiment = runner
            .add_experiment(&config)
            .with_context(|| format!("building {}", path.display()))?;
        println!(
            "{}: experiment '{}' with {} segments",
            path.display(),
            experiment.uid(),
            experiment.segments().len()
        );
    }
    Ok(())
}
