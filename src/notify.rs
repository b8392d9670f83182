//! Operator notifications and run archiving.
//!
//! The sequencer reports progress through a [`Notifier`] (chat bot, e-mail,
//! or just the log) and packages each run's log directory through an
//! [`Archiver`]. Both are collaborator seams: failures are returned as
//! `anyhow` errors and the caller logs them without interrupting the run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Alert severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AlertSeverity {
    /// Progress
    Info = 1,
    /// Needs attention eventually
    Caution = 2,
    /// Needs attention now
    Warning = 3,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "INFO"),
            AlertSeverity::Caution => write!(f, "CAUTION"),
            AlertSeverity::Warning => write!(f, "WARNING"),
        }
    }
}

/// Delivers alerts and files to operators.
pub trait Notifier: Send + Sync {
    /// Send a text alert, optionally addressed to one operator.
    fn send_alert(
        &self,
        message: &str,
        severity: AlertSeverity,
        target: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Send a file (usually a run archive).
    fn send_file(&self, path: &Path, severity: AlertSeverity) -> anyhow::Result<()>;
}

/// Notifier that writes alerts to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_alert(
        &self,
        message: &str,
        severity: AlertSeverity,
        target: Option<&str>,
    ) -> anyhow::Result<()> {
        let operator = target.unwrap_or("");
        match severity {
            AlertSeverity::Info => info!(%severity, operator, "{message}"),
            AlertSeverity::Caution | AlertSeverity::Warning => {
                warn!(%severity, operator, "{message}")
            }
        }
        Ok(())
    }

    fn send_file(&self, path: &Path, severity: AlertSeverity) -> anyhow::Result<()> {
        info!(%severity, path = %path.display(), "File available");
        Ok(())
    }
}

/// Packages a run's log directory.
pub trait Archiver: Send + Sync {
    /// Archive the logs of `run_id` under `output_name` and return the archive path.
    fn create_archive(&self, run_id: &str, output_name: &str) -> anyhow::Result<PathBuf>;
}

/// Archiver that copies `log_dir/<run_id>/` to `archive_dir/<output_name>/`.
#[derive(Debug, Clone)]
pub struct DirectoryArchiver {
    log_dir: PathBuf,
    archive_dir: PathBuf,
}

impl DirectoryArchiver {
    /// Archive from `log_dir` into `archive_dir`.
    pub fn new(log_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    /// Names of existing archives, sorted.
    pub fn archives(&self) -> anyhow::Result<Vec<String>> {
        if !self.archive_dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.archive_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl Archiver for DirectoryArchiver {
    fn create_archive(&self, run_id: &str, output_name: &str) -> anyhow::Result<PathBuf> {
        let source = self.log_dir.join(run_id);
        let target = self.archive_dir.join(output_name);
        fs::create_dir_all(&target)?;
        let copied = if source.is_dir() {
            copy_tree(&source, &target)?
        } else {
            warn!(run_id, source = %source.display(), "Run has no log directory, archive is empty");
            0
        };
        info!(run_id, files = copied, archive = %target.display(), "Archive created");
        Ok(target)
    }
}

fn copy_tree(source: &Path, target: &Path) -> anyhow::Result<usize> {
    let mut copied = 0;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&to)?;
            copied += copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn severity_ordering() {
        assert!(AlertSeverity::Info < AlertSeverity::Caution);
        assert!(AlertSeverity::Caution < AlertSeverity::Warning);
        assert_eq!(AlertSeverity::Warning as u8, 3);
    }

    #[test]
    fn archive_copies_nested_run_directory() {
        let dir = tempdir().unwrap();
        let logs = dir.path().join("logs");
        let run = logs.join("exp_1");
        fs::create_dir_all(run.join("extra")).unwrap();
        fs::write(run.join("a.csv"), "Time,Value,Segment UID\n").unwrap();
        fs::write(run.join("extra").join("b.json"), "{}").unwrap();

        let archiver = DirectoryArchiver::new(&logs, dir.path().join("archives"));
        let path = archiver.create_archive("exp_1", "exp_1").unwrap();
        assert!(path.join("a.csv").is_file());
        assert!(path.join("extra").join("b.json").is_file());
        assert_eq!(archiver.archives().unwrap(), vec!["exp_1".to_string()]);
    }

    #[test]
    fn missing_run_directory_gives_empty_archive() {
        let dir = tempdir().unwrap();
        let archiver = DirectoryArchiver::new(dir.path().join("logs"), dir.path().join("archives"));
        let path = archiver.create_archive("never_ran", "never_ran").unwrap();
        assert!(path.is_dir());
        assert_eq!(fs::read_dir(path).unwrap().count(), 0);
    }
}
