//! Run directory lifecycle: one timestamped directory per run under the log
//! root, and a shallow age-based sweep of old ones.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("log directory does not exist: {}", path.display())]
    LogRootMissing { path: PathBuf },

    #[error("unable to create target directory: {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to scan log directory {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The instant a run started, in both renderings the reports need.
///
/// Captured once per run so the directory label and the index page always
/// agree on the time.
#[derive(Debug, Clone, Copy)]
pub struct RunDates {
    pub local: DateTime<Tz>,
    pub global: DateTime<Tz>,
}

impl RunDates {
    pub fn now(local_zone: Tz, global_zone: Tz) -> Self {
        Self::at(Utc::now(), local_zone, global_zone)
    }

    pub fn at(instant: DateTime<Utc>, local_zone: Tz, global_zone: Tz) -> Self {
        Self {
            local: instant.with_timezone(&local_zone),
            global: instant.with_timezone(&global_zone),
        }
    }

    /// Directory name for this run, rendered in the global zone.
    pub fn label(&self, format: &str) -> String {
        run_label(&self.global, format)
    }

    pub fn local_display(&self, format: &str) -> String {
        self.local.format(format).to_string()
    }

    pub fn global_display(&self, format: &str) -> String {
        self.global.format(format).to_string()
    }
}

/// Render a run directory label, e.g. `2026_10_16-14_03_27_UTC`.
pub fn run_label(at: &DateTime<Tz>, format: &str) -> String {
    at.format(format).to_string()
}

/// Create `log_root/label` with write permission for the owner and group.
///
/// The log root itself must already exist.  An existing directory with the
/// same label is an error: a run never shares its directory.
pub fn create_run_directory(log_root: &Path, label: &str) -> Result<PathBuf, ArchiveError> {
    if !log_root.is_dir() {
        return Err(ArchiveError::LogRootMissing {
            path: log_root.to_path_buf(),
        });
    }

    let target = log_root.join(label);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ArchiveError::Create {
            path: target.clone(),
            source,
        })?;
    }

    let mut builder = std::fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o775);
    }
    builder.create(&target).map_err(|source| ArchiveError::Create {
        path: target.clone(),
        source,
    })?;

    info!(run_dir = %target.display(), "created run directory");
    Ok(target)
}

/// What a pruning pass removed.
#[derive(Debug, Default, Serialize)]
pub struct PruneReport {
    /// The current run's directory was empty and has been removed.
    pub removed_empty_run_dir: bool,
    /// Expired sibling directories that were deleted.
    pub removed: Vec<PathBuf>,
    /// Expired directories that could not be deleted, with the reason.
    pub failed: Vec<(PathBuf, String)>,
}

/// Remove `run_dir` if empty, then delete expired siblings.
///
/// See [`prune_old_directories_at`].
pub fn prune_old_directories(
    run_dir: &Path,
    retention_days: u32,
) -> Result<PruneReport, ArchiveError> {
    prune_old_directories_at(run_dir, retention_days, SystemTime::now())
}

/// Remove `run_dir` if it has no entries, then delete every directory
/// directly under its parent whose modification time is more than
/// `retention_days` before `now`.
///
/// Only the top level of the log root is scanned.  A directory exactly
/// `retention_days` old is kept.  A failure to delete one directory is
/// recorded in the report and the sweep continues.
pub fn prune_old_directories_at(
    run_dir: &Path,
    retention_days: u32,
    now: SystemTime,
) -> Result<PruneReport, ArchiveError> {
    let mut report = PruneReport::default();

    report.removed_empty_run_dir = remove_if_empty(run_dir);

    let Some(log_root) = run_dir.parent() else {
        return Ok(report);
    };
    let retention = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);

    let entries = std::fs::read_dir(log_root).map_err(|source| ArchiveError::Scan {
        path: log_root.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable log directory entry");
                continue;
            }
        };
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(m) if m.is_dir() => m,
            Ok(_) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot stat log directory entry");
                continue;
            }
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        // Modification times in the future count as fresh.
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age <= retention {
            continue;
        }

        debug!(path = %path.display(), age_sec = age.as_secs(), "removing expired run directory");
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(path = %path.display(), "removed expired run directory");
                report.removed.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove expired run directory");
                report.failed.push((path, e.to_string()));
            }
        }
    }

    Ok(report)
}

/// Remove `run_dir` if it has no entries.  Returns whether it was removed.
pub fn remove_if_empty(run_dir: &Path) -> bool {
    if !is_empty_dir(run_dir) {
        return false;
    }
    let name = run_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    println!("Log directory is empty, removing: {}", name);
    match std::fs::remove_dir(run_dir) {
        Ok(()) => true,
        Err(e) => {
            warn!(run_dir = %run_dir.display(), error = %e, "failed to remove empty run directory");
            false
        }
    }
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
