//! Success/failure decision for a finished run.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::WatchdogConfig;
use crate::runner::RunOutput;

/// Verdict for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    /// The monitor hit its deadline.  Handled as a failure everywhere.
    TimedOut,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure => write!(f, "failure"),
            Outcome::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Pattern match plus the numbers reported for each verdict.
#[derive(Debug, Clone)]
pub struct Classifier {
    success_pattern: Regex,
    failure_value: f64,
}

impl Classifier {
    pub fn new(success_pattern: Regex, failure_value: f64) -> Self {
        Self {
            success_pattern,
            failure_value,
        }
    }

    /// Build from a validated config.  The pattern was already compiled once
    /// during validation, so this only fails if the config was mutated since.
    pub fn from_config(config: &WatchdogConfig) -> Result<Self, crate::config::ConfigError> {
        Ok(Self::new(
            config.application.success_pattern()?,
            config.cloudwatch.failure_time,
        ))
    }

    /// Does `output` contain the success pattern anywhere?
    pub fn matches(&self, output: &str) -> bool {
        self.success_pattern.is_match(output)
    }

    /// A timed-out run is never a success, whatever it printed before it was
    /// stopped.  Otherwise the success pattern decides; the exit code does not.
    pub fn classify(&self, run: &RunOutput) -> Outcome {
        if run.timed_out() {
            return Outcome::TimedOut;
        }
        if self.matches(&run.text()) {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }

    /// Value sent to the metrics backend: elapsed seconds rounded to one
    /// decimal on success, the configured failure value otherwise.
    pub fn reported_duration(&self, outcome: Outcome, elapsed: Duration) -> f64 {
        if outcome.is_success() {
            round_tenths(elapsed.as_secs_f64())
        } else {
            self.failure_value
        }
    }
}

/// Round to one decimal place, as shown in status lines.
pub fn round_tenths(secs: f64) -> f64 {
    (secs * 10.0).round() / 10.0
}

/// Delete files in `dir` whose extension is one of `extensions`
/// (case-insensitive).  Returns how many were removed.  Individual delete
/// failures are logged and skipped.
pub fn remove_transient_images(dir: &Path, extensions: &[String]) -> std::io::Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        let is_transient = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false);
        if !is_transient {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed transient image");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove transient image"),
        }
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
