//! Errors that end a watchdog run.
//!
//! Only infrastructure problems live here.  A monitor that fails its checks
//! is a normal outcome, and report or notification problems are logged and
//! swallowed by the orchestrator.

use std::path::PathBuf;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::config::ConfigError;
use crate::runner::RunnerError;

/// Exit status for a run cut short by the operator (128 + SIGINT).
pub const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("unable to clear cookie file {}: {source}", path.display())]
    ClearCookies {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("watchdog stopped by keyboard interrupt")]
    Interrupted,
}

impl WatchdogError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            WatchdogError::Interrupted | WatchdogError::Runner(RunnerError::Interrupted { .. }) => {
                EXIT_INTERRUPTED
            }
            _ => 1,
        }
    }

    /// Monitor output to show beneath the error line, if any was captured.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            WatchdogError::Runner(e) => e.captured_output().filter(|o| !o.is_empty()),
            _ => None,
        }
    }

    /// `Error: <message>` followed by any captured output indented two
    /// spaces.
    pub fn render(&self) -> String {
        let mut text = format!("Error: {self}");
        if let Some(output) = self.captured_output() {
            text.push_str(":\n");
            let indented: Vec<String> = output.lines().map(|l| format!("  {l}")).collect();
            text.push_str(&indented.join("\n"));
        }
        text
    }
}
