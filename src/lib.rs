//! sitewatchdog -- bounded-time supervisor for synthetic website monitors.
//!
//! Each invocation runs the external monitor once under a wall-clock limit,
//! judges the run from its output, keeps evidence for failed runs, reports
//! the outcome to Slack and CloudWatch when asked, and expires old run
//! directories.

pub mod archive;
pub mod classify;
pub mod config;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod report;
pub mod runner;

use std::path::Path;

use tokio_util::sync::CancellationToken;

pub use config::WatchdogConfig;
pub use error::WatchdogError;
pub use orchestrator::{RunOptions, RunSummary, Watchdog};

/// Load configuration from `config_path` and perform one supervised run.
pub async fn run(
    config_path: &Path,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<RunSummary, WatchdogError> {
    // 1. Configuration
    let config = WatchdogConfig::load(config_path)?;

    // 2. Components
    let watchdog = Watchdog::new(config, options)?;

    // 3. Run
    let summary = watchdog.run(options, cancel).await?;
    tracing::info!(
        outcome = %summary.outcome,
        reported_duration = summary.reported_duration,
        pruned = summary.prune.removed.len(),
        "watchdog run complete"
    );
    Ok(summary)
}
