//! One watchdog run, start to finish.
//!
//! `Init → DirectoryCreated → Running → Classified → (ReportBuilt) →
//! Notified → Pruned → Done`.  Configuration, directory and launch problems
//! abort the run with an error.  Everything after the monitor has run is
//! best effort: a report, chat or metrics failure is logged and the run
//! still completes.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::{self, PruneReport, RunDates};
use crate::classify::{self, round_tenths, Classifier, Outcome};
use crate::config::WatchdogConfig;
use crate::error::WatchdogError;
use crate::notify::{ChatNotifier, CloudWatchClient, MetricDatum, MetricsSink, SlackNotifier};
use crate::report;
use crate::runner::{BoundedRunner, FailureMode, MonitorCommand};

pub const SUCCESS_MESSAGE: &str = "Website watchdog completed successfully";

/// Operator-selected behaviour for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Post the reported duration to the metrics backend.
    pub cloudwatch: bool,
    /// Chat on success and on failure.
    pub slack: bool,
    /// Chat on failure only.
    pub slack_failure: bool,
    /// Delete the cookie jar before launching the monitor.
    pub clear_cookies: bool,
}

impl RunOptions {
    fn wants_chat(&self) -> bool {
        self.slack || self.slack_failure
    }
}

/// Steps of a run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    DirectoryCreated,
    Running,
    Classified,
    ReportBuilt,
    Notified,
    Pruned,
    Done,
}

/// What a completed run did.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_dir: PathBuf,
    pub outcome: Outcome,
    #[serde(rename = "elapsed_secs", serialize_with = "secs_f64")]
    pub elapsed: Duration,
    pub reported_duration: f64,
    pub report_url: Option<String>,
    pub chat_message: Option<String>,
    pub metric_posted: bool,
    pub prune: PruneReport,
    pub phases: Vec<RunPhase>,
}

/// Composes the runner, classifier, report builder, notifiers and pruning.
pub struct Watchdog {
    config: WatchdogConfig,
    runner: BoundedRunner,
    classifier: Classifier,
    chat: Option<Box<dyn ChatNotifier>>,
    metrics: Option<Box<dyn MetricsSink>>,
}

impl Watchdog {
    /// Build a watchdog with the Slack and CloudWatch clients `options`
    /// call for.  A client that cannot be built is logged and left out.
    pub fn new(config: WatchdogConfig, options: &RunOptions) -> Result<Self, WatchdogError> {
        let chat: Option<Box<dyn ChatNotifier>> = if options.wants_chat() {
            match SlackNotifier::new(config.slack.clone()) {
                Ok(n) => Some(Box::new(n)),
                Err(e) => {
                    warn!(error = %e, "Slack notifications disabled");
                    None
                }
            }
        } else {
            None
        };
        let metrics: Option<Box<dyn MetricsSink>> = if options.cloudwatch {
            match CloudWatchClient::new(&config.cloudwatch) {
                Ok(c) => Some(Box::new(c)),
                Err(e) => {
                    warn!(error = %e, "CloudWatch reporting disabled");
                    None
                }
            }
        } else {
            None
        };
        Self::with_notifiers(config, chat, metrics)
    }

    /// Build a watchdog with caller-supplied notifiers.
    pub fn with_notifiers(
        config: WatchdogConfig,
        chat: Option<Box<dyn ChatNotifier>>,
        metrics: Option<Box<dyn MetricsSink>>,
    ) -> Result<Self, WatchdogError> {
        let runner = BoundedRunner::from_config(&config.process)
            .with_echo(true)
            .with_failure_mode(FailureMode::Tolerate);
        let classifier = Classifier::from_config(&config)?;
        Ok(Self {
            config,
            runner,
            classifier,
            chat,
            metrics,
        })
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Execute one run.
    ///
    /// An operator interrupt at any point returns [`WatchdogError::Interrupted`]
    /// (or the runner's interrupt error while the monitor is running).  A run
    /// that ends in an error removes its run directory if nothing was written
    /// to it.
    pub async fn run(
        &self,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, WatchdogError> {
        let mut phases = Vec::with_capacity(8);

        // Init
        enter(&mut phases, RunPhase::Init);
        if options.clear_cookies {
            self.clear_cookies()?;
        }
        let time = &self.config.time;
        let dates = RunDates::now(time.zone_local, time.zone_global);

        // DirectoryCreated
        let label = dates.label(&time.label_format);
        let run_dir = archive::create_run_directory(&self.config.system.log_dir, &label)?;
        enter(&mut phases, RunPhase::DirectoryCreated);

        let result = self
            .supervise(run_dir.clone(), &dates, phases, options, cancel)
            .await;
        if result.is_err() {
            archive::remove_if_empty(&run_dir);
        }
        result
    }

    /// Everything after the run directory exists.
    async fn supervise(
        &self,
        run_dir: PathBuf,
        dates: &RunDates,
        mut phases: Vec<RunPhase>,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, WatchdogError> {
        check_cancelled(cancel)?;

        // Running
        enter(&mut phases, RunPhase::Running);
        let command = MonitorCommand::new(&self.config.process.monitor).arg(&run_dir);
        let start = Instant::now();
        let run = self.runner.run(&command, cancel).await?;
        let elapsed = start.elapsed();
        let shown_secs = round_tenths(elapsed.as_secs_f64());

        // Classified
        let outcome = self.classifier.classify(&run);
        let reported_duration = self.classifier.reported_duration(outcome, elapsed);
        enter(&mut phases, RunPhase::Classified);
        info!(run_dir = %run_dir.display(), %outcome, elapsed_sec = shown_secs, "run classified");

        let mut report_url = None;
        if outcome.is_success() {
            match classify::remove_transient_images(
                &run_dir,
                &self.config.application.transient_image_extensions,
            ) {
                Ok(n) => debug!(removed = n, "transient images cleaned up"),
                Err(e) => warn!(run_dir = %run_dir.display(), error = %e, "image cleanup failed"),
            }
            println!("{SUCCESS_MESSAGE}, taking {shown_secs:.1} seconds");
        } else {
            let message = failure_message(outcome, shown_secs);
            println!("{message}");

            // ReportBuilt
            match report::build_failure_report(
                &run_dir,
                &message,
                &run.text(),
                dates,
                &self.config.time.display_format,
                &self.config.system.report_url,
            ) {
                Ok(url) => {
                    report_url = Some(url);
                    enter(&mut phases, RunPhase::ReportBuilt);
                }
                Err(e) => error!(run_dir = %run_dir.display(), error = %e, "failed to build failure report"),
            }
        }
        check_cancelled(cancel)?;

        // Notified
        let (chat_message, metric_posted) = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                warn!("interrupted while sending notifications");
                return Err(WatchdogError::Interrupted);
            }

            sent = async {
                let chat = self.send_chat(options, outcome, report_url.as_deref()).await;
                let metric = options.cloudwatch && self.send_metric(reported_duration).await;
                (chat, metric)
            } => sent,
        };
        check_cancelled(cancel)?;
        enter(&mut phases, RunPhase::Notified);

        // Pruned
        let prune = match archive::prune_old_directories(&run_dir, self.config.system.expire_log_days) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "pruning old run directories failed");
                PruneReport::default()
            }
        };
        enter(&mut phases, RunPhase::Pruned);
        check_cancelled(cancel)?;

        enter(&mut phases, RunPhase::Done);
        Ok(RunSummary {
            run_dir,
            outcome,
            elapsed,
            reported_duration,
            report_url,
            chat_message,
            metric_posted,
            prune,
            phases,
        })
    }

    fn clear_cookies(&self) -> Result<(), WatchdogError> {
        let path = &self.config.cookies.path;
        if !path.is_file() {
            debug!(path = %path.display(), "no cookie file to clear");
            return Ok(());
        }
        std::fs::remove_file(path).map_err(|source| WatchdogError::ClearCookies {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "cleared cookie file");
        Ok(())
    }

    /// Returns the message that was sent, if any.
    async fn send_chat(
        &self,
        options: &RunOptions,
        outcome: Outcome,
        report_url: Option<&str>,
    ) -> Option<String> {
        let chat = self.chat.as_ref()?;
        let message = chat_message(options, outcome, report_url)?;
        match chat.notify(&message).await {
            Ok(()) => Some(message),
            Err(e) => {
                warn!(error = %e, "chat notification failed");
                None
            }
        }
    }

    async fn send_metric(&self, value: f64) -> bool {
        let Some(metrics) = self.metrics.as_ref() else {
            return false;
        };
        let cw = &self.config.cloudwatch;
        let datum = MetricDatum {
            host_id: cw.server_id.clone(),
            metric_name: cw.metric_watchdog.clone(),
            namespace: MetricDatum::namespace_for(&cw.server_name),
            value,
            unit: cw.unit.clone(),
        };
        match metrics.put_metric(&datum).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "metric post failed");
                false
            }
        }
    }
}

/// Chat text for a run, or `None` when nothing should be sent: successes
/// only go out with `--slack`, failures only when a report link exists.
pub fn chat_message(
    options: &RunOptions,
    outcome: Outcome,
    report_url: Option<&str>,
) -> Option<String> {
    if outcome.is_success() {
        options.slack.then(|| SUCCESS_MESSAGE.to_string())
    } else if options.wants_chat() {
        report_url.map(|url| format!("Website watchdog FAILED - see: {url}"))
    } else {
        None
    }
}

/// First line of `output.txt` and the operator status line.
pub fn failure_message(outcome: Outcome, secs: f64) -> String {
    match outcome {
        Outcome::TimedOut => format!("Website watchdog FAILED (timed out), taking {secs:.1} seconds"),
        _ => format!("Website watchdog FAILED, taking {secs:.1} seconds"),
    }
}

fn secs_f64<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn enter(phases: &mut Vec<RunPhase>, phase: RunPhase) {
    debug!(?phase, "run phase");
    phases.push(phase);
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), WatchdogError> {
    if cancel.is_cancelled() {
        return Err(WatchdogError::Interrupted);
    }
    Ok(())
}
