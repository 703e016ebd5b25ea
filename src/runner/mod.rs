//! Bounded monitor execution.
//!
//! The monitor runs as a child process in its own process group with stdout
//! and stderr captured into one ordered line stream.  Supervision is a
//! polling loop: drain whatever output has arrived, check whether the child
//! has exited, then wait for the next poll tick.  The wait also wakes on the
//! hard deadline and on cancellation, so neither has to sit out a full poll
//! interval.  On timeout or cancellation the whole process group is sent
//! SIGTERM and, after a grace period, SIGKILL.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;

/// Prefix of the text returned for a run that hit its deadline.
pub const TIMEOUT_MARKER: &str = "watchdog process timed out: ";

/// Upper bound on waiting for the output readers once the child is gone.
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const READER_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("watchdog command failed: unable to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("watchdog command failed with exit code {}", fmt_code(.code))]
    NonZeroExit { code: Option<i32>, output: String },

    #[error("watchdog command stopped by keyboard interrupt")]
    Interrupted { output: String },

    #[error("failed to wait for watchdog command: {0}")]
    Wait(#[source] std::io::Error),
}

impl RunnerError {
    /// Output captured before the failure, if any.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            RunnerError::NonZeroExit { output, .. } | RunnerError::Interrupted { output } => {
                Some(output.as_str())
            }
            _ => None,
        }
    }
}

fn fmt_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none (killed by signal)".to_string())
}

/// How a non-zero exit is reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Return the output with the exit status; the caller decides.
    Tolerate,
    /// Turn a non-zero exit into [`RunnerError::NonZeroExit`].
    Fatal,
}

/// Program plus arguments, built up like [`std::process::Command`].
#[derive(Debug, Clone)]
pub struct MonitorCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl MonitorCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for MonitorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The child exited on its own; `None` when it was killed by a signal.
    Exited(Option<i32>),
    /// The deadline passed and the child was terminated.
    TimedOut,
}

/// Everything a supervised run produced.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// stdout and stderr lines in arrival order, without line terminators.
    pub lines: Vec<String>,
    pub status: RunStatus,
    pub elapsed: Duration,
}

impl RunOutput {
    pub fn timed_out(&self) -> bool {
        self.status == RunStatus::TimedOut
    }

    /// Captured output as one string.  A timed-out run is prefixed with
    /// [`TIMEOUT_MARKER`].
    pub fn text(&self) -> String {
        let body = join_lines(&self.lines);
        if self.timed_out() {
            format!("{TIMEOUT_MARKER}{body}")
        } else {
            body
        }
    }
}

fn join_lines(lines: &[String]) -> String {
    let mut out = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// BoundedRunner
// ---------------------------------------------------------------------------

/// Runs one command under a wall-clock limit.
#[derive(Debug, Clone)]
pub struct BoundedRunner {
    timeout: Duration,
    poll: Duration,
    kill_grace: Duration,
    echo: bool,
    failure_mode: FailureMode,
}

impl BoundedRunner {
    /// A runner with a 5 second kill grace period, no echo, and fatal
    /// non-zero exits.
    pub fn new(timeout: Duration, poll: Duration) -> Self {
        Self {
            timeout,
            poll,
            kill_grace: Duration::from_secs(5),
            echo: false,
            failure_mode: FailureMode::Fatal,
        }
    }

    pub fn from_config(config: &ProcessConfig) -> Self {
        Self::new(
            Duration::from_secs(config.timeout_secs),
            Duration::from_secs(config.poll_secs),
        )
        .with_kill_grace(Duration::from_secs(config.kill_grace_secs))
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Print the command line before launch and the output after exit.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// SIGTERM to SIGKILL delay, never longer than one poll interval.
    fn grace(&self) -> Duration {
        self.kill_grace.min(self.poll)
    }

    /// Launch `command` and supervise it until it exits, the timeout
    /// passes, or `cancel` fires.
    pub async fn run(
        &self,
        command: &MonitorCommand,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, RunnerError> {
        if self.echo {
            println!();
            println!("{}", command);
        }

        let start = Instant::now();
        let deadline = start + self.timeout;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: command.program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        info!(
            command = %command,
            pid = pid,
            timeout_sec = self.timeout.as_secs(),
            poll_sec = self.poll.as_secs(),
            "monitor started"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, tx.clone())));
        }
        drop(tx);

        let mut lines = Vec::new();
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let status = loop {
            drain(&mut rx, &mut lines);

            match child.try_wait() {
                Ok(Some(exit)) => {
                    settle_readers(&mut readers, READER_SETTLE).await;
                    drain(&mut rx, &mut lines);
                    break RunStatus::Exited(exit.code());
                }
                Ok(None) => {}
                Err(e) => {
                    terminate_child(&mut child, self.grace()).await;
                    return Err(RunnerError::Wait(e));
                }
            }

            if Instant::now() >= deadline {
                warn!(pid = pid, timeout_sec = self.timeout.as_secs(), "monitor timed out, terminating");
                terminate_child(&mut child, self.grace()).await;
                settle_readers(&mut readers, READER_SETTLE).await;
                drain(&mut rx, &mut lines);
                break RunStatus::TimedOut;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    println!();
                    eprintln!("watchdog command stopped by keyboard interrupt, stopping...");
                    terminate_child(&mut child, self.grace()).await;
                    settle_readers(&mut readers, READER_SETTLE).await;
                    drain(&mut rx, &mut lines);
                    return Err(RunnerError::Interrupted {
                        output: join_lines(&lines),
                    });
                }

                _ = tokio::time::sleep_until(deadline) => {}

                _ = ticker.tick() => {}
            }
        };

        let output = RunOutput {
            lines,
            status,
            elapsed: start.elapsed(),
        };
        info!(
            pid = pid,
            status = ?output.status,
            elapsed_sec = output.elapsed.as_secs_f64(),
            lines = output.lines.len(),
            "monitor finished"
        );

        if let RunStatus::Exited(code) = output.status {
            if self.echo {
                println!("{}", output.text());
            }
            if code != Some(0) && self.failure_mode == FailureMode::Fatal {
                return Err(RunnerError::NonZeroExit {
                    code,
                    output: output.text(),
                });
            }
        }

        Ok(output)
    }
}

/// Read `reader` line by line into `tx` until EOF.  Invalid UTF-8 is
/// replaced rather than treated as an error.
async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "monitor output stream closed with error");
                break;
            }
        }
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>, lines: &mut Vec<String>) {
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
}

/// Wait up to `limit` for the reader tasks to hit EOF, then abort any that
/// are still running.
async fn settle_readers(readers: &mut Vec<JoinHandle<()>>, limit: Duration) {
    let joined = tokio::time::timeout(limit, async {
        for handle in readers.iter_mut() {
            let _ = handle.await;
        }
    })
    .await;
    if joined.is_err() {
        debug!("monitor output pipes still open after exit, abandoning readers");
    }
    for handle in readers.drain(..) {
        handle.abort();
    }
}

/// Terminate the child's process group.
///
/// Sends SIGTERM first, waits up to `grace`, then sends SIGKILL if the
/// process is still running.
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // The child leads its own process group; a negative pid
            // addresses the whole group.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "child exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for child after SIGTERM");
        }
        Err(_) => {
            warn!("child did not exit after SIGTERM, sending SIGKILL");
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
            }
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL child");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> MonitorCommand {
        MonitorCommand::new("sh").arg("-c").arg(script)
    }

    fn runner(timeout_secs: u64, poll_secs: u64) -> BoundedRunner {
        BoundedRunner::new(Duration::from_secs(timeout_secs), Duration::from_secs(poll_secs))
    }

    #[test]
    fn test_command_display() {
        let cmd = MonitorCommand::new("./watchdog-monitor.js").arg("/var/log/watchdog/run");
        assert_eq!(cmd.to_string(), "./watchdog-monitor.js /var/log/watchdog/run");
    }

    #[test]
    fn test_timed_out_text_is_marked() {
        let out = RunOutput {
            lines: vec!["loading page".into()],
            status: RunStatus::TimedOut,
            elapsed: Duration::from_secs(60),
        };
        assert_eq!(out.text(), "watchdog process timed out: loading page\n");
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let cancel = CancellationToken::new();
        let out = runner(10, 1)
            .run(&sh("echo to-stdout; echo to-stderr 1>&2"), &cancel)
            .await
            .unwrap();

        assert_eq!(out.status, RunStatus::Exited(Some(0)));
        assert!(out.lines.contains(&"to-stdout".to_string()));
        assert!(out.lines.contains(&"to-stderr".to_string()));
        assert!(!out.text().starts_with(TIMEOUT_MARKER));
    }

    #[tokio::test]
    async fn test_passes_arguments() {
        let cancel = CancellationToken::new();
        let cmd = sh("echo \"dir=$1\"").arg("sh").arg("/tmp/run-dir");
        let out = runner(10, 1).run(&cmd, &cancel).await.unwrap();
        assert_eq!(out.lines, vec!["dir=/tmp/run-dir".to_string()]);
    }

    #[tokio::test]
    async fn test_non_zero_tolerated() {
        let cancel = CancellationToken::new();
        let out = runner(10, 1)
            .with_failure_mode(FailureMode::Tolerate)
            .run(&sh("echo 'Error: element not found'; exit 3"), &cancel)
            .await
            .unwrap();

        assert_eq!(out.status, RunStatus::Exited(Some(3)));
        assert_eq!(out.text(), "Error: element not found\n");
    }

    #[tokio::test]
    async fn test_non_zero_fatal() {
        let cancel = CancellationToken::new();
        let err = runner(10, 1)
            .run(&sh("echo broken; exit 1"), &cancel)
            .await
            .unwrap_err();

        match err {
            RunnerError::NonZeroExit { code, ref output } => {
                assert_eq!(code, Some(1));
                assert_eq!(output, "broken\n");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_terminates_within_bound() {
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let out = runner(2, 1)
            .with_failure_mode(FailureMode::Tolerate)
            .run(&sh("echo started; sleep 30; echo never"), &cancel)
            .await
            .unwrap();

        // Timeout plus one poll interval, with slack for process start-up.
        assert!(started.elapsed() < Duration::from_millis(3500), "took {:?}", started.elapsed());
        assert!(out.timed_out());
        assert!(out.text().starts_with(TIMEOUT_MARKER));
        assert!(out.text().contains("started"));
        assert!(!out.text().contains("never"));
    }

    #[tokio::test]
    async fn test_timeout_is_not_fatal() {
        let cancel = CancellationToken::new();
        let out = runner(1, 1)
            .run(&sh("sleep 30"), &cancel)
            .await
            .unwrap();
        assert_eq!(out.status, RunStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_sigkill() {
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let out = runner(1, 1)
            .with_kill_grace(Duration::from_millis(300))
            .run(&sh("trap '' TERM; echo stubborn; sleep 30"), &cancel)
            .await
            .unwrap();

        assert!(out.timed_out());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let cancel = CancellationToken::new();
        let err = runner(5, 1)
            .run(&MonitorCommand::new("/nonexistent/watchdog-monitor"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cancel_stops_child_promptly() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = runner(60, 5)
            .run(&sh("echo waiting; sleep 60"), &cancel)
            .await
            .unwrap_err();

        // Well inside the 5 second poll interval.
        assert!(started.elapsed() < Duration::from_secs(3));
        match err {
            RunnerError::Interrupted { output } => assert!(output.contains("waiting")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
