//! End-to-end runs against a local HTTP server standing in for the Slack
//! webhook and the CloudWatch API.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

use sitewatchdog::classify::Outcome;
use sitewatchdog::{RunOptions, WatchdogConfig, WatchdogError};

#[derive(Clone, Default)]
struct Captured {
    slack: Arc<Mutex<Vec<serde_json::Value>>>,
    metrics: Arc<Mutex<Vec<(String, String)>>>,
}

async fn slack_hook(State(c): State<Captured>, Json(body): Json<serde_json::Value>) -> &'static str {
    c.slack.lock().unwrap().push(body);
    "ok"
}

async fn cloudwatch_hook(State(c): State<Captured>, headers: HeaderMap, body: String) -> StatusCode {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    c.metrics.lock().unwrap().push((auth, body));
    StatusCode::OK
}

async fn rejecting_hook() -> (StatusCode, &'static str) {
    (StatusCode::FORBIDDEN, "invalid_token")
}

/// Start the capture server and return its base URL.
async fn spawn_capture() -> (String, Captured) {
    let captured = Captured::default();
    let app = Router::new()
        .route("/slack", post(slack_hook))
        .route("/slack-rejected", post(rejecting_hook))
        .route("/cloudwatch/", post(cloudwatch_hook))
        .with_state(captured.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), captured)
}

/// Write a config whose notifiers point at `base` and a monitor running
/// `script`.  Returns the config path and the log root.
fn write_fixture(dir: &Path, base: &str, script: &str, timeout_secs: u64) -> (PathBuf, PathBuf) {
    let logs = dir.join("logs");
    std::fs::create_dir(&logs).unwrap();
    let monitor = dir.join("monitor.sh");
    std::fs::write(&monitor, format!("#!/bin/sh\n{script}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&monitor, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let config = dir.join("watchdog.toml");
    std::fs::write(
        &config,
        format!(
            r#"
[system]
log_dir = "{logs}"
report_url = "https://reports.example.com/watchdog/"
expire_log_days = 7

[process]
monitor = "{monitor}"
timeout_secs = {timeout_secs}
poll_secs = 1

[application]
success_string = "ALL TESTS PASSED"

[cookies]
path = "{cookies}"

[slack]
url = "{base}/slack"
channel = "ops"
user = "watchdog"
emoji = ":dog:"

[cloudwatch]
access_id = "AKIDEXAMPLE"
secret_key = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY"
endpoint = "{base}/cloudwatch/"
server_id = "i-0123456789abcdef0"
server_name = "Web Frontend"
metric_watchdog = "WatchdogTime"
failure_time = 500
"#,
            logs = logs.display(),
            monitor = monitor.display(),
            cookies = dir.join("cookies.json").display(),
        ),
    )
    .unwrap();
    (config, logs)
}

fn form_value(body: &str, key: &str) -> Option<String> {
    url::form_urlencoded::parse(body.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

#[tokio::test]
async fn test_success_posts_metric_and_chat() {
    let (base, captured) = spawn_capture().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let (config, _logs) = write_fixture(
        tmp.path(),
        &base,
        "echo 'step 1 ok'\necho 'ALL TESTS PASSED'",
        10,
    );
    let options = RunOptions {
        cloudwatch: true,
        slack: true,
        ..Default::default()
    };

    let summary = sitewatchdog::run(&config, &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.outcome, Outcome::Success);
    assert!(summary.metric_posted);
    assert_eq!(
        summary.chat_message.as_deref(),
        Some("Website watchdog completed successfully")
    );

    let slack = captured.slack.lock().unwrap();
    assert_eq!(slack.len(), 1);
    assert_eq!(slack[0]["text"], "Website watchdog completed successfully");
    assert_eq!(slack[0]["channel"], "#ops");
    assert_eq!(slack[0]["user"], "watchdog");
    assert_eq!(slack[0]["icon_emoji"], ":dog:");

    let metrics = captured.metrics.lock().unwrap();
    assert_eq!(metrics.len(), 1);
    let (auth, body) = &metrics[0];
    assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"), "got: {auth}");
    assert!(auth.contains("/us-east-1/monitoring/aws4_request"));
    assert_eq!(form_value(body, "Action").as_deref(), Some("PutMetricData"));
    assert_eq!(form_value(body, "Namespace").as_deref(), Some("EC2: Web Frontend"));
    assert_eq!(
        form_value(body, "MetricData.member.1.MetricName").as_deref(),
        Some("WatchdogTime")
    );
    assert_eq!(
        form_value(body, "MetricData.member.1.Dimensions.member.1.Value").as_deref(),
        Some("i-0123456789abcdef0")
    );
    let value: f64 = form_value(body, "MetricData.member.1.Value")
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(value, summary.reported_duration);
    assert!(value < 10.0);
}

#[tokio::test]
async fn test_failure_reports_link_and_sentinel() {
    let (base, captured) = spawn_capture().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let (config, _logs) = write_fixture(
        tmp.path(),
        &base,
        "touch \"$1/step1.jpeg\"\necho 'Error: element not found'\nexit 1",
        10,
    );
    let options = RunOptions {
        cloudwatch: true,
        slack_failure: true,
        ..Default::default()
    };

    let summary = sitewatchdog::run(&config, &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.outcome, Outcome::Failure);
    assert_eq!(summary.reported_duration, 500.0);

    let label = summary.run_dir.file_name().unwrap().to_string_lossy().into_owned();
    let expected_url = format!("https://reports.example.com/watchdog/{label}");
    assert_eq!(summary.report_url.as_deref(), Some(expected_url.as_str()));

    // Failure evidence is kept, screenshots included.
    let output = std::fs::read_to_string(summary.run_dir.join("output.txt")).unwrap();
    assert!(output.starts_with("Website watchdog FAILED, taking "));
    assert!(output.contains("Error: element not found"));
    let index = std::fs::read_to_string(summary.run_dir.join("index.html")).unwrap();
    assert!(index.contains(r#"<a href="step1.jpeg">step1.jpeg</a>"#));
    assert!(index.contains(r#"<a href="output.txt">output.txt</a>"#));

    let slack = captured.slack.lock().unwrap();
    assert_eq!(slack.len(), 1);
    assert_eq!(
        slack[0]["text"],
        format!("Website watchdog FAILED - see: {expected_url}")
    );

    let metrics = captured.metrics.lock().unwrap();
    assert_eq!(form_value(&metrics[0].1, "MetricData.member.1.Value").as_deref(), Some("500"));
}

#[tokio::test]
async fn test_timeout_is_reported_as_failure() {
    let (base, captured) = spawn_capture().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let (config, _logs) = write_fixture(
        tmp.path(),
        &base,
        "echo 'ALL TESTS PASSED'\nsleep 30",
        2,
    );
    let options = RunOptions {
        slack_failure: true,
        ..Default::default()
    };

    let started = std::time::Instant::now();
    let summary = sitewatchdog::run(&config, &options, &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() < std::time::Duration::from_secs(6));
    assert_eq!(summary.outcome, Outcome::TimedOut);
    let output = std::fs::read_to_string(summary.run_dir.join("output.txt")).unwrap();
    assert!(output.starts_with("Website watchdog FAILED (timed out), taking "));
    assert!(output.contains(sitewatchdog::runner::TIMEOUT_MARKER));
    assert_eq!(captured.slack.lock().unwrap().len(), 1);
    assert!(captured.metrics.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_chat_does_not_fail_run() {
    let (base, _captured) = spawn_capture().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let (config_path, _logs) = write_fixture(tmp.path(), &base, "echo 'ALL TESTS PASSED'", 10);
    let mut config = WatchdogConfig::load(&config_path).unwrap();
    config.slack.url = format!("{base}/slack-rejected");
    let options = RunOptions {
        slack: true,
        ..Default::default()
    };

    let watchdog = sitewatchdog::Watchdog::new(config, &options).unwrap();
    let summary = watchdog.run(&options, &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, Outcome::Success);
    assert!(summary.chat_message.is_none());
}

#[tokio::test]
async fn test_cancelled_run_is_interrupted() {
    let (base, _captured) = spawn_capture().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let (config, logs) = write_fixture(tmp.path(), &base, "sleep 30", 20);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = sitewatchdog::run(&config, &RunOptions::default(), &cancel)
        .await
        .unwrap_err();

    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert!(matches!(err, WatchdogError::Runner(_)));
    assert_eq!(err.exit_code(), 130);
    // Nothing was written, so no run directory is left behind.
    assert_eq!(std::fs::read_dir(&logs).unwrap().count(), 0);
}

#[tokio::test]
async fn test_expired_runs_are_pruned() {
    let (base, _captured) = spawn_capture().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let (config, logs) = write_fixture(tmp.path(), &base, "echo 'ALL TESTS PASSED'", 10);

    let old = logs.join("2020_01_01-00_00_00_UTC");
    std::fs::create_dir(&old).unwrap();
    std::fs::write(old.join("output.txt"), "old").unwrap();
    let month_ago = std::time::SystemTime::now() - std::time::Duration::from_secs(30 * 24 * 3600);
    std::fs::File::open(&old).unwrap().set_modified(month_ago).unwrap();

    let summary = sitewatchdog::run(&config, &RunOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!old.exists());
    assert_eq!(summary.prune.removed, vec![old]);
    // The successful run left nothing behind, so its directory went too.
    assert!(summary.prune.removed_empty_run_dir);
    assert!(!summary.run_dir.exists());
}
