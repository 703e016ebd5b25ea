use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use sitewatchdog::{RunOptions, WatchdogConfig};

#[derive(Parser)]
#[command(
    name = "sitewatchdog",
    about = "Bounded-time supervisor for synthetic website transaction monitors",
    version,
    long_about = None
)]
struct Cli {
    /// Post the run duration to CloudWatch
    #[arg(short = 'c', long)]
    cloudwatch: bool,

    /// Send a Slack message on success and on failure
    #[arg(short = 's', long)]
    slack: bool,

    /// Send a Slack message on failure only
    #[arg(short = 'f', long = "slackfail")]
    slack_failure: bool,

    /// Delete the cookie file before running the monitor
    #[arg(short = 'd', long)]
    clear_cookies: bool,

    /// Configuration file (defaults to $SITEWATCHDOG_CONFIG, then ./watchdog.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print a JSON summary of the run on completion
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let options = RunOptions {
        cloudwatch: cli.cloudwatch,
        slack: cli.slack,
        slack_failure: cli.slack_failure,
        clear_cookies: cli.clear_cookies,
    };
    let config_path = WatchdogConfig::resolve_path(cli.config.as_deref());

    // Ctrl-C cancels the run; the runner stops the monitor before returning.
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received");
            trigger.cancel();
        }
    });

    match sitewatchdog::run(&config_path, &options, &cancel).await {
        Ok(summary) => {
            if cli.json {
                match serde_json::to_string_pretty(&summary) {
                    Ok(json) => println!("{}", json),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize run summary"),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e.render());
            ExitCode::from(e.exit_code())
        }
    }
}
