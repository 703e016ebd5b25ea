//! TOML configuration for the website watchdog.
//!
//! The file is read once at start-up into a [`WatchdogConfig`] and handed to
//! every component by reference.  Keys the watchdog cannot run without have
//! no defaults: a missing section or key is a load error naming the key.
//! Semantic checks (non-zero timeouts, a compilable success pattern) run at
//! load time so a bad file never gets as far as creating a run directory.

use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable consulted when `--config` is not given.
pub const CONFIG_ENV: &str = "SITEWATCHDOG_CONFIG";

/// Config file used when neither `--config` nor [`CONFIG_ENV`] is set.
pub const DEFAULT_CONFIG_FILE: &str = "watchdog.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file exists: {}", path.display())]
    Missing { path: PathBuf },

    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration element: {key} => {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("invalid success pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for one watchdog process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub system: SystemConfig,
    pub process: ProcessConfig,
    pub application: ApplicationConfig,
    pub cookies: CookiesConfig,
    #[serde(default)]
    pub time: TimeConfig,
    pub slack: SlackConfig,
    pub cloudwatch: CloudWatchConfig,
}

impl WatchdogConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Missing {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        info!(path = %path.display(), "loaded watchdog configuration");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config path: explicit flag, then [`CONFIG_ENV`], then
    /// [`DEFAULT_CONFIG_FILE`] in the working directory.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            debug!(path = %env_path, "config path taken from environment");
            return PathBuf::from(env_path);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    /// Check the constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.process.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "process.timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.process.poll_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "process.poll_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.process.poll_secs > self.process.timeout_secs {
            return Err(ConfigError::Invalid {
                key: "process.poll_secs",
                reason: format!(
                    "poll interval {}s exceeds timeout {}s",
                    self.process.poll_secs, self.process.timeout_secs
                ),
            });
        }
        if self.application.success_string.is_empty() {
            return Err(ConfigError::Invalid {
                key: "application.success_string",
                reason: "must not be empty".into(),
            });
        }
        self.application.success_pattern()?;
        check_time_format("time.label_format", &self.time.label_format)?;
        check_time_format("time.display_format", &self.time.display_format)?;
        if !self.cloudwatch.failure_time.is_finite() {
            return Err(ConfigError::Invalid {
                key: "cloudwatch.failure_time",
                reason: "must be a finite number".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// Filesystem layout and report publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Root under which one directory per run is created.  Must already exist.
    pub log_dir: PathBuf,
    /// Prefix the run directory name is appended to when building the report link.
    pub report_url: String,
    /// Run directories last modified longer ago than this are removed.
    pub expire_log_days: u32,
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

/// Monitor invocation and supervision limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Monitor program, invoked as `<monitor> <run_dir>`.
    #[serde(default = "default_monitor")]
    pub monitor: PathBuf,
    /// Wall-clock budget for one monitor run.
    pub timeout_secs: u64,
    /// Interval between liveness checks.
    pub poll_secs: u64,
    /// Time allowed between SIGTERM and SIGKILL (capped at `poll_secs`).
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

fn default_monitor() -> PathBuf {
    PathBuf::from("./watchdog-monitor.js")
}

fn default_kill_grace_secs() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// How a run's output is judged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Regex searched for anywhere in the captured output.
    pub success_string: String,
    /// Extensions (without dot, case-insensitive) removed from the run
    /// directory after a successful run.
    #[serde(default = "default_transient_image_extensions")]
    pub transient_image_extensions: Vec<String>,
}

impl ApplicationConfig {
    /// Compile the success pattern.
    pub fn success_pattern(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.success_string).map_err(|source| ConfigError::InvalidPattern {
            pattern: self.success_string.clone(),
            source,
        })
    }
}

fn default_transient_image_extensions() -> Vec<String> {
    vec!["jpeg".to_string(), "jpg".to_string(), "png".to_string()]
}

// ---------------------------------------------------------------------------
// Cookies
// ---------------------------------------------------------------------------

/// Cookie jar shared with the monitor between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookiesConfig {
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Zones and chrono format strings for directory labels and the dates on
/// the index page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    /// IANA zone for the "Date local" line of the index page.
    pub zone_local: Tz,
    /// IANA zone for the run directory name and the "Date GMT" line.
    pub zone_global: Tz,
    /// Run directory name, rendered in `zone_global`.
    pub label_format: String,
    /// Dates shown in the HTML index.
    pub display_format: String,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            zone_local: Tz::UTC,
            zone_global: Tz::UTC,
            label_format: "%Y_%m_%d-%H_%M_%S_%Z".to_string(),
            display_format: "%B %d, %Y %H:%M:%S %Z".to_string(),
        }
    }
}

fn check_time_format(key: &'static str, format: &str) -> Result<(), ConfigError> {
    use chrono::format::{Item, StrftimeItems};

    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ConfigError::Invalid {
            key,
            reason: format!("unsupported date format {format:?}"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Slack
// ---------------------------------------------------------------------------

/// Incoming-webhook chat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    pub url: String,
    /// Channel name without the leading `#`.
    pub channel: String,
    pub user: String,
    pub emoji: String,
}

// ---------------------------------------------------------------------------
// CloudWatch
// ---------------------------------------------------------------------------

/// Metrics backend credentials and naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudWatchConfig {
    pub access_id: String,
    pub secret_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Overrides `https://monitoring.<region>.amazonaws.com/`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Host identifier, sent as the `InstanceId` dimension.
    pub server_id: String,
    /// Human-readable server description; the namespace is `EC2: <server_name>`.
    pub server_name: String,
    pub metric_watchdog: String,
    /// Value reported instead of the elapsed time when a run fails.
    pub failure_time: f64,
    #[serde(default = "default_unit")]
    pub unit: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_unit() -> String {
    "Count".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
