//! Outbound run notifications: a chat message and a metrics data point.
//!
//! Both are best effort.  Implementations return errors so the caller can
//! log them, but nothing retries and a failed send never fails the run.

pub mod cloudwatch;
pub mod slack;

use std::time::Duration;

use thiserror::Error;

pub use cloudwatch::CloudWatchClient;
pub use slack::SlackNotifier;

/// Per-request limit for both transports.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("invalid endpoint {url}: {reason}")]
    Endpoint { url: String, reason: String },

    #[error("request to {target} failed: {source}")]
    Transport {
        target: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{target} rejected the request with HTTP {status}: {body}")]
    Rejected {
        target: &'static str,
        status: u16,
        body: String,
    },
}

/// Sends a short text message to a chat channel.
#[async_trait::async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

/// One data point for the metrics backend.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDatum {
    /// Host identifier, sent as the `InstanceId` dimension.
    pub host_id: String,
    pub metric_name: String,
    pub namespace: String,
    pub value: f64,
    pub unit: String,
}

impl MetricDatum {
    /// Namespace derived from a human-readable server description.
    pub fn namespace_for(server_name: &str) -> String {
        format!("EC2: {server_name}")
    }
}

/// Accepts metric data points.
#[async_trait::async_trait]
pub trait MetricsSink: Send + Sync {
    async fn put_metric(&self, datum: &MetricDatum) -> Result<(), NotifyError>;
}

/// Map a non-success response to [`NotifyError::Rejected`].
async fn check_response(
    target: &'static str,
    response: reqwest::Response,
) -> Result<(), NotifyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(NotifyError::Rejected {
        target,
        status: status.as_u16(),
        body,
    })
}
