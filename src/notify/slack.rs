//! Slack incoming-webhook notifier.

use reqwest::Client;
use serde::Serialize;
use tracing::info;

use super::{check_response, ChatNotifier, NotifyError, REQUEST_TIMEOUT};
use crate::config::SlackConfig;

#[derive(Debug, Serialize)]
struct SlackPayload<'a> {
    text: &'a str,
    channel: String,
    user: &'a str,
    icon_emoji: &'a str,
}

pub struct SlackNotifier {
    client: Client,
    config: SlackConfig,
}

impl SlackNotifier {
    pub fn new(config: SlackConfig) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(NotifyError::Client)?;
        Ok(Self { client, config })
    }

    fn payload<'a>(&'a self, message: &'a str) -> SlackPayload<'a> {
        SlackPayload {
            text: message,
            channel: format!("#{}", self.config.channel),
            user: &self.config.user,
            icon_emoji: &self.config.emoji,
        }
    }
}

#[async_trait::async_trait]
impl ChatNotifier for SlackNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        info!(channel = %self.config.channel, %message, "posting to Slack");
        let response = self
            .client
            .post(&self.config.url)
            .json(&self.payload(message))
            .send()
            .await
            .map_err(|source| NotifyError::Transport {
                target: "slack",
                source,
            })?;
        check_response("slack", response).await
    }
}
