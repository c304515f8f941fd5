//! Webhook notifier
//!
//! Posts alerts to a Discord-style webhook as `{"content": "<message>"}`.
//! One attempt per message; the dispatcher decides what a failure means.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use flatline_core::alert::{Notifier, NotifyError};

/// Notifier backed by an HTTP webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    /// Create a notifier posting to `url`
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook client")?;

        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, message: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "content": message }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotifyError::Timeout(self.timeout)
                } else {
                    NotifyError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }

        // Webhook URLs embed a token, keep them out of the logs
        debug!(status = status.as_u16(), bytes = message.len(), "Webhook accepted message");
        Ok(())
    }
}
