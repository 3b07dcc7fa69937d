// src/publish/mattermost.rs
use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

/// Incoming webhook of one Mattermost channel.
#[derive(Clone, Debug)]
pub struct Mattermost {
    http: Client,
    webhook: String,
    /// Refuse to run without a webhook instead of only logging.
    required: bool,
}

impl Mattermost {
    pub fn new(http: Client, webhook: &str) -> Self {
        Self {
            http,
            webhook: webhook.to_string(),
            required: false,
        }
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Post `text` as `{"text": ...}`. An unconfigured webhook is an error
    /// when the channel is required and only logs the message otherwise.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        if self.webhook.is_empty() {
            if self.required {
                bail!("no mattermost webhook configured, message not sent");
            }
            warn!(chars = text.len(), "no mattermost webhook configured, message not sent");
            info!("{}", text);
            return Ok(());
        }
        let resp = self
            .http
            .post(&self.webhook)
            .json(&json!({ "text": text }))
            .send()
            .await
            .context("posting to mattermost")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("mattermost webhook returned {}: {}", status, body);
        }
        info!(chars = text.len(), "mattermost message sent");
        Ok(())
    }
}
