use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::NotificationSink;
use crate::db::models::DeltaEvent;

/// POSTs each delta event as JSON to a configured URL.
#[derive(Clone)]
pub struct WebhookSink {
    http: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str, user_agent: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .user_agent(user_agent)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(WebhookSink {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn on_delta(&self, event: &DeltaEvent) -> Result<()> {
        debug!("[{}] Posting delta to {}", event.target, self.url);

        let resp = self
            .http
            .post(&self.url)
            .json(event)
            .send()
            .await
            .context("Webhook request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Webhook error {}: {}", status, body);
        }
        Ok(())
    }
}
