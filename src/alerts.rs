//! Operational alert channel.
use crate::config::Alerts;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

#[async_trait]
pub trait Alerter: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

/// Slack-compatible incoming webhook.
pub struct WebhookAlerter {
    http: Client,
    url: Url,
}

impl WebhookAlerter {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid alert webhook {}", url))?;
        let http = Client::builder()
            .user_agent("feed-reader/0.1")
            .build()
            .context("failed to build alert client")?;
        Ok(Self { http, url })
    }

    pub fn build_request(&self, text: &str) -> Result<reqwest::Request> {
        self.http
            .post(self.url.clone())
            .json(&json!({ "text": text }))
            .build()
            .context("failed to build alert request")
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn send(&self, text: &str) -> Result<()> {
        let request = self.build_request(text)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach alert webhook")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("alert webhook error {}: {}", status, body));
        }
        Ok(())
    }
}

/// Used when no webhook is configured.
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn send(&self, text: &str) -> Result<()> {
        warn!(alert = %text, "alert");
        Ok(())
    }
}

pub fn from_config(cfg: &Alerts) -> Result<Arc<dyn Alerter>> {
    match cfg.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => Ok(Arc::new(WebhookAlerter::new(url)?)),
        None => Ok(Arc::new(LogAlerter)),
    }
}

/// Send an alert; a broken alert channel never fails the caller. Returns
/// whether the alert was delivered.
pub async fn raise(alerter: &dyn Alerter, text: &str) -> bool {
    match alerter.send(text).await {
        Ok(()) => true,
        Err(err) => {
            error!(?err, alert = %text, "failed to deliver alert");
            false
        }
    }
}
