use crate::config::{Messaging, SourceConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const PAYLOAD_TYPE: &str = "application/base64";

/// Envelope posted to the downstream messaging endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub organisation_id: String,
    pub software: String,
    pub software_version: String,
    pub payload_type: String,
    pub payload: String,
}

pub fn build_envelope(
    message_id: &str,
    source: &SourceConfig,
    organisation_id: &str,
    payload: &[u8],
) -> Envelope {
    Envelope {
        message_id: message_id.to_string(),
        timestamp: Utc::now(),
        organisation_id: organisation_id.to_string(),
        software: source.software_content_type.clone(),
        software_version: source.software_version.clone(),
        payload_type: PAYLOAD_TYPE.to_string(),
        payload: STANDARD.encode(payload),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResponse {
    pub status_line: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("messaging endpoint returned {status_line}: {body}")]
    Http { status_line: String, body: String },
    #[error("messaging endpoint unreachable: {0}")]
    Transport(String),
}

impl SendError {
    /// Text recorded as the inbound side of a failed notification.
    pub fn inbound(&self) -> Option<String> {
        match self {
            SendError::Http { status_line, body } => Some(format!("{}\n{}", status_line, body)),
            SendError::Transport(_) => None,
        }
    }
}

#[async_trait]
pub trait MessagingService: Send + Sync {
    async fn send(&self, envelope: &Envelope, is_bulk: bool) -> Result<SendResponse, SendError>;
}

#[derive(Clone)]
pub struct HttpMessagingClient {
    http: Client,
    url: Url,
    token: Option<String>,
}

impl fmt::Debug for HttpMessagingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMessagingClient")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl HttpMessagingClient {
    pub fn from_config(cfg: &Messaging) -> Result<Self> {
        Self::new(
            &cfg.url,
            cfg.auth_token.clone(),
            Duration::from_secs(cfg.timeout_seconds),
        )
    }

    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid messaging url {}", url))?;
        let http = Client::builder()
            .user_agent("feed-reader/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build messaging client")?;
        Ok(Self { http, url, token })
    }

    pub fn build_request(&self, envelope: &Envelope, is_bulk: bool) -> Result<reqwest::Request> {
        let mut builder = self
            .http
            .post(self.url.clone())
            .header("Content-Type", "application/json")
            .json(envelope);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        if is_bulk {
            builder = builder.header("IsBulk", "true");
        }
        builder.build().context("failed to build messaging request")
    }
}

fn status_line(status: reqwest::StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .trim_end()
    .to_string()
}

#[async_trait]
impl MessagingService for HttpMessagingClient {
    async fn send(&self, envelope: &Envelope, is_bulk: bool) -> Result<SendResponse, SendError> {
        let request = self
            .build_request(envelope, is_bulk)
            .map_err(|err| SendError::Transport(format!("{:#}", err)))?;
        debug!(url = %request.url(), message_id = %envelope.message_id, is_bulk, "sending envelope");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|err| SendError::Transport(err.to_string()))?;
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SendError::Http {
                status_line: status_line(status),
                body,
            });
        }
        Ok(SendResponse {
            status_line: status_line(status),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, Config};

    fn source() -> SourceConfig {
        let cfg: Config = serde_yaml::from_str(config::example()).unwrap();
        cfg.sources[0].clone()
    }

    #[test]
    fn envelope_base64_encodes_payload() {
        let env = build_envelope("m-1", &source(), "A12345", b"[1,2]");
        assert_eq!(env.payload, "WzEsMl0=");
        assert_eq!(env.payload_type, PAYLOAD_TYPE);
        assert_eq!(env.organisation_id, "A12345");
        assert_eq!(env.software, source().software_content_type);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["message_id"], "m-1");
    }

    #[test]
    fn build_request_sets_headers() {
        let client = HttpMessagingClient::new(
            "http://localhost:9000/api/messages",
            Some("token".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let env = build_envelope("m-1", &source(), "A12345", b"x");

        let request = client.build_request(&env, true).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/api/messages");
        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers.get("IsBulk").and_then(|h| h.to_str().ok()).unwrap(),
            "true"
        );

        let request = client.build_request(&env, false).unwrap();
        assert!(request.headers().get("IsBulk").is_none());
    }

    #[test]
    fn http_error_exposes_status_and_body() {
        let err = SendError::Http {
            status_line: "HTTP/1.1 503 Service Unavailable".into(),
            body: "busy".into(),
        };
        assert_eq!(
            err.to_string(),
            "messaging endpoint returned HTTP/1.1 503 Service Unavailable: busy"
        );
        assert_eq!(
            err.inbound().as_deref(),
            Some("HTTP/1.1 503 Service Unavailable\nbusy")
        );
        assert!(SendError::Transport("refused".into()).inbound().is_none());
        assert_eq!(status_line(reqwest::StatusCode::OK), "HTTP/1.1 200 OK");
    }
}
