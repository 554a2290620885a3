//! Push notification sink.
//!
//! The provider itself is external. [`HttpPushSink`] forwards batches to a
//! gateway over HTTP; [`DisabledPushSink`] stands in when none is configured.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

impl PushNotification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.data.insert(key.to_string(), value.to_string());
        self
    }
}

/// Per-call delivery outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushReport {
    pub success_count: usize,
    pub failure_count: usize,
    /// Tokens the provider rejected as invalid. They get pruned.
    #[serde(default)]
    pub failed_tokens: Vec<String>,
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("Push gateway unreachable: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Push gateway answered {0}")]
    Status(reqwest::StatusCode),
}

#[async_trait]
pub trait PushSink: Send + Sync {
    async fn send_to_all(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<PushReport, PushError>;
}

pub struct DisabledPushSink;

#[async_trait]
impl PushSink for DisabledPushSink {
    async fn send_to_all(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<PushReport, PushError> {
        tracing::debug!(tokens = tokens.len(), title = %notification.title, "push disabled, dropping notification");
        Ok(PushReport::default())
    }
}

#[derive(Serialize)]
struct GatewayRequest<'a> {
    tokens: &'a [String],
    title: &'a str,
    body: &'a str,
    data: &'a BTreeMap<String, String>,
}

pub struct HttpPushSink {
    client: reqwest::Client,
    url: String,
    key: Option<String>,
}

impl HttpPushSink {
    pub fn new(url: String, key: Option<String>) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, url, key })
    }
}

#[async_trait]
impl PushSink for HttpPushSink {
    async fn send_to_all(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<PushReport, PushError> {
        let mut request = self.client.post(&self.url).json(&GatewayRequest {
            tokens,
            title: &notification.title,
            body: &notification.body,
            data: &notification.data,
        });
        if let Some(key) = &self.key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(PushError::Status(resp.status()));
        }
        Ok(resp.json::<PushReport>().await?)
    }
}
