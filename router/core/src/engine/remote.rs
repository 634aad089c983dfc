//! Remote HTTP engine
//!
//! Posts `{"query", "context"}` as JSON and expects
//! `{"text": "...", "confidence": 0.8}` back. HTTP failures are turned into
//! messages that classify into the right [`crate::breaker::ErrorCategory`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{Engine, EngineError, EngineReply};
use crate::complexity::EngineFamily;

/// Connection settings for the remote engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Full URL requests are posted to
    pub endpoint: String,
    /// Bearer token, if the endpoint needs one
    pub api_key: Option<String>,
    /// Per-request HTTP timeout
    pub timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8787/v1/answer".to_string(),
            api_key: None,
            timeout: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemoteAnswer {
    #[serde(alias = "answer", alias = "response")]
    text: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.85
}

/// Engine backed by an HTTP JSON endpoint
#[derive(Clone)]
pub struct RemoteEngine {
    id: String,
    config: RemoteConfig,
    http_client: reqwest::Client,
}

impl RemoteEngine {
    /// Create the engine and its HTTP client
    pub fn new(config: RemoteConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            id: EngineFamily::Remote.as_str().to_string(),
            config,
            http_client,
        })
    }

    /// Configured endpoint URL
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn status_error(&self, status: StatusCode, body: &str) -> EngineError {
        let code = status.as_u16();
        tracing::debug!(engine = %self.id, status = code, body = %truncate(body, 200), "Remote engine error");
        // Body text stays out of the message so it cannot change the category
        let message = match code {
            429 => format!("rate limit exceeded (HTTP {code})"),
            401 | 403 => format!("unauthorized (HTTP {code})"),
            500..=599 => format!("server error (HTTP {code})"),
            _ => format!("request rejected (HTTP {code}) as invalid"),
        };
        EngineError::failed(&self.id, message)
    }

    fn transport_error(&self, err: &reqwest::Error) -> EngineError {
        if err.is_timeout() {
            return EngineError::Timeout {
                engine: self.id.clone(),
                ms: u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
            };
        }
        // The URL is left out of the message; port digits would confuse classification
        tracing::debug!(engine = %self.id, error = %err, "Remote transport error");
        if err.is_connect() {
            return EngineError::failed(&self.id, "connection failed");
        }
        EngineError::failed(&self.id, "network error while contacting remote engine")
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

impl std::fmt::Debug for RemoteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEngine")
            .field("id", &self.id)
            .field("endpoint", &self.config.endpoint)
            .field("has_api_key", &self.config.api_key.is_some())
            .finish()
    }
}

#[async_trait]
impl Engine for RemoteEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn family(&self) -> EngineFamily {
        EngineFamily::Remote
    }

    async fn invoke(
        &self,
        query: &str,
        context: &serde_json::Value,
    ) -> Result<EngineReply, EngineError> {
        let body = serde_json::json!({
            "query": query,
            "context": context,
        });

        let mut request = self.http_client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, &body));
        }

        let answer: RemoteAnswer = response.json().await.map_err(|e| {
            EngineError::failed(&self.id, format!("malformed response body: {e}"))
        })?;
        Ok(EngineReply::answer(answer.text, answer.confidence))
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(&self.config.endpoint)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }
}
