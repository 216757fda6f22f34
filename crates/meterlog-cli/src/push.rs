//! Client for posting historian payloads to a running server.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Client errors are final; only overload and server faults are retried.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Single,
    Batch,
}

impl PayloadKind {
    pub fn path(self) -> &'static str {
        match self {
            PayloadKind::Single => "/report-ingest",
            PayloadKind::Batch => "/report-ingest-batch",
        }
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    HttpStatus { status: u16, body: Value },
}

pub struct PushClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    backoff: BackoffPolicy,
}

impl PushClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn endpoint(&self, kind: PayloadKind) -> String {
        format!("{}{}", self.base_url, kind.path())
    }

    pub async fn push(&self, kind: PayloadKind, payload: &Value) -> Result<Value, PushError> {
        let url = self.endpoint(kind);
        let mut attempt = 0;
        loop {
            let mut request = self.client.post(&url).json(payload);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let retry = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.json::<Value>().await.unwrap_or(Value::Null);
                    if status.is_success() {
                        info!(%status, %url, "payload accepted");
                        return Ok(body);
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(PushError::HttpStatus {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    format!("status {status}")
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(err.into());
                    }
                    err.to_string()
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt, ?delay, reason = %retry, "push failed; retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

pub fn read_payload(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading payload {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing payload {}", path.display()))
}
