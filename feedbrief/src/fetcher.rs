use anyhow::Context;
use chrono::{DateTime, Utc};
use common::FetchConfig;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::retry::{retry_with_hint, RetryError, RetryPolicy};

/// Failure of a single GET attempt.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Error status. The body of the failed response is kept for inspection.
    #[error("HTTP {status} from {url}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("request cancelled")]
    Cancelled,
}

impl FetchError {
    /// 5xx, 429 and transport timeouts/connection failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            FetchError::Transport(e) => e.is_timeout() || e.is_connect(),
            FetchError::Cancelled => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Transport(e) => e.status(),
            FetchError::Cancelled => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            FetchError::Status { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Parse a `Retry-After` value: delay in whole seconds or an HTTP-date.
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn retry_after_from(status: StatusCode, headers: &HeaderMap) -> Option<Duration> {
    if status != StatusCode::TOO_MANY_REQUESTS && status != StatusCode::SERVICE_UNAVAILABLE {
        return None;
    }
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()))
}

/// HTTP GET wrapped in the retry executor with status-aware classification.
#[derive(Clone)]
pub struct ResilientFetcher {
    client: Client,
    policy: RetryPolicy,
}

impl ResilientFetcher {
    pub fn new(config: &FetchConfig, policy: RetryPolicy) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self::with_client(client, policy))
    }

    pub fn with_client(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// GET `url`, retrying transient failures. On success the caller owns the
    /// response and its body stream.
    pub async fn fetch(&self, cancel: &CancellationToken, url: &str) -> Result<Response, RetryError<FetchError>> {
        retry_with_hint(
            cancel,
            &self.policy,
            |attempt| self.get_once(cancel, url, attempt),
            FetchError::is_retryable,
            FetchError::retry_after,
        )
        .await
    }

    /// GET `url` and read the whole body.
    pub async fn fetch_bytes(&self, cancel: &CancellationToken, url: &str) -> anyhow::Result<(HeaderMap, Vec<u8>)> {
        let response = self
            .fetch(cancel, url)
            .await
            .with_context(|| format!("failed to fetch {}", url))?;
        let headers = response.headers().clone();
        let bytes = response.bytes().await.context("failed to read response body")?;
        Ok((headers, bytes.to_vec()))
    }

    /// GET `url` and read at most `max_bytes` of body. A declared
    /// `Content-Length` above the limit is rejected before any body is read.
    pub async fn fetch_limited(
        &self,
        cancel: &CancellationToken,
        url: &str,
        max_bytes: usize,
    ) -> anyhow::Result<(HeaderMap, Vec<u8>)> {
        let mut response = self
            .fetch(cancel, url)
            .await
            .with_context(|| format!("failed to fetch {}", url))?;
        if let Some(len) = response.content_length() {
            if len > max_bytes as u64 {
                anyhow::bail!("{} is too large: {} bytes (limit {})", url, len, max_bytes);
            }
        }
        let headers = response.headers().clone();
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.context("failed to read response body")? {
            if body.len() + chunk.len() > max_bytes {
                anyhow::bail!("{} is too large: more than {} bytes", url, max_bytes);
            }
            body.extend_from_slice(&chunk);
        }
        Ok((headers, body))
    }

    async fn get_once(&self, cancel: &CancellationToken, url: &str, attempt: u32) -> Result<Response, FetchError> {
        debug!(url, attempt, "GET");
        let response = tokio::select! {
            res = self.client.get(url).send() => res?,
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let retry_after = retry_after_from(status, response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
                body,
                retry_after,
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn retry_after_seconds() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("1", now), Some(Duration::from_secs(1)));
        assert_eq!(parse_retry_after(" 120 ", now), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 30).unwrap();
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(30))
        );
        // already passed
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn retry_after_only_for_429_and_503() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(
            retry_after_from(StatusCode::TOO_MANY_REQUESTS, &headers),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            retry_after_from(StatusCode::SERVICE_UNAVAILABLE, &headers),
            Some(Duration::from_secs(7))
        );
        assert_eq!(retry_after_from(StatusCode::BAD_GATEWAY, &headers), None);
    }

    #[test]
    fn status_classification() {
        let status_err = |code: u16| FetchError::Status {
            url: "http://example.test".to_string(),
            status: StatusCode::from_u16(code).unwrap(),
            body: String::new(),
            retry_after: None,
        };
        assert!(status_err(500).is_retryable());
        assert!(status_err(503).is_retryable());
        assert!(status_err(429).is_retryable());
        assert!(!status_err(404).is_retryable());
        assert!(!status_err(401).is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
    }
}
