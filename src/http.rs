//! HTTP transport used by the channel registry and the downloader.
//!
//! [`HttpFetcher`] is the seam: [`ReqwestFetcher`] talks to the network,
//! tests substitute an in-memory implementation. Every request carries a
//! timeout, and the reqwest implementation spaces requests by a small
//! minimum delay so channel hosts are not hammered.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Markers that identify an anti-automation interstitial rather than real content.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-chl",
    "challenge-platform",
    "cf_chl_opt",
    "captcha",
    "Just a moment...",
    "unusual traffic",
];

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// How a failed fetch should be treated by callers that retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network hiccup, timeout, rate limiting, or a server error.
    Transient,
    /// The resource does not exist.
    NotFound,
    /// The host answered with an automation challenge.
    Challenged,
    /// Anything else; retrying will not help.
    Fatal,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("{url} answered with an automation challenge (HTTP {status})")]
    Challenge { url: String, status: u16 },
    #[error("failed to write {path}: {message}")]
    Io { path: String, message: String },
}

impl FetchError {
    pub fn class(&self) -> FailureClass {
        match self {
            FetchError::Timeout { .. } | FetchError::Network { .. } => FailureClass::Transient,
            FetchError::Status { status, .. } => match status {
                404 | 410 => FailureClass::NotFound,
                408 | 425 | 429 => FailureClass::Transient,
                s if *s >= 500 => FailureClass::Transient,
                _ => FailureClass::Fatal,
            },
            FetchError::Challenge { .. } => FailureClass::Challenged,
            FetchError::Io { .. } => FailureClass::Fatal,
        }
    }

    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Network {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }

    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        FetchError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Decide whether a response is a challenge page. Only blocking statuses qualify.
pub fn is_challenge(status: u16, mitigated_header: Option<&str>, body: &[u8]) -> bool {
    if !matches!(status, 403 | 429 | 503) {
        return false;
    }
    if mitigated_header.is_some_and(|v| v.eq_ignore_ascii_case("challenge")) {
        return true;
    }
    let head = &body[..body.len().min(16 * 1024)];
    let text = String::from_utf8_lossy(head);
    CHALLENGE_MARKERS.iter().any(|m| text.contains(m))
}

/// Turn a non-success response into the matching [`FetchError`].
pub fn status_error(url: &str, status: u16, mitigated: Option<&str>, body: &[u8]) -> FetchError {
    if is_challenge(status, mitigated, body) {
        FetchError::Challenge {
            url: url.to_string(),
            status,
        }
    } else {
        FetchError::Status {
            url: url.to_string(),
            status,
        }
    }
}

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// GET `url`. Non-2xx statuses are returned as errors.
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError>;

    /// GET `url` and write the body to `dest`, returning the byte count.
    async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let response = self.get(url).await?;
        tokio::fs::write(dest, &response.body)
            .await
            .map_err(|e| FetchError::io(dest, e))?;
        Ok(response.body.len() as u64)
    }
}

/// Network-backed [`HttpFetcher`].
pub struct ReqwestFetcher {
    client: reqwest::Client,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(concat!("wfdeps/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            min_interval: Duration::from_millis(100),
            last_request: Mutex::new(None),
        })
    }

    /// For large bodies: bounds connect time and each read, not the whole transfer.
    pub fn streaming(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(concat!("wfdeps/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            min_interval: Duration::ZERO,
            last_request: Mutex::new(None),
        })
    }

    async fn rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        self.rate_limit().await;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let mitigated = response
            .headers()
            .get("cf-mitigated")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.unwrap_or_default();
        Err(status_error(url, status.as_u16(), mitigated.as_deref(), &body))
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError> {
        let response = self.send(url).await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }

    async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let response = self.send(url).await?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| FetchError::io(dest, e))?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::from_reqwest(url, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::io(dest, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| FetchError::io(dest, e))?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        let status = |s| FetchError::Status {
            url: "u".into(),
            status: s,
        };
        assert_eq!(status(404).class(), FailureClass::NotFound);
        assert_eq!(status(410).class(), FailureClass::NotFound);
        assert_eq!(status(429).class(), FailureClass::Transient);
        assert_eq!(status(502).class(), FailureClass::Transient);
        assert_eq!(status(401).class(), FailureClass::Fatal);
        assert_eq!(
            FetchError::Timeout { url: "u".into() }.class(),
            FailureClass::Transient
        );
    }

    #[test]
    fn detects_challenge_pages() {
        assert!(is_challenge(403, Some("challenge"), b""));
        assert!(is_challenge(
            503,
            None,
            b"<html><title>Just a moment...</title></html>"
        ));
        assert!(!is_challenge(403, None, b"forbidden"));
        assert!(!is_challenge(200, Some("challenge"), b"cf-chl"));
    }

    #[test]
    fn status_error_picks_challenge() {
        let err = status_error("u", 403, None, b"<div id=\"cf-chl-widget\">");
        assert_eq!(err.class(), FailureClass::Challenged);
        let err = status_error("u", 403, None, b"nope");
        assert_eq!(err.class(), FailureClass::Fatal);
    }
}
