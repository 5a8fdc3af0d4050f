//! Browser-like sessions for hosts that challenge automated clients.
//!
//! The downloader and the model finder only see the [`BrowserDriver`] and
//! [`BrowserSession`] traits. [`HttpBrowserDriver`] realizes a script-disabled
//! browser as a cookie-keeping HTTP client that presents a fixed
//! [`FingerprintProfile`]; a real automation backend can be slotted in behind
//! the same traits.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::http::{status_error, FailureClass, FetchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorScheme {
    Light,
    Dark,
}

impl ColorScheme {
    fn as_str(&self) -> &'static str {
        match self {
            ColorScheme::Light => "light",
            ColorScheme::Dark => "dark",
        }
    }
}

/// Client-identifying parameters a session presents.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintProfile {
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub device_scale_factor: f32,
    pub is_mobile: bool,
    pub locale: String,
    pub timezone: String,
    pub color_scheme: ColorScheme,
    pub scripts_enabled: bool,
}

impl FingerprintProfile {
    /// A dated desktop client with common settings and scripts off.
    pub fn unremarkable() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows; U; Windows NT 5.1; en-US; rv:1.8.0.12) \
                         Gecko/20070508 Firefox/1.5.0.12"
                .to_string(),
            viewport_width: 1024,
            viewport_height: 768,
            device_scale_factor: 1.0,
            is_mobile: false,
            locale: "en-US".to_string(),
            timezone: "America/Los_Angeles".to_string(),
            color_scheme: ColorScheme::Light,
            scripts_enabled: false,
        }
    }

    /// `Accept-Language` value derived from the locale, e.g. `en-US,en;q=0.9`.
    pub fn accept_language(&self) -> String {
        match self.locale.split_once('-') {
            Some((lang, _)) => format!("{},{};q=0.9", self.locale, lang),
            None => self.locale.clone(),
        }
    }
}

impl Default for FingerprintProfile {
    fn default() -> Self {
        Self::unremarkable()
    }
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;

    /// Write the body of `url` to `dest`. Sessions that can stream override this.
    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let body = self.fetch(url).await?;
        tokio::fs::write(dest, &body)
            .await
            .map_err(|e| FetchError::io(dest, e))?;
        Ok(body.len() as u64)
    }
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_session(
        &self,
        profile: &FingerprintProfile,
    ) -> anyhow::Result<Arc<dyn BrowserSession>>;
}

/// Script-disabled session over reqwest with a persistent cookie jar.
///
/// `timeout` bounds connecting, waiting for response headers and each body
/// read, never a whole transfer, so large model files can stream.
pub struct HttpBrowserDriver {
    timeout: Duration,
}

impl HttpBrowserDriver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn profile_headers(profile: &FingerprintProfile) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_str(&profile.accept_language())?);
    headers.insert(
        "viewport-width",
        HeaderValue::from_str(&profile.viewport_width.to_string())?,
    );
    headers.insert(
        "dpr",
        HeaderValue::from_str(&profile.device_scale_factor.to_string())?,
    );
    headers.insert(
        "sec-ch-prefers-color-scheme",
        HeaderValue::from_static(profile.color_scheme.as_str()),
    );
    headers.insert(
        "sec-ch-ua-mobile",
        HeaderValue::from_static(if profile.is_mobile { "?1" } else { "?0" }),
    );
    Ok(headers)
}

#[async_trait]
impl BrowserDriver for HttpBrowserDriver {
    async fn open_session(
        &self,
        profile: &FingerprintProfile,
    ) -> anyhow::Result<Arc<dyn BrowserSession>> {
        let client = reqwest::Client::builder()
            .user_agent(profile.user_agent.clone())
            .default_headers(profile_headers(profile)?)
            .cookie_store(true)
            .connect_timeout(self.timeout)
            .read_timeout(self.timeout)
            .build()?;
        tracing::debug!(user_agent = %profile.user_agent, "opened browser session");
        Ok(Arc::new(HttpBrowserSession {
            client,
            first_byte: self.timeout,
        }))
    }
}

struct HttpBrowserSession {
    client: reqwest::Client,
    first_byte: Duration,
}

impl HttpBrowserSession {
    async fn send(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let response = tokio::time::timeout(self.first_byte, self.client.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout {
                url: url.to_string(),
            })?
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
impl BrowserSession for HttpBrowserSession {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = self.send(url).await?;
        response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))
    }

    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
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

/// Bounded pool of reusable sessions sharing one profile.
///
/// A session that timed out or hit a challenge is discarded instead of being
/// returned to the pool, so the next fetch starts from a clean session.
/// `timeout` bounds opening a session and whole page fetches; streamed
/// downloads rely on the session's own connect and read limits.
pub struct SessionPool {
    driver: Arc<dyn BrowserDriver>,
    profile: FingerprintProfile,
    idle: Mutex<Vec<Arc<dyn BrowserSession>>>,
    permits: Semaphore,
    timeout: Duration,
}

impl SessionPool {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        profile: FingerprintProfile,
        size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            driver,
            profile,
            idle: Mutex::new(Vec::new()),
            permits: Semaphore::new(size.max(1)),
            timeout,
        }
    }

    pub fn profile(&self) -> &FingerprintProfile {
        &self.profile
    }

    pub fn idle_sessions(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Load a page. The whole fetch is bounded by the pool timeout.
    pub async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let _permit = self.acquire(url).await?;
        let session = self.checkout(url).await?;
        let result = tokio::time::timeout(self.timeout, session.fetch(url))
            .await
            .unwrap_or_else(|_| {
                Err(FetchError::Timeout {
                    url: url.to_string(),
                })
            });
        self.settle(session, url, result)
    }

    /// Stream a (possibly very large) body to `dest`.
    pub async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let _permit = self.acquire(url).await?;
        let session = self.checkout(url).await?;
        let result = session.fetch_to(url, dest).await;
        self.settle(session, url, result)
    }

    async fn acquire(&self, url: &str) -> Result<SemaphorePermit<'_>, FetchError> {
        self.permits.acquire().await.map_err(|_| FetchError::Network {
            url: url.to_string(),
            message: "session pool closed".to_string(),
        })
    }

    /// Return the session to the pool unless it was challenged or stalled.
    fn settle<T>(
        &self,
        session: Arc<dyn BrowserSession>,
        url: &str,
        result: Result<T, FetchError>,
    ) -> Result<T, FetchError> {
        match &result {
            Err(FetchError::Timeout { .. }) => {
                tracing::warn!(url, "browser fetch timed out; discarding session");
            }
            Err(err) if err.class() == FailureClass::Challenged => {}
            _ => self.checkin(session),
        }
        result
    }

    async fn checkout(&self, url: &str) -> Result<Arc<dyn BrowserSession>, FetchError> {
        let reused = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        if let Some(session) = reused {
            return Ok(session);
        }
        let opened = tokio::time::timeout(self.timeout, self.driver.open_session(&self.profile)).await;
        match opened {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(err)) => Err(FetchError::Network {
                url: url.to_string(),
                message: format!("failed to open browser session: {:#}", err),
            }),
            Err(_) => Err(FetchError::Timeout {
                url: url.to_string(),
            }),
        }
    }

    fn checkin(&self, session: Arc<dyn BrowserSession>) {
        self.idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoDriver {
        opened: Arc<AtomicUsize>,
        challenge: bool,
    }

    struct EchoSession {
        challenge: bool,
    }

    #[async_trait]
    impl BrowserSession for EchoSession {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            if self.challenge {
                return Err(FetchError::Challenge {
                    url: url.to_string(),
                    status: 403,
                });
            }
            Ok(Bytes::from(url.to_string()))
        }
    }

    #[async_trait]
    impl BrowserDriver for EchoDriver {
        async fn open_session(
            &self,
            profile: &FingerprintProfile,
        ) -> anyhow::Result<Arc<dyn BrowserSession>> {
            assert!(!profile.scripts_enabled);
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EchoSession {
                challenge: self.challenge,
            }))
        }
    }

    fn pool(challenge: bool) -> (SessionPool, Arc<AtomicUsize>) {
        let opened = Arc::new(AtomicUsize::new(0));
        let driver = Arc::new(EchoDriver {
            opened: Arc::clone(&opened),
            challenge,
        });
        (
            SessionPool::new(driver, FingerprintProfile::unremarkable(), 2, Duration::from_secs(5)),
            opened,
        )
    }

    #[test]
    fn profile_is_fixed_and_unremarkable() {
        let p = FingerprintProfile::unremarkable();
        assert!(p.user_agent.contains("Firefox/1.5.0.12"));
        assert_eq!((p.viewport_width, p.viewport_height), (1024, 768));
        assert_eq!(p.timezone, "America/Los_Angeles");
        assert_eq!(p.accept_language(), "en-US,en;q=0.9");
        assert!(!p.scripts_enabled);
        assert!(profile_headers(&p).is_ok());
    }

    #[tokio::test]
    async fn sessions_are_reused() {
        let (pool, opened) = pool(false);
        for i in 0..3 {
            let body = pool.fetch(&format!("https://h/{}", i)).await.unwrap();
            assert_eq!(body, Bytes::from(format!("https://h/{}", i)));
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_sessions(), 1);
    }

    #[tokio::test]
    async fn challenged_sessions_are_discarded() {
        let (pool, opened) = pool(true);
        for _ in 0..2 {
            let err = pool.fetch("https://h/x").await.unwrap_err();
            assert_eq!(err.class(), FailureClass::Challenged);
        }
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_sessions(), 0);
    }

    struct SlowDriver;

    struct SlowSession;

    #[async_trait]
    impl BrowserSession for SlowSession {
        async fn fetch(&self, _url: &str) -> Result<Bytes, FetchError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Bytes::from_static(b"slow"))
        }
    }

    #[async_trait]
    impl BrowserDriver for SlowDriver {
        async fn open_session(
            &self,
            _profile: &FingerprintProfile,
        ) -> anyhow::Result<Arc<dyn BrowserSession>> {
            Ok(Arc::new(SlowSession))
        }
    }

    #[tokio::test]
    async fn streamed_downloads_outlive_page_timeout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("model.part");
        let pool = SessionPool::new(
            Arc::new(SlowDriver),
            FingerprintProfile::unremarkable(),
            1,
            Duration::from_millis(50),
        );

        let err = pool.fetch("https://h/page").await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
        assert_eq!(pool.idle_sessions(), 0);

        let written = pool.fetch_to("https://h/model", &dest).await.unwrap();
        assert_eq!(written, 4);
        assert_eq!(std::fs::read(&dest).unwrap(), b"slow");
        assert_eq!(pool.idle_sessions(), 1);
    }
}
