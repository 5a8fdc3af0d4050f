//! Model file acquisition with bounded retries.
//!
//! Each model becomes a [`DownloadTask`] that moves through
//! `Pending → InFlight → Completed | Failed(..)`. Terminal states are never
//! left; an illegal transition returns [`TransitionError`] and leaves the
//! task untouched.
//!
//! Retry strategy:
//! - network errors, timeouts, 429 and 5xx → retry with exponential backoff
//! - 404 / 410 and other client errors → fail immediately
//! - a challenge on a direct fetch → switch to a browser session for the
//!   remaining attempts
//! - a challenge through the browser session → retry, then fail with
//!   `manual_download` set
//!
//! Bodies are written to `<models_root>/.staging/<key>.part`, where the key is
//! derived from the whole relative target path, and renamed into place only
//! once complete. Targets outside `models_root` are refused.

use futures_util::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::browser::SessionPool;
use crate::cache::cache_file_name;
use crate::config::DownloadConfig;
use crate::http::{FailureClass, FetchError, HttpFetcher};
use crate::models::{DownloadStatus, DownloadTask, FailureKind};
use crate::pipeline::is_contained;

const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal download transition from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: DownloadStatus,
    pub to: DownloadStatus,
}

impl DownloadTask {
    fn transition(&mut self, to: DownloadStatus) -> Result<(), TransitionError> {
        let allowed = match (self.status, to) {
            (DownloadStatus::Pending, DownloadStatus::InFlight) => true,
            (DownloadStatus::Failed(FailureKind::Retryable), DownloadStatus::InFlight) => true,
            (DownloadStatus::InFlight, DownloadStatus::Completed) => true,
            (DownloadStatus::InFlight, DownloadStatus::Failed(_)) => true,
            // Already present on disk; nothing to fetch.
            (DownloadStatus::Pending, DownloadStatus::Completed) => true,
            // Refused before any attempt.
            (DownloadStatus::Pending, DownloadStatus::Failed(FailureKind::Fatal)) => true,
            _ => false,
        };
        if !allowed {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Begin an attempt. Counts toward the attempt budget.
    pub fn start_attempt(&mut self) -> Result<(), TransitionError> {
        self.transition(DownloadStatus::InFlight)?;
        self.attempt_count += 1;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(DownloadStatus::Completed)?;
        self.last_error = None;
        Ok(())
    }

    pub fn fail(&mut self, kind: FailureKind, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(DownloadStatus::Failed(kind))?;
        self.last_error = Some(error.into());
        Ok(())
    }
}

/// Download behavior shared by every task in a job.
#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub challenge_hosts: Vec<String>,
}

impl DownloadPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            challenge_hosts: config.challenge_hosts.clone(),
        }
    }

    /// Delay before attempt `attempt + 1`: backoff, 2×backoff, 4×backoff, ...
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(10);
        self.backoff.checked_mul(factor).unwrap_or(self.backoff)
    }

    pub fn is_challenge_host(&self, url: &str) -> bool {
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)) else {
            return false;
        };
        self.challenge_hosts
            .iter()
            .any(|h| host == *h || host.ends_with(&format!(".{}", h)))
    }
}

pub struct Downloader {
    http: Arc<dyn HttpFetcher>,
    browser: Arc<SessionPool>,
    models_root: PathBuf,
    policy: DownloadPolicy,
    workers: usize,
}

impl Downloader {
    pub fn new(
        http: Arc<dyn HttpFetcher>,
        browser: Arc<SessionPool>,
        models_root: impl Into<PathBuf>,
        policy: DownloadPolicy,
        workers: usize,
    ) -> Self {
        Self {
            http,
            browser,
            models_root: models_root.into(),
            policy,
            workers: workers.max(1),
        }
    }

    /// Run every task, at most `workers` at a time, and return them in input order.
    ///
    /// Once `cancel` fires no further task is started; tasks already in flight
    /// run to a terminal state and the rest stay `Pending`.
    pub async fn run_all(
        &self,
        tasks: Vec<DownloadTask>,
        cancel: &CancellationToken,
        on_done: &(dyn Fn(&DownloadTask) + Send + Sync),
    ) -> Vec<DownloadTask> {
        let permits = Semaphore::new(self.workers);
        let runs = tasks.into_iter().map(|task| {
            let permits = &permits;
            async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return task,
                    permit = permits.acquire() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return task,
                    },
                };
                if cancel.is_cancelled() {
                    return task;
                }
                let done = self.run_task(task).await;
                on_done(&done);
                done
            }
        });
        join_all(runs).await
    }

    /// Drive one task to a terminal state.
    pub async fn run_task(&self, mut task: DownloadTask) -> DownloadTask {
        if task.status.is_terminal() {
            return task;
        }
        let Some(staging) = self.staging_path(&task.target_path) else {
            let msg = format!(
                "target {} is outside {}",
                task.target_path.display(),
                self.models_root.display()
            );
            tracing::warn!(url = %task.source_url, "refusing download: {}", msg);
            log_transition(task.fail(FailureKind::Fatal, msg));
            return task;
        };
        if task.target_path.is_file() {
            tracing::info!(target = %task.target_path.display(), "model already present");
            log_transition(task.complete());
            return task;
        }
        let mut use_browser = self.policy.is_challenge_host(&task.source_url);

        loop {
            if let Err(err) = task.start_attempt() {
                log_transition(Err(err));
                return task;
            }
            let attempt = task.attempt_count;
            tracing::debug!(url = %task.source_url, attempt, browser = use_browser, "download attempt");

            let result = match self.fetch_to(&task.source_url, &staging, use_browser).await {
                Ok(bytes) => self.commit(&staging, &task.target_path).await.map(|_| bytes),
                Err(err) => Err(err),
            };

            let err = match result {
                Ok(bytes) => {
                    tracing::info!(url = %task.source_url, bytes, "download complete");
                    log_transition(task.complete());
                    return task;
                }
                Err(err) => err,
            };
            let _ = tokio::fs::remove_file(&staging).await;

            let exhausted = attempt >= self.policy.max_attempts;
            let kind = match err.class() {
                FailureClass::Transient if !exhausted => FailureKind::Retryable,
                FailureClass::Challenged => {
                    if !use_browser {
                        tracing::warn!(url = %task.source_url, "challenged; escalating to browser session");
                        use_browser = true;
                    }
                    if exhausted {
                        task.manual_download = true;
                        FailureKind::Fatal
                    } else {
                        FailureKind::Retryable
                    }
                }
                _ => FailureKind::Fatal,
            };

            log_transition(task.fail(kind, err.to_string()));
            if kind == FailureKind::Fatal {
                tracing::warn!(url = %task.source_url, attempts = attempt, "download failed: {}", err);
                return task;
            }

            let delay = self.policy.backoff_delay(attempt);
            tracing::debug!(url = %task.source_url, ?delay, "retrying after error: {}", err);
            tokio::time::sleep(delay).await;
        }
    }

    /// Staging file for `target`, or `None` when `target` escapes `models_root`.
    fn staging_path(&self, target: &Path) -> Option<PathBuf> {
        let relative = target.strip_prefix(&self.models_root).ok()?;
        if !is_contained(relative) {
            return None;
        }
        let key = cache_file_name(&relative.to_string_lossy(), &[], Some("part"));
        Some(self.models_root.join(STAGING_DIR).join(key))
    }

    async fn fetch_to(&self, url: &str, staging: &Path, use_browser: bool) -> Result<u64, FetchError> {
        if let Some(parent) = staging.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::io(parent, e))?;
        }
        if use_browser {
            self.browser.fetch_to(url, staging).await
        } else {
            self.http.download_to(url, staging).await
        }
    }

    async fn commit(&self, staging: &Path, target: &Path) -> Result<(), FetchError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::io(parent, e))?;
        }
        tokio::fs::rename(staging, target)
            .await
            .map_err(|e| FetchError::io(target, e))
    }
}

fn log_transition(outcome: Result<(), TransitionError>) {
    if let Err(err) = outcome {
        tracing::error!("{}", err);
    }
}
