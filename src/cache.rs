//! Deterministic, single-flight on-disk cache for keyed byte payloads.
//!
//! Entries are stored under a human-browsable name derived from the key:
//!
//! ```text
//! <sanitized-key>[_<k>-<v>_<k>-<v>...]_<hash>[.ext]
//! ```
//!
//! The sanitized prefix keeps the directory inspectable; the hash suffix
//! (the first 16 hex digits of the SHA-256 of the unsanitized key) keeps two
//! keys that sanitize to the same prefix apart. Each body file has a sidecar
//! `<name>.meta.json` recording the original key, content type, content hash,
//! and storage time.
//!
//! Freshness is judged from the body file's modification time.

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::singleflight::Singleflight;

const HASH_LEN: usize = 16;
/// Keeps file names under common 255-byte limits with room for extensions.
const MAX_PREFIX: usize = 150;

/// A payload produced by a fetch function.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub body: Bytes,
    pub content_type: Option<String>,
}

impl Fetched {
    pub fn new(body: impl Into<Bytes>, content_type: Option<String>) -> Self {
        Self {
            body: body.into(),
            content_type,
        }
    }
}

/// A cached payload as read back from disk.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub content: Bytes,
    pub content_hash: String,
    pub content_type: Option<String>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    content_type: Option<String>,
    content_hash: String,
    stored_at: DateTime<Utc>,
}

/// Result of [`CacheLayer::get_or_fetch`].
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub body: Bytes,
    pub content_type: Option<String>,
    /// `true` when served from disk without running the fetch.
    pub from_cache: bool,
    /// Set when the fetched value could not be persisted.
    pub write_warning: Option<String>,
}

type FlightResult = std::result::Result<CacheOutcome, Arc<anyhow::Error>>;

/// Compute the on-disk path of a cache entry. Pure function of its inputs.
pub fn cache_path(root: &Path, key: &str, params: &[(&str, &str)], ext: Option<&str>) -> PathBuf {
    root.join(cache_file_name(key, params, ext))
}

/// File name portion of [`cache_path`].
pub fn cache_file_name(key: &str, params: &[(&str, &str)], ext: Option<&str>) -> String {
    let full_key = full_key(key, params);
    let mut prefix = sanitize(&full_key);
    prefix.truncate(MAX_PREFIX);
    let mut name = format!("{}_{}", prefix, key_hash(&full_key));
    if let Some(ext) = ext {
        name.push('.');
        name.push_str(ext.trim_start_matches('.'));
    }
    name
}

fn full_key(key: &str, params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<&(&str, &str)> = params.iter().collect();
    sorted.sort();
    let mut full = key.to_string();
    for (k, v) in sorted {
        full.push('_');
        full.push_str(k);
        full.push('-');
        full.push_str(v);
    }
    full
}

/// Output is always ASCII.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn key_hash(full_key: &str) -> String {
    let digest = Sha256::digest(full_key.as_bytes());
    hex::encode(digest)[..HASH_LEN].to_string()
}

fn content_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

fn meta_path(body_path: &Path) -> PathBuf {
    let mut name = body_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".meta.json");
    body_path.with_file_name(name)
}

/// Disk cache shared by every fetch in a resolution job.
pub struct CacheLayer {
    root: PathBuf,
    default_ttl: Duration,
    flights: Singleflight<FlightResult>,
}

impl CacheLayer {
    pub fn new(root: impl Into<PathBuf>, default_ttl: Duration) -> Self {
        Self {
            root: root.into(),
            default_ttl,
            flights: Singleflight::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn path_for(&self, key: &str, params: &[(&str, &str)], ext: Option<&str>) -> PathBuf {
        cache_path(&self.root, key, params, ext)
    }

    /// Return the cached payload for `key` if younger than `ttl`, otherwise run
    /// `fetch` (once across concurrent callers), persist, and return its result.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        params: &[(&str, &str)],
        ext: Option<&str>,
        ttl: Duration,
        fetch: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fetched>>,
    {
        let path = self.path_for(key, params, ext);
        let flight_key = path.to_string_lossy().to_string();

        let result = self
            .flights
            .run(&flight_key, move || async move {
                if let Some(entry) = self.read_fresh(&path, ttl).await {
                    tracing::debug!(key, "cache hit");
                    return Ok(CacheOutcome {
                        body: entry.content,
                        content_type: entry.content_type,
                        from_cache: true,
                        write_warning: None,
                    });
                }

                tracing::debug!(key, "cache miss");
                let fetched = fetch().await.map_err(Arc::new)?;
                let write_warning = match self.store(&path, key, &fetched).await {
                    Ok(()) => None,
                    Err(err) => {
                        let msg = format!("cache write failed for {}: {:#}", path.display(), err);
                        tracing::warn!("{}", msg);
                        Some(msg)
                    }
                };

                Ok::<_, Arc<anyhow::Error>>(CacheOutcome {
                    body: fetched.body,
                    content_type: fetched.content_type,
                    from_cache: false,
                    write_warning,
                })
            })
            .await;

        result.map_err(|err| anyhow::anyhow!("{:#}", err))
    }

    /// Read an entry regardless of age. Used as a degraded fallback.
    pub async fn read_any(
        &self,
        key: &str,
        params: &[(&str, &str)],
        ext: Option<&str>,
    ) -> Option<CacheEntry> {
        let path = self.path_for(key, params, ext);
        self.read_entry(&path).await
    }

    async fn read_fresh(&self, path: &Path, ttl: Duration) -> Option<CacheEntry> {
        let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        if age >= ttl {
            return None;
        }
        self.read_entry(path).await
    }

    async fn read_entry(&self, path: &Path) -> Option<CacheEntry> {
        let content = match tokio::fs::read(path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), "failed to load cache entry: {}", err);
                }
                return None;
            }
        };

        let meta = tokio::fs::read(meta_path(path))
            .await
            .ok()
            .and_then(|raw| serde_json::from_slice::<EntryMeta>(&raw).ok());

        let (key, content_type, stored_at) = match meta {
            Some(meta) => (meta.key, meta.content_type, meta.stored_at),
            None => {
                let stored_at = tokio::fs::metadata(path)
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(Utc::now);
                (String::new(), None, stored_at)
            }
        };

        Some(CacheEntry {
            key,
            content_hash: content_hash(&content),
            content,
            content_type,
            stored_at,
        })
    }

    async fn store(&self, path: &Path, key: &str, fetched: &Fetched) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create cache directory: {}", parent.display()))?;
        }

        let meta = EntryMeta {
            key: key.to_string(),
            content_type: fetched.content_type.clone(),
            content_hash: content_hash(&fetched.body),
            stored_at: Utc::now(),
        };

        // Body goes through a temp file so a crash never leaves a truncated fresh entry.
        let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);
        tokio::fs::write(&tmp, &fetched.body).await?;
        tokio::fs::write(meta_path(path), serde_json::to_vec_pretty(&meta)?).await?;
        tokio::fs::rename(&tmp, path).await?;

        tracing::debug!(path = %path.display(), "saved cache entry");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn path_is_deterministic() {
        let root = Path::new("/tmp/cache");
        let a = cache_path(root, "https://example.com/a.json", &[("page", "2")], Some("txt"));
        let b = cache_path(root, "https://example.com/a.json", &[("page", "2")], Some("txt"));
        assert_eq!(a, b);
    }

    #[test]
    fn params_are_sorted() {
        let a = cache_file_name("k", &[("b", "2"), ("a", "1")], None);
        let b = cache_file_name("k", &[("a", "1"), ("b", "2")], None);
        assert_eq!(a, b);
        assert!(a.starts_with("k_a-1_b-2_"));
    }

    #[test]
    fn colliding_sanitizations_get_distinct_names() {
        let a = cache_file_name("https://x.y/a?b", &[], None);
        let b = cache_file_name("https://x.y/a&b", &[], None);
        assert_eq!(&a[..a.len() - HASH_LEN], &b[..b.len() - HASH_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn file_name_is_readable() {
        let name = cache_file_name("https://raw.example.com/x.json", &[], Some(".json"));
        assert!(name.starts_with("https___raw_example_com_x_json_"));
        assert!(name.ends_with(".json"));
        assert!(!name.contains(".json.json"));
    }

    #[test]
    fn long_keys_stay_within_name_limits() {
        let base = format!("https://example.com/{}", "segment/".repeat(100));
        let a = cache_file_name(&format!("{}a", base), &[("q", "ü")], Some("json"));
        let b = cache_file_name(&format!("{}b", base), &[("q", "ü")], Some("json"));
        assert!(a.len() <= MAX_PREFIX + 1 + HASH_LEN + ".json".len());
        assert_ne!(a, b);
        assert!(a.starts_with("https___example_com_segment_"));
    }

    #[tokio::test]
    async fn fresh_entry_skips_fetch() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheLayer::new(tmp.path(), Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let out = cache
                .get_or_fetch("key", &[], None, Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Fetched::new("payload", Some("text/plain".into())))
                })
                .await
                .unwrap();
            assert_eq!(&out.body[..], b"payload");
            assert_eq!(out.content_type.as_deref(), Some("text/plain"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheLayer::new(tmp.path(), Duration::ZERO);
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_fetch("key", &[], None, Duration::ZERO, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Fetched::new("x", None))
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.read_any("key", &[], None).await.is_some());
    }

    #[tokio::test]
    async fn concurrent_misses_fetch_once() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(CacheLayer::new(tmp.path(), Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("shared", &[], None, Duration::from_secs(60), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Fetched::new("once", None))
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(&handle.await.unwrap().body[..], b"once");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unwritable_root_still_returns_value() {
        let tmp = TempDir::new().unwrap();
        // A regular file where the cache directory should be.
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let cache = CacheLayer::new(blocker.join("cache"), Duration::from_secs(60));

        let out = cache
            .get_or_fetch("k", &[], None, Duration::from_secs(60), || async {
                Ok(Fetched::new("value", None))
            })
            .await
            .unwrap();
        assert_eq!(&out.body[..], b"value");
        assert!(!out.from_cache);
        assert!(out.write_warning.is_some());
    }

    #[tokio::test]
    async fn fetch_error_is_not_cached() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheLayer::new(tmp.path(), Duration::from_secs(60));
        let err = cache
            .get_or_fetch("k", &[], None, Duration::from_secs(60), || async {
                Err::<Fetched, _>(anyhow::anyhow!("boom"))
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(cache.read_any("k", &[], None).await.is_none());
    }
}
