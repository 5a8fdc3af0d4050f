//! Locating download URLs for model files by filename.
//!
//! Lookups hit a small persistent JSON map first. On a miss the finder runs
//! a web search for `huggingface "<filename>"` through a pooled browser
//! session and takes the first Hugging Face result link.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::browser::SessionPool;
use crate::config::FinderConfig;

/// Filename → URL map persisted as a flat JSON object.
pub struct ModelUrlCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl ModelUrlCache {
    /// Load the map from `path`. A missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), "ignoring corrupt model URL cache: {}", err);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn get(&self, filename: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(filename)
            .cloned()
    }

    pub fn put(&self, filename: &str, url: &str) -> Result<()> {
        let snapshot = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.insert(filename.to_string(), url.to_string());
            serde_json::to_vec_pretty(&*entries)?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(&self.path, snapshot)
            .with_context(|| format!("Failed to write model URL cache: {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct ModelFinder {
    pool: Arc<SessionPool>,
    cache: ModelUrlCache,
    search_url: String,
    jitter_ms: (u64, u64),
}

impl ModelFinder {
    pub fn new(pool: Arc<SessionPool>, config: &FinderConfig) -> Self {
        let [lo, hi] = config.jitter_ms;
        Self {
            pool,
            cache: ModelUrlCache::load(&config.url_cache),
            search_url: config.search_url.clone(),
            jitter_ms: (lo.min(hi), lo.max(hi)),
        }
    }

    /// Find a download URL for `filename`. `Ok(None)` means the search ran
    /// but produced no usable link.
    pub async fn find(&self, filename: &str) -> Result<Option<String>> {
        if let Some(url) = self.cache.get(filename) {
            tracing::debug!(filename, "model URL cache hit");
            return Ok(Some(url));
        }

        let query = format!("huggingface \"{}\"", filename);
        let search = Url::parse_with_params(&self.search_url, &[("q", query.as_str())])
            .with_context(|| format!("invalid search URL: {}", self.search_url))?;

        let page = self
            .pool
            .fetch(search.as_str())
            .await
            .with_context(|| format!("search for {} failed", filename))?;
        self.politeness_delay().await;

        let html = String::from_utf8_lossy(&page);
        let found = extract_result_links(&html, &search)
            .into_iter()
            .find(|link| is_huggingface(link))
            .map(|link| normalize_download_url(&link));

        if let Some(url) = &found {
            tracing::info!(filename, url = %url, "located model");
            if let Err(err) = self.cache.put(filename, url) {
                tracing::warn!("{:#}", err);
            }
        }
        Ok(found)
    }

    async fn politeness_delay(&self) {
        use rand::Rng;
        let (lo, hi) = self.jitter_ms;
        let ms = rand::rng().random_range(lo..=hi);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// Targets of `/url?q=` redirect links in a search results page, in page order.
pub fn extract_result_links(html: &str, base: &Url) -> Vec<String> {
    let Ok(re) = Regex::new(r#"href="(/url\?q=[^"]+)""#) else {
        return Vec::new();
    };
    re.captures_iter(html)
        .filter_map(|cap| {
            let href = cap.get(1)?.as_str().replace("&amp;", "&");
            let resolved = base.join(&href).ok()?;
            resolved
                .query_pairs()
                .find(|(k, _)| k == "q")
                .map(|(_, v)| v.into_owned())
        })
        .collect()
}

fn is_huggingface(link: &str) -> bool {
    Url::parse(link)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .is_some_and(|host| host == "huggingface.co" || host.ends_with(".huggingface.co"))
}

/// Turn a Hugging Face file page link into a direct download link.
pub fn normalize_download_url(link: &str) -> String {
    if is_huggingface(link) && link.contains("/blob/") {
        link.replacen("/blob/", "/resolve/", 1)
    } else {
        link.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserDriver, BrowserSession, FingerprintProfile};
    use crate::http::FetchError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const RESULTS: &str = r#"
<a href="/url?q=https://civitai.com/models/1&amp;sa=U">civitai</a>
<a href="/url?q=https://huggingface.co/org/repo/blob/main/model.safetensors&amp;sa=U&amp;ved=x">hf</a>
<a href="/search?q=other">next</a>
"#;

    struct PageSession {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserSession for PageSession {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            assert!(url.contains("huggingface"));
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(RESULTS.as_bytes()))
        }
    }

    struct PageDriver {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserDriver for PageDriver {
        async fn open_session(
            &self,
            _profile: &FingerprintProfile,
        ) -> anyhow::Result<Arc<dyn BrowserSession>> {
            Ok(Arc::new(PageSession {
                hits: Arc::clone(&self.hits),
            }))
        }
    }

    #[test]
    fn extracts_links_in_order() {
        let base = Url::parse("https://www.google.com/search").unwrap();
        let links = extract_result_links(RESULTS, &base);
        assert_eq!(
            links,
            vec![
                "https://civitai.com/models/1".to_string(),
                "https://huggingface.co/org/repo/blob/main/model.safetensors".to_string(),
            ]
        );
    }

    #[test]
    fn normalizes_blob_links() {
        assert_eq!(
            normalize_download_url("https://huggingface.co/o/r/blob/main/x.pt"),
            "https://huggingface.co/o/r/resolve/main/x.pt"
        );
        assert_eq!(
            normalize_download_url("https://example.com/blob/x"),
            "https://example.com/blob/x"
        );
    }

    #[test]
    fn url_cache_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/.model_cache.json");
        let cache = ModelUrlCache::load(&path);
        cache.put("a.pt", "https://h/a.pt").unwrap();

        let reloaded = ModelUrlCache::load(&path);
        assert_eq!(reloaded.get("a.pt").as_deref(), Some("https://h/a.pt"));
        assert_eq!(reloaded.get("b.pt"), None);
    }

    #[tokio::test]
    async fn finds_first_huggingface_link_and_caches_it() {
        let tmp = TempDir::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(SessionPool::new(
            Arc::new(PageDriver {
                hits: Arc::clone(&hits),
            }),
            FingerprintProfile::unremarkable(),
            1,
            Duration::from_secs(5),
        ));
        let config = FinderConfig {
            url_cache: tmp.path().join("urls.json"),
            jitter_ms: [0, 0],
            ..FinderConfig::default()
        };
        let finder = ModelFinder::new(pool, &config);

        for _ in 0..2 {
            let url = finder.find("model.safetensors").await.unwrap();
            assert_eq!(
                url.as_deref(),
                Some("https://huggingface.co/org/repo/resolve/main/model.safetensors")
            );
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
