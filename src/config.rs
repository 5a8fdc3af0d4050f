use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub finder: FinderConfig,
    #[serde(default)]
    pub models: ModelsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            ttl_hours: default_ttl_hours(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 3600)
    }
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("cache")
}
fn default_ttl_hours() -> u64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelsConfig {
    #[serde(default = "default_list_url")]
    pub list_url: String,
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,
    /// Repositories that ship with the base application; never fetched or scanned.
    #[serde(default = "default_core_repos")]
    pub core_repos: Vec<String>,
    /// Case-insensitive substring → repository, consulted when no channel claims a node type.
    #[serde(default = "default_known_nodes")]
    pub known_nodes: BTreeMap<String, String>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            list_url: default_list_url(),
            manifest_file: default_manifest_file(),
            core_repos: default_core_repos(),
            known_nodes: default_known_nodes(),
        }
    }
}

fn default_list_url() -> String {
    "https://raw.githubusercontent.com/ltdrdata/ComfyUI-Manager/main/channels.list.template"
        .to_string()
}
fn default_manifest_file() -> String {
    "extension-node-map.json".to_string()
}
fn default_core_repos() -> Vec<String> {
    vec!["https://github.com/comfyanonymous/ComfyUI".to_string()]
}
fn default_known_nodes() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "rgthree".to_string(),
            "https://github.com/rgthree/rgthree-comfy".to_string(),
        ),
        (
            "crystools".to_string(),
            "https://github.com/crystian/ComfyUI-Crystools".to_string(),
        ),
    ])
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    #[serde(default = "default_fetch_workers")]
    pub fetch: usize,
    #[serde(default = "default_download_workers")]
    pub download: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            fetch: default_fetch_workers(),
            download: default_download_workers(),
        }
    }
}

fn default_fetch_workers() -> usize {
    8
}
fn default_download_workers() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    #[serde(default = "default_module_alias")]
    pub module_alias: String,
    #[serde(default = "default_functions")]
    pub functions: Vec<String>,
    #[serde(default = "default_repos_dir")]
    pub repos_dir: PathBuf,
    #[serde(default = "default_clone_timeout_secs")]
    pub clone_timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            module_alias: default_module_alias(),
            functions: default_functions(),
            repos_dir: default_repos_dir(),
            clone_timeout_secs: default_clone_timeout_secs(),
        }
    }
}

fn default_module_alias() -> String {
    "folder_paths".to_string()
}
fn default_functions() -> Vec<String> {
    vec!["get_filename_list".to_string()]
}
fn default_repos_dir() -> PathBuf {
    PathBuf::from("custom_nodes")
}
fn default_clone_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownloadConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_models_root")]
    pub models_root: PathBuf,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Hosts that challenge automated clients; fetched through a browser session.
    #[serde(default = "default_challenge_hosts")]
    pub challenge_hosts: Vec<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            models_root: default_models_root(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            timeout_secs: default_timeout_secs(),
            challenge_hosts: default_challenge_hosts(),
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_models_root() -> PathBuf {
    PathBuf::from("models")
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_challenge_hosts() -> Vec<String> {
    vec!["civitai.com".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct FinderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_search_url")]
    pub search_url: String,
    #[serde(default = "default_url_cache")]
    pub url_cache: PathBuf,
    /// Politeness delay range between search page loads, in milliseconds.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: [u64; 2],
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            search_url: default_search_url(),
            url_cache: default_url_cache(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_search_url() -> String {
    "https://www.google.com/search".to_string()
}
fn default_url_cache() -> PathBuf {
    PathBuf::from("cache/.model_cache.json")
}
fn default_jitter_ms() -> [u64; 2] {
    [1000, 2000]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModelsConfig {
    /// Explicit model filename → download URL overrides.
    #[serde(default)]
    pub urls: BTreeMap<String, String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load the config file if it exists, otherwise fall back to defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

pub fn validate(config: &Config) -> Result<()> {
    if config.workers.fetch == 0 {
        anyhow::bail!("workers.fetch must be > 0");
    }
    if config.workers.download == 0 {
        anyhow::bail!("workers.download must be > 0");
    }
    // Browser sessions are expensive; the download pool stays below the fetch pool.
    if config.workers.fetch > 1 && config.workers.download >= config.workers.fetch {
        anyhow::bail!(
            "workers.download ({}) must be smaller than workers.fetch ({})",
            config.workers.download,
            config.workers.fetch
        );
    }

    if config.download.max_attempts == 0 {
        anyhow::bail!("download.max_attempts must be >= 1");
    }
    if config.download.timeout_secs == 0 {
        anyhow::bail!("download.timeout_secs must be > 0");
    }

    if config.inference.functions.is_empty() {
        anyhow::bail!("inference.functions must list at least one function name");
    }
    if config.inference.module_alias.trim().is_empty() {
        anyhow::bail!("inference.module_alias must not be empty");
    }

    let [lo, hi] = config.finder.jitter_ms;
    if lo > hi {
        anyhow::bail!("finder.jitter_ms must be [min, max] with min <= max");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.cache.ttl_hours, 24);
        assert_eq!(config.workers.fetch, 8);
        assert_eq!(config.workers.download, 2);
        assert_eq!(config.inference.module_alias, "folder_paths");
        assert_eq!(config.channels.manifest_file, "extension-node-map.json");
        validate(&config).unwrap();
    }

    #[test]
    fn download_pool_must_be_smaller() {
        let config: Config = toml::from_str(
            r#"
[workers]
fetch = 4
download = 4
"#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_zero_attempts() {
        let config: Config = toml::from_str(
            r#"
[download]
max_attempts = 0
"#,
        )
        .unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn parses_model_overrides() {
        let config: Config = toml::from_str(
            r#"
[models.urls]
"sd_xl_base_1.0.safetensors" = "https://example.com/sdxl.safetensors"
"#,
        )
        .unwrap();
        assert_eq!(
            config.models.urls.get("sd_xl_base_1.0.safetensors").unwrap(),
            "https://example.com/sdxl.safetensors"
        );
    }
}
