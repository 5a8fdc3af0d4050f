//! Channel registry: which repository provides which node type.
//!
//! A channel list names the known channels. Each channel publishes a
//! manifest (`extension-node-map.json`) mapping repository URLs to the node
//! types they provide:
//!
//! ```json
//! {
//!   "https://github.com/org/repo": [["NodeA", "NodeB"], {"title_aux": "Repo"}]
//! }
//! ```
//!
//! The registry fetches both through the [`CacheLayer`], builds a reverse
//! index from node type to claiming repositories, and answers
//! [`resolve`](ChannelRegistry::resolve) lookups. When several channels
//! claim the same node type for different repositories, the first claim in
//! channel load order wins and the others are reported as a conflict.

use anyhow::{bail, Context, Result};
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::cache::{CacheLayer, CacheOutcome, Fetched};
use crate::config::ChannelsConfig;
use crate::graph::NodeResolver;
use crate::http::HttpFetcher;
use crate::models::ChannelEntry;

/// What the channel source declared its payload to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Structured,
    Delimited,
}

/// A channel-list payload tagged by its declared kind.
#[derive(Debug)]
pub enum ChannelPayload {
    Structured(Value),
    Delimited(String),
}

/// Classify by declared content type only, never by sniffing the body.
pub fn classify(content_type: Option<&str>) -> PayloadKind {
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if essence == "application/json" || essence.ends_with("+json") || essence == "text/json" {
        PayloadKind::Structured
    } else {
        PayloadKind::Delimited
    }
}

/// Decode a payload according to its declared kind.
pub fn decode_payload(content_type: Option<&str>, body: &[u8]) -> Result<ChannelPayload> {
    match classify(content_type) {
        PayloadKind::Structured => {
            let value: Value =
                serde_json::from_slice(body).context("channel list declared JSON but did not parse")?;
            Ok(ChannelPayload::Structured(value))
        }
        PayloadKind::Delimited => Ok(ChannelPayload::Delimited(
            String::from_utf8_lossy(body).into_owned(),
        )),
    }
}

/// Normalize either payload shape into an ordered, name-deduplicated entry list.
pub fn parse_channels(payload: &ChannelPayload) -> Result<Vec<ChannelEntry>> {
    let raw: Vec<(String, String)> = match payload {
        ChannelPayload::Structured(Value::Array(records)) => records
            .iter()
            .filter_map(|record| {
                let name = record.get("name")?.as_str()?;
                let url = record.get("url")?.as_str()?;
                Some((name.to_string(), url.to_string()))
            })
            .collect(),
        ChannelPayload::Structured(Value::Object(map)) => map
            .iter()
            .filter_map(|(name, url)| Some((name.clone(), url.as_str()?.to_string())))
            .collect(),
        ChannelPayload::Structured(other) => {
            bail!("unsupported channel list JSON shape: {}", json_kind(other))
        }
        ChannelPayload::Delimited(text) => text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(split_delimited)
            .collect(),
    };

    let mut entries: Vec<ChannelEntry> = Vec::with_capacity(raw.len());
    for (name, url) in raw {
        let name = name.trim().to_string();
        let url = url.trim().trim_end_matches('/').to_string();
        if name.is_empty() || url.is_empty() || entries.iter().any(|e| e.name == name) {
            continue;
        }
        entries.push(ChannelEntry { name, url });
    }
    Ok(entries)
}

fn split_delimited(line: &str) -> Option<(String, String)> {
    let (name, url) = line.split_once("::").or_else(|| line.split_once(','))?;
    Some((name.to_string(), url.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse a channel manifest into `(repo_url, node_types)` pairs in manifest order.
pub fn parse_manifest(value: &Value) -> Result<Vec<(String, Vec<String>)>> {
    let map = value
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("manifest is a JSON {}, expected object", json_kind(value)))?;

    let mut repos = Vec::with_capacity(map.len());
    for (repo_url, info) in map {
        let nodes = info
            .as_array()
            .and_then(|parts| parts.first())
            .and_then(|first| first.as_array());
        let Some(nodes) = nodes else {
            continue;
        };
        let node_types = nodes
            .iter()
            .filter_map(|n| n.as_str())
            .map(str::to_string)
            .collect();
        repos.push((repo_url.trim_end_matches('/').to_string(), node_types));
    }
    Ok(repos)
}

/// One channel's claim that a repository provides a node type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub repo_url: String,
    pub channel: String,
}

/// Answer to a node-type lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub repo_url: String,
    /// Channel whose claim won, `None` when matched through the known-node table.
    pub channel: Option<String>,
    /// Other repositories that also claimed the node type, in load order.
    pub conflicting: Vec<String>,
}

pub struct ChannelRegistry {
    channels: Vec<ChannelEntry>,
    index: HashMap<String, Vec<Claim>>,
    known_nodes: BTreeMap<String, String>,
    stale: bool,
    warnings: Vec<String>,
}

impl ChannelRegistry {
    /// Build a registry from already-parsed manifests, given in channel load order.
    pub fn from_manifests(
        channels: Vec<ChannelEntry>,
        manifests: Vec<(String, Vec<(String, Vec<String>)>)>,
        known_nodes: BTreeMap<String, String>,
    ) -> Self {
        let mut index: HashMap<String, Vec<Claim>> = HashMap::new();
        for (channel, repos) in manifests {
            for (repo_url, node_types) in repos {
                for node_type in node_types {
                    let claims = index.entry(node_type).or_default();
                    if !claims.iter().any(|c| c.repo_url == repo_url) {
                        claims.push(Claim {
                            repo_url: repo_url.clone(),
                            channel: channel.clone(),
                        });
                    }
                }
            }
        }

        Self {
            channels,
            index,
            known_nodes,
            stale: false,
            warnings: Vec::new(),
        }
    }

    /// Fetch the channel list and every channel manifest, then build the index.
    ///
    /// Fails only when the channel list is unavailable and no cached copy exists.
    pub async fn load(
        config: &ChannelsConfig,
        workers: usize,
        cache: &CacheLayer,
        http: &dyn HttpFetcher,
    ) -> Result<Self> {
        let ttl = cache.default_ttl();
        let mut warnings = Vec::new();
        let mut stale = false;

        let (body, content_type) = match fetch_cached(cache, http, &config.list_url, ttl).await {
            Ok(outcome) => {
                warnings.extend(outcome.write_warning);
                (outcome.body, outcome.content_type)
            }
            Err(err) => match cache.read_any(&config.list_url, &[], None).await {
                Some(entry) => {
                    let msg = format!(
                        "channel list unavailable ({:#}); using cached copy from {}",
                        err, entry.stored_at
                    );
                    tracing::warn!("{}", msg);
                    warnings.push(msg);
                    stale = true;
                    (entry.content, entry.content_type)
                }
                None => {
                    return Err(err.context(format!(
                        "channel source {} is unavailable and no cached copy exists",
                        config.list_url
                    )))
                }
            },
        };

        let payload = decode_payload(content_type.as_deref(), &body)?;
        let channels = parse_channels(&payload)?;
        tracing::info!(count = channels.len(), stale, "loaded channel list");

        let fetched: Vec<(ChannelEntry, Result<(Vec<(String, Vec<String>)>, bool)>)> =
            stream::iter(channels.iter().cloned())
                .map(|channel| async move {
                    let url = format!("{}/{}", channel.url, config.manifest_file);
                    let result = fetch_manifest(cache, http, &url, ttl).await;
                    (channel, result)
                })
                .buffered(workers.max(1))
                .collect()
                .await;

        let mut manifests = Vec::with_capacity(fetched.len());
        for (channel, result) in fetched {
            match result {
                Ok((repos, manifest_stale)) => {
                    if manifest_stale {
                        stale = true;
                        warnings.push(format!(
                            "manifest for channel '{}' served from stale cache",
                            channel.name
                        ));
                    }
                    tracing::debug!(channel = %channel.name, repos = repos.len(), "loaded manifest");
                    manifests.push((channel.name.clone(), repos));
                }
                Err(err) => {
                    let msg = format!("skipping channel '{}': {:#}", channel.name, err);
                    tracing::warn!("{}", msg);
                    warnings.push(msg);
                }
            }
        }

        let mut registry = Self::from_manifests(channels, manifests, config.known_nodes.clone());
        registry.stale = stale;
        registry.warnings = warnings;
        Ok(registry)
    }

    pub fn channels(&self) -> &[ChannelEntry] {
        &self.channels
    }

    /// `true` when any part of the index came from an expired cache entry.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn node_type_count(&self) -> usize {
        self.index.len()
    }

    pub fn claims(&self, node_type: &str) -> &[Claim] {
        self.index.get(node_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Find the repository providing `node_type`, or `None` if no channel knows it.
    pub fn resolve(&self, node_type: &str) -> Option<Resolution> {
        if let Some((first, rest)) = self.claims(node_type).split_first() {
            return Some(Resolution {
                repo_url: first.repo_url.clone(),
                channel: Some(first.channel.clone()),
                conflicting: rest.iter().map(|c| c.repo_url.clone()).collect(),
            });
        }

        let lowered = node_type.to_lowercase();
        for (pattern, repo) in &self.known_nodes {
            if lowered.contains(&pattern.to_lowercase()) {
                tracing::debug!(node_type, pattern = %pattern, "matched node type via known pattern");
                return Some(Resolution {
                    repo_url: repo.clone(),
                    channel: None,
                    conflicting: Vec::new(),
                });
            }
        }

        tracing::debug!(node_type, "no repository found for node type");
        None
    }
}

impl NodeResolver for ChannelRegistry {
    fn resolve(&self, node_type: &str) -> Option<Resolution> {
        ChannelRegistry::resolve(self, node_type)
    }
}

async fn fetch_cached(
    cache: &CacheLayer,
    http: &dyn HttpFetcher,
    url: &str,
    ttl: Duration,
) -> Result<CacheOutcome> {
    cache
        .get_or_fetch(url, &[], None, ttl, || async {
            let response = http.get(url).await?;
            Ok::<_, anyhow::Error>(Fetched::new(response.body, response.content_type))
        })
        .await
}

async fn fetch_manifest(
    cache: &CacheLayer,
    http: &dyn HttpFetcher,
    url: &str,
    ttl: Duration,
) -> Result<(Vec<(String, Vec<String>)>, bool)> {
    let (body, stale) = match fetch_cached(cache, http, url, ttl).await {
        Ok(outcome) => (outcome.body, false),
        Err(err) => match cache.read_any(url, &[], None).await {
            Some(entry) => (entry.content, true),
            None => return Err(err),
        },
    };
    let value: Value = serde_json::from_slice(&body)
        .with_context(|| format!("manifest at {} is not valid JSON", url))?;
    Ok((parse_manifest(&value)?, stale))
}
