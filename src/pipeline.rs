//! One resolution job: workflow in, [`ResolutionReport`] out.
//!
//! Stages and their progress ranges:
//!
//! | Stage        | Percent | Work                                         |
//! |--------------|---------|----------------------------------------------|
//! | extracting   | 0       | node types and model files from the workflow |
//! | channels     | 10      | channel list and manifests                   |
//! | resolving    | 25      | dependency graph                             |
//! | fetching     | 40      | repository checkouts                         |
//! | inferring    | 50–70   | static folder inference per repository       |
//! | locating     | 75      | model folders, targets and URLs              |
//! | downloading  | 80–99   | model downloads                              |
//! | complete     | 100     |                                              |

use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::browser::{BrowserDriver, FingerprintProfile, HttpBrowserDriver, SessionPool};
use crate::cache::CacheLayer;
use crate::channels::ChannelRegistry;
use crate::config::Config;
use crate::download::{DownloadPolicy, Downloader};
use crate::finder::ModelFinder;
use crate::graph::{build_graph, DependencyGraph};
use crate::http::{HttpFetcher, ReqwestFetcher};
use crate::inference::{infer_dir, InferenceEngine, RepoInference};
use crate::models::{DownloadTask, FolderMapping, FolderSource, ModelRequirement, NodeType};
use crate::progress::{scaled, ProgressEvent, ProgressSink, Stage};
use crate::python::PythonParser;
use crate::repo_source::{GitRepoFetcher, RepoFetcher};
use crate::report::{DownloadSummary, ResolutionReport};
use crate::syntax::SourceParser;
use crate::workflow;

/// Filename substrings and the folder they suggest, checked in order.
const FOLDER_GUESSES: &[(&str, &str)] = &[
    ("vae", "vae"),
    ("lora", "loras"),
    ("embedding", "embeddings"),
    ("checkpoint", "checkpoints"),
    ("upscale", "upscale_models"),
    ("controlnet", "controlnet"),
    ("clip", "clip"),
    ("hypernetwork", "hypernetworks"),
    ("t2i", "checkpoints"),
    ("sd", "checkpoints"),
];

/// Guess a model folder from its filename.
pub fn guess_folder(filename: &str) -> Option<&'static str> {
    let lowered = filename.to_lowercase();
    FOLDER_GUESSES
        .iter()
        .find(|(pattern, _)| lowered.contains(pattern))
        .map(|(_, folder)| *folder)
}

/// `folder/filename` when both are plain relative names. Absolute parts,
/// drive prefixes and `..` would place the file outside the models root.
pub fn model_target(folder: &str, filename: &str) -> Option<PathBuf> {
    let target = Path::new(folder).join(filename);
    is_contained(&target).then_some(target)
}

/// True when every component of `path` is a normal name.
pub fn is_contained(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Decide folder and relative target path for every model the workflow names.
///
/// An inferred folder of a node that uses the model wins over a guess.
/// Models whose folder or filename would escape the models root get no
/// target and a warning.
pub fn plan_models(
    models: &BTreeMap<String, BTreeSet<NodeType>>,
    folders: &FolderMapping,
    warnings: &mut Vec<String>,
) -> Vec<ModelRequirement> {
    models
        .iter()
        .map(|(filename, needed_by)| {
            let inferred = needed_by
                .iter()
                .filter_map(|t| folders.get(t))
                .flatten()
                .min()
                .cloned();
            let (folder, folder_source) = match inferred {
                Some(folder) => (Some(folder), Some(FolderSource::Inferred)),
                None => match guess_folder(filename) {
                    Some(folder) => (Some(folder.to_string()), Some(FolderSource::Guessed)),
                    None => (None, None),
                },
            };
            let target_path = folder.as_ref().and_then(|f| {
                let target = model_target(f, filename);
                if target.is_none() {
                    warnings.push(format!(
                        "refusing model path {:?} / {:?}: not a plain relative path",
                        f, filename
                    ));
                }
                target
            });
            ModelRequirement {
                filename: filename.clone(),
                needed_by: needed_by.clone(),
                folder,
                folder_source,
                target_path,
                url: None,
            }
        })
        .collect()
}

/// Everything a resolution job needs, built once from [`Config`].
pub struct Resolver {
    config: Config,
    cache: CacheLayer,
    http: Arc<dyn HttpFetcher>,
    download_http: Arc<dyn HttpFetcher>,
    repos: Arc<dyn RepoFetcher>,
    browser: Arc<SessionPool>,
    parser: Arc<dyn SourceParser>,
    engine: Arc<InferenceEngine>,
}

impl Resolver {
    /// Network-backed resolver.
    pub fn new(config: Config) -> Result<Self> {
        let timeout = config.download.timeout();
        let repos = Arc::new(GitRepoFetcher::new(
            config.inference.repos_dir.clone(),
            Duration::from_secs(config.inference.clone_timeout_secs),
        ));
        Ok(Self::assemble(
            config,
            Arc::new(ReqwestFetcher::new(timeout)?),
            Arc::new(ReqwestFetcher::streaming(timeout)?),
            repos,
            Arc::new(HttpBrowserDriver::new(timeout)),
        ))
    }

    /// Resolver over caller-supplied transports.
    pub fn with_components(
        config: Config,
        http: Arc<dyn HttpFetcher>,
        repos: Arc<dyn RepoFetcher>,
        driver: Arc<dyn BrowserDriver>,
    ) -> Self {
        Self::assemble(config, Arc::clone(&http), http, repos, driver)
    }

    fn assemble(
        config: Config,
        http: Arc<dyn HttpFetcher>,
        download_http: Arc<dyn HttpFetcher>,
        repos: Arc<dyn RepoFetcher>,
        driver: Arc<dyn BrowserDriver>,
    ) -> Self {
        let cache = CacheLayer::new(config.cache.root.clone(), config.cache.ttl());
        let browser = Arc::new(SessionPool::new(
            driver,
            FingerprintProfile::unremarkable(),
            config.workers.download,
            config.download.timeout(),
        ));
        let engine = Arc::new(InferenceEngine::from_config(&config.inference));
        Self {
            config,
            cache,
            http,
            download_http,
            repos,
            browser,
            parser: Arc::new(PythonParser::new()),
            engine,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    pub async fn load_channels(&self) -> Result<ChannelRegistry> {
        ChannelRegistry::load(
            &self.config.channels,
            self.config.workers.fetch,
            &self.cache,
            self.http.as_ref(),
        )
        .await
    }

    /// Resolve a workflow document end to end.
    ///
    /// Only an unavailable channel list without a cached copy is an error;
    /// everything else degrades into `report.warnings`.
    pub async fn resolve_workflow(
        &self,
        workflow_json: &Value,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ResolutionReport> {
        sink.report(ProgressEvent::new(Stage::Extracting, 0, "reading workflow"));
        let nodes = workflow::extract(workflow_json);
        let mut warnings = nodes.warnings.clone();

        sink.report(ProgressEvent::new(
            Stage::Channels,
            10,
            format!("loading channels for {} node types", nodes.node_types.len()),
        ));
        let registry = self.load_channels().await?;
        warnings.extend(registry.warnings().iter().cloned());

        sink.report(ProgressEvent::new(Stage::Resolving, 25, "building dependency graph"));
        let graph = build_graph(&nodes.node_types, &registry);

        let folders = self.infer_folders(&graph, sink, &mut warnings).await;

        let mut report = ResolutionReport::from_graph(&graph, &nodes.node_types, &folders);
        report.channels_stale = registry.is_stale();

        sink.report(ProgressEvent::new(
            Stage::Locating,
            75,
            format!("planning {} model files", nodes.models.len()),
        ));
        let mut models = plan_models(&nodes.models, &folders, &mut warnings);
        self.locate_urls(&mut models, &mut warnings).await;

        if self.config.download.enabled {
            if cancel.is_cancelled() {
                warnings.push("job cancelled before downloads started".to_string());
            }
            let tasks = self.download_tasks(&models, &mut warnings);
            let done = self.download(tasks, sink, cancel).await;
            report.downloads = done.iter().map(DownloadSummary::from).collect();
        }

        report.models = models;
        report.warnings = warnings;
        sink.report(ProgressEvent::new(
            Stage::Complete,
            100,
            format!(
                "{} resolved, {} unresolved",
                report.resolved.len(),
                report.unresolved.len()
            ),
        ));
        Ok(report)
    }

    /// Fetch and scan every non-core repository; merge the folders each
    /// repository reports for the node types it provides.
    async fn infer_folders(
        &self,
        graph: &DependencyGraph,
        sink: &dyn ProgressSink,
        warnings: &mut Vec<String>,
    ) -> FolderMapping {
        let urls: Vec<String> = graph
            .external_repos(&self.config.channels.core_repos)
            .map(|r| r.url.clone())
            .collect();
        let total = urls.len();
        sink.report(ProgressEvent::new(
            Stage::Fetching,
            40,
            format!("fetching {} repositories", total),
        ));

        let finished = AtomicUsize::new(0);
        let mut results: Vec<(String, Result<RepoInference>)> = stream::iter(urls)
            .map(|url| {
                let finished = &finished;
                async move {
                    let result = self.scan_repo(&url).await;
                    let n = finished.fetch_add(1, Ordering::SeqCst) + 1;
                    sink.report(ProgressEvent::new(
                        Stage::Inferring,
                        scaled(50, 70, n, total),
                        format!("scanned {} / {} repositories", n, total),
                    ));
                    (url, result)
                }
            })
            .buffer_unordered(self.config.workers.fetch.max(1))
            .collect()
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let mut folders = FolderMapping::new();
        for (url, result) in results {
            match result {
                Ok(inference) => {
                    warnings.extend(
                        inference
                            .warnings
                            .into_iter()
                            .map(|w| format!("{}: {}", url, w)),
                    );
                    for (node_type, keys) in inference.folders {
                        if graph.node_repo.get(&node_type) == Some(&url) {
                            folders.entry(node_type).or_default().extend(keys);
                        }
                    }
                }
                Err(err) => {
                    let msg = format!("inference skipped for {}: {:#}", url, err);
                    tracing::warn!("{}", msg);
                    warnings.push(msg);
                }
            }
        }
        folders
    }

    async fn scan_repo(&self, url: &str) -> Result<RepoInference> {
        let dir = self.repos.fetch(url).await?;
        infer_dir(Arc::clone(&self.engine), Arc::clone(&self.parser), dir).await
    }

    async fn locate_urls(&self, models: &mut [ModelRequirement], warnings: &mut Vec<String>) {
        let finder = (self.config.download.enabled && self.config.finder.enabled)
            .then(|| ModelFinder::new(Arc::clone(&self.browser), &self.config.finder));

        for model in models.iter_mut() {
            if let Some(url) = self.config.models.urls.get(&model.filename) {
                model.url = Some(url.clone());
                continue;
            }
            let Some(finder) = &finder else {
                continue;
            };
            match finder.find(&model.filename).await {
                Ok(found) => model.url = found,
                Err(err) => warnings.push(format!("could not locate {}: {:#}", model.filename, err)),
            }
        }
    }

    fn download_tasks(&self, models: &[ModelRequirement], warnings: &mut Vec<String>) -> Vec<DownloadTask> {
        let root = &self.config.download.models_root;
        models
            .iter()
            .filter_map(|model| match (&model.url, &model.target_path) {
                (Some(url), Some(target)) => Some(DownloadTask::new(url.clone(), root.join(target))),
                (None, _) => {
                    warnings.push(format!("no download URL for {}", model.filename));
                    None
                }
                (Some(_), None) => {
                    warnings.push(format!("no target folder for {}", model.filename));
                    None
                }
            })
            .collect()
    }

    async fn download(
        &self,
        tasks: Vec<DownloadTask>,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Vec<DownloadTask> {
        let total = tasks.len();
        sink.report(ProgressEvent::new(
            Stage::Downloading,
            80,
            format!("downloading {} models", total),
        ));
        let downloader = Downloader::new(
            Arc::clone(&self.download_http),
            Arc::clone(&self.browser),
            self.config.download.models_root.clone(),
            DownloadPolicy::from_config(&self.config.download),
            self.config.workers.download,
        );
        let finished = AtomicUsize::new(0);
        let on_done = |task: &DownloadTask| {
            let n = finished.fetch_add(1, Ordering::SeqCst) + 1;
            sink.report(ProgressEvent::new(
                Stage::Downloading,
                scaled(80, 99, n, total),
                format!("{} / {}  {}", n, total, task.target_path.display()),
            ));
        };
        downloader.run_all(tasks, cancel, &on_done).await
    }
}
