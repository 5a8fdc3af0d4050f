//! # Workflow Deps CLI (`wfdeps`)
//!
//! Resolves a workflow document into the plugin repositories and model files
//! it depends on, and optionally downloads the models.
//!
//! ## Usage
//!
//! ```bash
//! wfdeps --config ./wfdeps.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `wfdeps resolve <workflow>` | Full resolution report (JSON) |
//! | `wfdeps extract <workflow>` | Node types and model files in a workflow |
//! | `wfdeps channels` | List configured channels |
//! | `wfdeps lookup <node_type>` | Repository providing a node type |
//! | `wfdeps infer <dir>` | Model folders used by a plugin checkout |
//! | `wfdeps cache-path <key>` | On-disk cache path for a key |
//!
//! Reports go to stdout; progress and logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use workflow_deps::config::{self, Config};
use workflow_deps::inference::{infer_dir, InferenceEngine};
use workflow_deps::logging;
use workflow_deps::pipeline::Resolver;
use workflow_deps::progress::ProgressMode;
use workflow_deps::python::PythonParser;
use workflow_deps::workflow;

/// Workflow dependency resolver.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "wfdeps",
    about = "Resolve workflow node types to plugin repositories and model files",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./wfdeps.toml")]
    config: PathBuf,

    /// Progress output on stderr: off, human, json. Defaults to human on a TTY.
    #[arg(long, global = true, value_parser = parse_progress)]
    progress: Option<ProgressMode>,

    /// Increase log verbosity (-v, -vv). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a workflow and print the resolution report.
    Resolve {
        /// Workflow JSON file.
        workflow: PathBuf,

        /// Download located model files into `[download].models_root`.
        #[arg(long)]
        download: bool,

        /// Write the report here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the node types and model files a workflow references.
    Extract {
        workflow: PathBuf,
    },

    /// List channels from the configured channel source.
    Channels,

    /// Show which repository provides a node type.
    Lookup {
        node_type: String,
    },

    /// Infer model folders from a local plugin checkout.
    Infer {
        dir: PathBuf,
    },

    /// Print the cache path for a key.
    CachePath {
        key: String,

        /// Extra key parameter (`KEY=VALUE`), may repeat.
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// File extension for the entry.
        #[arg(long)]
        ext: Option<String>,
    },
}

/// Parse a `key=value` pair for `--param` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    match s {
        "off" | "none" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => Err(format!("unknown progress mode '{}': use off, human, or json", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut cfg = config::load_or_default(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Resolve {
            workflow,
            download,
            output,
        } => {
            if download {
                cfg.download.enabled = true;
            }
            run_resolve(cfg, &workflow, output.as_deref(), progress).await?;
        }
        Commands::Extract { workflow } => run_extract(&workflow)?,
        Commands::Channels => run_channels(cfg).await?,
        Commands::Lookup { node_type } => run_lookup(cfg, &node_type).await?,
        Commands::Infer { dir } => run_infer(&cfg, dir).await?,
        Commands::CachePath { key, params, ext } => {
            let params: Vec<(&str, &str)> = params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            let path = workflow_deps::cache::cache_path(&cfg.cache.root, &key, &params, ext.as_deref());
            println!("{}", path.display());
        }
    }

    Ok(())
}

async fn run_resolve(
    cfg: Config,
    workflow_path: &Path,
    output: Option<&Path>,
    progress: ProgressMode,
) -> Result<()> {
    let document = workflow::load(workflow_path)?;
    let resolver = Resolver::new(cfg)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; letting in-flight downloads finish...");
            on_signal.cancel();
        }
    });

    let sink = progress.sink();
    let report = resolver
        .resolve_workflow(&document, sink.as_ref(), &cancel)
        .await?;
    let json = serde_json::to_string_pretty(&report)?;

    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write report: {}", path.display()))?;
            eprintln!(
                "Report written to {} ({} resolved, {} unresolved, {} warnings)",
                path.display(),
                report.resolved.len(),
                report.unresolved.len(),
                report.warnings.len()
            );
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn run_extract(workflow_path: &Path) -> Result<()> {
    let document = workflow::load(workflow_path)?;
    let nodes = workflow::extract(&document);
    let out = serde_json::json!({
        "node_types": nodes.node_types,
        "models": nodes.models,
        "warnings": nodes.warnings,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn run_channels(cfg: Config) -> Result<()> {
    let resolver = Resolver::new(cfg)?;
    let registry = resolver.load_channels().await?;

    println!("{:<20} URL", "CHANNEL");
    for channel in registry.channels() {
        println!("{:<20} {}", channel.name, channel.url);
    }
    println!();
    println!("{} node types indexed", registry.node_type_count());
    if registry.is_stale() {
        println!("(served from stale cache)");
    }
    for warning in registry.warnings() {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}

async fn run_lookup(cfg: Config, node_type: &str) -> Result<()> {
    let resolver = Resolver::new(cfg)?;
    let registry = resolver.load_channels().await?;
    match registry.resolve(node_type) {
        Some(resolution) => {
            println!("{}", resolution.repo_url);
            if let Some(channel) = &resolution.channel {
                eprintln!("via channel '{}'", channel);
            }
            for other in &resolution.conflicting {
                eprintln!("also claimed by {}", other);
            }
        }
        None => println!("unresolved"),
    }
    Ok(())
}

async fn run_infer(cfg: &Config, dir: PathBuf) -> Result<()> {
    let started = std::time::Instant::now();
    let result = infer_dir(
        Arc::new(InferenceEngine::from_config(&cfg.inference)),
        Arc::new(PythonParser::new()),
        dir,
    )
    .await?;
    let out = serde_json::json!({
        "folders": result.folders,
        "warnings": result.warnings,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    tracing::debug!(elapsed = ?started.elapsed(), "inference finished");
    Ok(())
}
