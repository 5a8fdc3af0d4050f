//! # Workflow Deps
//!
//! Resolve a node-graph workflow document into the plugin repositories and
//! model files it needs, then fetch those models.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌───────────┐   ┌────────────┐
//! │ Workflow │──▶│ Channels  │──▶│   Graph   │──▶│ Repo scan  │
//! │ extract  │   │ (cached)  │   │ node→repo │   │ + inference│
//! └──────────┘   └───────────┘   └───────────┘   └─────┬──────┘
//!                                                      │
//!                      ┌──────────────┐   ┌────────────▼──┐
//!                      │  Downloader  │◀──│ Model planning │
//!                      │ http/browser │   │ folder + URL   │
//!                      └──────┬───────┘   └────────────────┘
//!                             ▼
//!                     ResolutionReport
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! wfdeps channels                       # list channels
//! wfdeps lookup "Seed (rgthree)"        # which repo provides a node type
//! wfdeps infer ./custom_nodes/some-pack # folder keys used by a plugin
//! wfdeps resolve workflow.json          # full report on stdout
//! wfdeps resolve workflow.json --download
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`cache`] | Single-flight on-disk cache |
//! | [`http`] | HTTP transport and failure classes |
//! | [`channels`] | Channel list, manifests, node-type index |
//! | [`workflow`] | Node types and model files from a workflow |
//! | [`graph`] | Node type → repository graph |
//! | [`repo_source`] | Repository checkouts and source loading |
//! | [`syntax`] | Language-neutral syntax tree and visitor |
//! | [`python`] | tree-sitter Python front end |
//! | [`inference`] | Model folder inference |
//! | [`browser`] | Fingerprinted browser sessions |
//! | [`finder`] | Model URL search |
//! | [`download`] | Model downloads with retries |
//! | [`pipeline`] | End-to-end resolution job |
//! | [`report`] | Resolution report |
//! | [`progress`] | Progress events and sinks |

pub mod browser;
pub mod cache;
pub mod channels;
pub mod config;
pub mod download;
pub mod finder;
pub mod graph;
pub mod http;
pub mod inference;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod python;
pub mod repo_source;
pub mod report;
pub mod singleflight;
pub mod syntax;
pub mod workflow;
