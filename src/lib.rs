//! # Folder Index
//!
//! A local folder indexing engine. Point it at directories and it keeps a
//! private, incrementally updated semantic index for each one, answering
//! hybrid (semantic + exact-term) chunk searches and whole-document
//! similarity queries against it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ FolderManager│──▶│ Orchestrator │──▶│ FolderStorage│
//! │  lifecycle   │   │ scan+chunk   │   │ SQLite + vec │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │                  ▼                  │
//!        │           ┌──────────────┐          │
//!        └──────────▶│ EmbeddingPool│◀─────────┤
//!                    │ GPU/CPU      │   ┌──────┴───────┐
//!                    └──────────────┘   │ QueryEngine  │
//!                                       └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`manager`] | Folder registration, lifecycle workers, status stream |
//! | [`lifecycle`] | Folder state machine |
//! | [`ingest`] | Incremental indexing runs |
//! | [`fingerprint`] | Per-file change detection |
//! | [`chunk`] | Text chunking |
//! | [`model_registry`] | Model catalog, readiness and downloads |
//! | [`embedding`] | Embedding backends and the shared pool |
//! | [`store`] | Per-folder vector storage |
//! | [`search`] | Hybrid chunk search and document similarity |
//! | [`config`] | TOML configuration |

pub mod cancel;
pub mod catalog;
pub mod chunk;
pub mod config;
pub mod cursor;
pub mod db;
pub mod download;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod get;
pub mod hardware;
pub mod ingest;
pub mod lifecycle;
pub mod manager;
pub mod migrate;
pub mod model_registry;
pub mod models;
pub mod progress;
pub mod scan;
pub mod search;
pub mod store;
pub mod watcher;
