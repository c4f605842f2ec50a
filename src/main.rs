//! # Folder Index CLI (`fidx`)
//!
//! The `fidx` binary runs the folder indexing engine. `fidx serve` keeps
//! every registered folder indexed and watched until interrupted; the other
//! commands register folders, inspect them and query their indexes.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fidx serve` | Index and watch all registered folders |
//! | `fidx add <path>` | Register a folder and index it once |
//! | `fidx remove <path>` | Unregister a folder and delete its index |
//! | `fidx change-model <path> <model>` | Rebuild a folder's index with another model |
//! | `fidx retry <path>` | Run a folder's indexing again, resuming model downloads |
//! | `fidx status` | List registered folders with their row counts |
//! | `fidx models` | List known models and whether they are downloaded |
//! | `fidx search <path>` | Hybrid chunk search |
//! | `fidx find <path> "<query>"` | Whole-document similarity |
//! | `fidx get <path> <doc>` | Print an indexed document |
//!
//! ## Examples
//!
//! ```bash
//! fidx add ~/notes --model all-minilm-l6-v2
//! fidx search ~/notes --concept "state management" --term useState
//! fidx find ~/notes "release checklist" --limit 5
//! fidx serve --progress json
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use folder_index::catalog::Catalog;
use folder_index::config::{self, Config};
use folder_index::embedding::{DefaultBackendFactory, EmbeddingPool};
use folder_index::get::print_document;
use folder_index::manager::{FolderManager, ModelChangeImpact, ModelChangeOutcome};
use folder_index::model_registry::{ModelAvailability, ModelRegistry};
use folder_index::models::FolderSnapshot;
use folder_index::progress::ProgressMode;
use folder_index::search::{ChunkQuery, DocumentQuery, FolderScope, QueryEngine};
use folder_index::store::FolderStorage;

const DEFAULT_CONFIG: &str = "./config/fidx.toml";

/// Folder Index: local semantic indexes for the folders you point it at.
#[derive(Parser)]
#[command(name = "fidx", version, about)]
struct Cli {
    /// Path to the configuration file (TOML). Built-in defaults are used
    /// when the default path does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index and watch every registered folder until interrupted.
    Serve {
        /// Status output on stderr: `human`, `json` or `off`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Register a folder and index it once.
    Add {
        path: PathBuf,

        /// Model id. Defaults to `embedding.default_model`, then to the
        /// best model for this machine.
        #[arg(long)]
        model: Option<String>,
    },

    /// Unregister a folder and delete its index.
    Remove { path: PathBuf },

    /// Rebuild a folder's index with a different model.
    ChangeModel {
        path: PathBuf,
        model: String,

        /// Do not ask for confirmation.
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Run a folder's indexing pass again, resuming an interrupted model
    /// download from where it stopped.
    Retry { path: PathBuf },

    /// List registered folders.
    Status {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List known embedding models.
    Models {
        #[arg(long)]
        json: bool,
    },

    /// Hybrid chunk search: semantic concepts plus exact terms.
    Search {
        path: PathBuf,

        /// Concept to match semantically. Repeatable.
        #[arg(long = "concept")]
        concepts: Vec<String>,

        /// Term that must appear verbatim. Repeatable.
        #[arg(long = "term")]
        terms: Vec<String>,

        #[arg(long)]
        limit: Option<usize>,

        /// Continuation token from a previous page.
        #[arg(long)]
        cursor: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Find whole documents similar to a query.
    Find {
        path: PathBuf,
        query: String,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        cursor: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Print an indexed document, rebuilt from its chunks.
    Get {
        path: PathBuf,

        /// Document path relative to the folder.
        document: String,

        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("folder_index=info,fidx=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG)),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let cfg = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { progress } => {
            let mode = match progress {
                Some(p) => ProgressMode::parse(&p)
                    .with_context(|| format!("unknown progress mode: {}", p))?,
                None => ProgressMode::default_for_tty(),
            };
            run_serve(cfg, mode).await?;
        }
        Commands::Add { path, model } => {
            let manager = FolderManager::new(cfg).await?;
            let result = async {
                let snapshot = manager.add_folder(&path, model.as_deref()).await?;
                println!("Added {} (model {})", snapshot.path.display(), snapshot.model_id);
                let done = manager.wait_for(&snapshot.path, is_settled).await?;
                print_outcome(&done);
                anyhow::Ok(())
            }
            .await;
            manager.shutdown().await;
            result?;
        }
        Commands::Remove { path } => {
            let manager = FolderManager::new(cfg).await?;
            manager.start().await?;
            let result = manager.remove_folder(&path).await;
            manager.shutdown().await;
            let report = result?;
            println!(
                "Removed {}: {} documents, {} chunks, {} vectors deleted",
                report.folder.display(),
                report.removed_rows.documents,
                report.removed_rows.chunks,
                report.removed_rows.chunk_vectors
            );
        }
        Commands::ChangeModel { path, model, yes } => {
            let manager = FolderManager::new(cfg).await?;
            manager.start().await?;
            let result = async {
                let outcome = manager
                    .change_model(&path, &model, |impact| yes || confirm_model_change(impact))
                    .await?;
                match outcome {
                    ModelChangeOutcome::Unchanged => {
                        println!("{} already uses {}", path.display(), model)
                    }
                    ModelChangeOutcome::Declined => println!("Model change cancelled."),
                    ModelChangeOutcome::Applied(snapshot) => {
                        println!("Rebuilding {} with {}", snapshot.path.display(), model);
                        let done = manager.wait_for(&snapshot.path, is_settled).await?;
                        print_outcome(&done);
                    }
                }
                anyhow::Ok(())
            }
            .await;
            manager.shutdown().await;
            result?;
        }
        Commands::Retry { path } => {
            let manager = FolderManager::new(cfg).await?;
            let result = async {
                manager.start().await?;
                let done = manager.wait_for(&path, is_settled).await?;
                print_outcome(&done);
                anyhow::Ok(())
            }
            .await;
            manager.shutdown().await;
            result?;
        }
        Commands::Status { json } => run_status(&cfg, json).await?,
        Commands::Models { json } => run_models(&cfg, json).await?,
        Commands::Search {
            path,
            concepts,
            terms,
            limit,
            cursor,
            json,
        } => {
            let query = ChunkQuery {
                concepts,
                terms,
                limit,
                continuation: cursor,
            };
            let target = QueryTarget::open(&cfg, &path).await?;
            let page = target.engine.search_chunks(&target.scope(), &query).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                if page.items.is_empty() {
                    println!("No results.");
                }
                for (i, hit) in page.items.iter().enumerate() {
                    println!(
                        "{}. [{:.3}] {} (chunk {}, {}..{})",
                        i + 1,
                        hit.score,
                        hit.path,
                        hit.chunk_index,
                        hit.start,
                        hit.end
                    );
                    if !hit.matched_terms.is_empty() {
                        println!("    terms: {}", hit.matched_terms.join(", "));
                    }
                    println!("    {}", snippet(&hit.text, 160));
                }
                print_continuation(page.total, page.continuation.as_deref());
            }
            target.close().await;
        }
        Commands::Find {
            path,
            query,
            limit,
            cursor,
            json,
        } => {
            let query = DocumentQuery {
                query,
                limit,
                continuation: cursor,
            };
            let target = QueryTarget::open(&cfg, &path).await?;
            let page = target.engine.find_documents(&target.scope(), &query).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                if page.items.is_empty() {
                    println!("No results.");
                }
                for (i, hit) in page.items.iter().enumerate() {
                    println!(
                        "{}. [{:.3}] {} ({} chunks)",
                        i + 1,
                        hit.score,
                        hit.path,
                        hit.chunk_count
                    );
                }
                print_continuation(page.total, page.continuation.as_deref());
            }
            target.close().await;
        }
        Commands::Get {
            path,
            document,
            json,
        } => {
            let target = QueryTarget::open(&cfg, &path).await?;
            let doc = folder_index::get::get_document(&target.storage.vectors, &document).await;
            target.close().await;
            let doc = doc?;
            if json {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                print_document(&doc);
            }
        }
    }

    Ok(())
}

async fn run_serve(cfg: Config, mode: ProgressMode) -> anyhow::Result<()> {
    let manager = FolderManager::new(cfg).await?;
    let reporter = mode.reporter();
    let mut events = manager.subscribe();
    let printer = tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match events.recv().await {
                Ok(snapshot) => reporter.report(&snapshot),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let resumed = manager.start().await?;
    if resumed == 0 {
        tracing::warn!("no folders registered; add one with `fidx add <path>`");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    manager.shutdown().await;
    drop(manager);
    let _ = printer.await;
    Ok(())
}

async fn run_status(cfg: &Config, json: bool) -> anyhow::Result<()> {
    let catalog = Catalog::open(&cfg.catalog_path()).await?;
    let entries = catalog.list().await?;
    catalog.close().await;

    let mut rows = Vec::with_capacity(entries.len());
    for entry in entries {
        let storage = FolderStorage::open(&cfg.folders_dir().join(&entry.storage_key)).await?;
        let counts = storage.row_counts().await?;
        storage.vectors.close().await;
        storage.fingerprints.close().await;
        rows.push((entry, counts));
    }

    if json {
        let out: Vec<serde_json::Value> = rows
            .iter()
            .map(|(entry, counts)| {
                serde_json::json!({
                    "path": entry.path,
                    "model_id": entry.model_id,
                    "added_at": entry.added_at,
                    "counts": counts,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No folders registered.");
        return Ok(());
    }
    println!("{:<48} {:<28} {:>10} {:>10}", "FOLDER", "MODEL", "DOCUMENTS", "CHUNKS");
    for (entry, counts) in &rows {
        println!(
            "{:<48} {:<28} {:>10} {:>10}",
            entry.path.display(),
            entry.model_id,
            counts.documents,
            counts.chunks
        );
    }
    Ok(())
}

async fn run_models(cfg: &Config, json: bool) -> anyhow::Result<()> {
    let registry = ModelRegistry::from_config(cfg)?;
    let models = registry.list_models().await;
    let profile = folder_index::hardware::detect().await;
    let recommended = registry.recommend_model(profile).map(|m| m.id.clone());

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "hardware": profile,
                "recommended": recommended,
                "models": models,
            }))?
        );
        return Ok(());
    }

    println!("{:<32} {:>6} {:<8} {:<12}", "MODEL", "DIMS", "BACKEND", "STATUS");
    for status in &models {
        let model = &status.descriptor;
        let availability = match &status.availability {
            ModelAvailability::Absent => "absent".to_string(),
            ModelAvailability::Downloading { percent } => format!("{:.0}%", percent),
            ModelAvailability::Ready => "ready".to_string(),
        };
        let marker = if recommended.as_deref() == Some(model.id.as_str()) {
            "  (recommended)"
        } else {
            ""
        };
        println!(
            "{:<32} {:>6} {:<8} {:<12}{}",
            model.id, model.dims, model.backend, availability, marker
        );
    }
    Ok(())
}

/// A registered folder opened for one-shot queries, without starting its
/// lifecycle worker.
struct QueryTarget {
    folder: PathBuf,
    model_id: String,
    dims: usize,
    storage: FolderStorage,
    pool: Arc<EmbeddingPool>,
    engine: QueryEngine,
}

impl QueryTarget {
    async fn open(cfg: &Config, path: &Path) -> anyhow::Result<Self> {
        let folder = std::fs::canonicalize(path)
            .with_context(|| format!("folder not found: {}", path.display()))?;
        let catalog = Catalog::open(&cfg.catalog_path()).await?;
        let entry = catalog.get(&folder).await?;
        catalog.close().await;
        let Some(entry) = entry else {
            bail!("{} is not registered; add it with `fidx add`", folder.display());
        };

        let registry = Arc::new(ModelRegistry::from_config(cfg)?);
        let dims = registry.get(&entry.model_id)?.dims;
        let factory = Arc::new(DefaultBackendFactory::new(
            registry.clone(),
            cfg.embedding.clone(),
        ));
        let pool = Arc::new(EmbeddingPool::new(registry, factory, &cfg.embedding));
        let storage = FolderStorage::open(&cfg.folders_dir().join(&entry.storage_key)).await?;

        Ok(Self {
            folder,
            model_id: entry.model_id,
            dims,
            storage,
            engine: QueryEngine::new(pool.clone(), cfg.retrieval.clone()),
            pool,
        })
    }

    fn scope(&self) -> FolderScope<'_> {
        FolderScope {
            folder: &self.folder,
            store: &self.storage.vectors,
            model_id: &self.model_id,
            dims: self.dims,
        }
    }

    async fn close(self) {
        self.pool.shutdown().await;
        self.storage.vectors.close().await;
        self.storage.fingerprints.close().await;
    }
}

fn is_settled(snapshot: &FolderSnapshot) -> bool {
    matches!(snapshot.state.as_str(), "active" | "error" | "removed")
}

fn print_outcome(snapshot: &FolderSnapshot) {
    match &snapshot.error {
        Some(err) => eprintln!("Indexing failed ({}): {}", err.kind, err.message),
        None => {
            println!(
                "Indexed {} files ({} failed)",
                snapshot.progress.files_indexed, snapshot.progress.files_failed
            );
            for failed in &snapshot.progress.failed {
                println!("  {}: {}", failed.path, failed.message);
            }
        }
    }
}

fn confirm_model_change(impact: &ModelChangeImpact) -> bool {
    eprintln!(
        "Switching {} from {} to {} deletes {} documents and {} chunks and re-indexes the folder.",
        impact.folder.display(),
        impact.from_model,
        impact.to_model,
        impact.documents,
        impact.chunks
    );
    eprint!("Continue? [y/N] ");
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn print_continuation(total: usize, token: Option<&str>) {
    match token {
        Some(token) => println!("\n{} results; next page: --cursor {}", total, token),
        None => println!("\n{} results", total),
    }
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut)
}
