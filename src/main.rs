use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sift_config::SiftConfig;
use sift_index::paths::index_dir_for;
use sift_index::{
    connect_store, EmbeddingProvider, HttpEmbeddings, Indexer, IndexingService, ManifestStore,
    RelevanceRanker, Searcher, SearchResult, SymbolQuery,
};

#[derive(Parser)]
#[command(name = "sift")]
#[command(about = "Incremental semantic code index", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root to index
    #[arg(long, short = 'C', default_value = ".", global = true)]
    root: PathBuf,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Index files changed since the last run
    Index {
        /// Drop the existing index first
        #[arg(long)]
        full: bool,
    },

    /// Natural-language search over the index
    Search {
        query: String,

        #[arg(long, short = 'n', default_value_t = 10)]
        limit: usize,

        /// Treat the query as code and rank by raw similarity
        #[arg(long)]
        similar: bool,

        #[arg(long)]
        json: bool,
    },

    /// Look up symbols by kind and name pattern
    Symbols {
        /// Regex matched against symbol names
        #[arg(long)]
        pattern: Option<String>,

        /// function, method, class, interface, ...
        #[arg(long)]
        kind: Option<String>,

        #[arg(long)]
        language: Option<String>,

        #[arg(long, short = 'n')]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Print every stored chunk of the given files
    Files {
        #[arg(required = true)]
        paths: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// Show index and reindex state
    Status,

    /// Index, then keep the index current as files change
    Watch,

    /// Remove every stored chunk and manifest entry
    Clear,

    /// Write the effective configuration to .sift.toml
    Init,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("sift=debug,sift_index=debug,sift_config=debug,warn")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sift=info,sift_index=info,warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

struct Project {
    config: SiftConfig,
    indexer: Arc<Indexer>,
    embeddings: Arc<dyn EmbeddingProvider>,
}

impl Project {
    /// Open the project index. With `verify` unset the store's recorded
    /// dimensions are not checked, so a stale index can still be cleared.
    async fn open(root: &Path, verify: bool) -> Result<Self> {
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("Project root {:?} does not exist", root))?;
        let config = SiftConfig::load(&root)?;
        let index_dir = index_dir_for(&root, &config.index_root()?);
        info!("Index for {:?} at {:?}", root, index_dir);

        let store = connect_store(&config, &root, &index_dir, Arc::new(RelevanceRanker::new()))?;
        if verify {
            store.initialize().await?;
        }
        let embeddings: Arc<dyn EmbeddingProvider> =
            Arc::new(HttpEmbeddings::from_config(&config.embeddings));
        let manifest = Arc::new(ManifestStore::new(&index_dir));

        let indexer = Indexer::builder(root, manifest, store, embeddings.clone())
            .config(&config.indexing)
            .build();

        Ok(Self {
            config,
            indexer: Arc::new(indexer),
            embeddings,
        })
    }

    fn searcher(&self) -> Searcher {
        Searcher::new(self.indexer.store().clone(), self.embeddings.clone())
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Init = cli.command {
        let root = std::fs::canonicalize(&cli.root)?;
        let path = SiftConfig::load(&root)?.write_project_file(&root)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    // Clearing must work even when the store no longer opens cleanly
    let rebuild = matches!(cli.command, Commands::Clear | Commands::Index { full: true });
    let project = Project::open(&cli.root, !rebuild).await?;

    match cli.command {
        Commands::Index { full } => {
            if full {
                project.indexer.clear().await?;
            }
            let report = project.indexer.run().await?;
            println!(
                "{} ({}): {} indexed, {} unchanged, {} removed, {} failed, {} chunks in {}ms",
                project.indexer.root().display(),
                report.reason,
                report.outcome.indexed.len(),
                report.outcome.refreshed.len(),
                report.outcome.removed.len(),
                report.outcome.failed.len(),
                report.outcome.chunks,
                report.duration_ms
            );
            for failure in &report.outcome.failed {
                eprintln!("  {}: {}", failure.path, failure.error);
            }
        }
        Commands::Search {
            query,
            limit,
            similar,
            json,
        } => {
            let searcher = project.searcher();
            let results = if similar {
                searcher.similar(&query, limit).await?
            } else {
                searcher.search(&query, limit).await?
            };
            print_results(&results, json)?;
        }
        Commands::Symbols {
            pattern,
            kind,
            language,
            limit,
            json,
        } => {
            let query = SymbolQuery {
                pattern,
                symbol_type: kind,
                language,
                limit,
            };
            let results = project.searcher().symbols(&query).await?;
            print_results(&results, json)?;
        }
        Commands::Files { paths, json } => {
            let results = project.searcher().files(paths.as_slice()).await?;
            print_results(&results, json)?;
        }
        Commands::Status => {
            let status = project.indexer.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Watch => {
            let debounce = Duration::from_millis(project.config.watcher.debounce_ms);
            let service = IndexingService::new(project.indexer.clone(), debounce);
            tokio::select! {
                result = service.run() => result?,
                _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping watcher"),
            }
        }
        Commands::Clear => {
            project.indexer.clear().await?;
            println!("Cleared index for {}", project.indexer.root().display());
        }
        Commands::Init => {}
    }

    Ok(())
}

fn print_results(results: &[SearchResult], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No results");
        return Ok(());
    }
    for result in results {
        let meta = &result.metadata;
        let symbol = match (&meta.symbol_type, &meta.symbol_name) {
            (Some(kind), Some(name)) => format!(" {} {}", kind, name),
            (None, Some(name)) => format!(" {}", name),
            _ => String::new(),
        };
        println!(
            "{}:{}-{}{}  [{:.3} {}]",
            meta.file,
            meta.start_line,
            meta.end_line,
            symbol,
            result.score,
            result.relevance.as_str()
        );
        for line in result.content.lines().take(3) {
            println!("    {}", line);
        }
    }
    Ok(())
}
