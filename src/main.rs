//! # Memex CLI (`memex`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `memex init` | Create the SQLite database and run schema migrations |
//! | `memex index [path]` | Index local files (incremental; `--prune` removes deleted files) |
//! | `memex search "<query>"` | Semantic search over indexed chunks |
//! | `memex similar <chunk_id>` | Chunks similar to a given chunk |
//! | `memex ask "<query>"` | Answer a question from your documents, with tool calls |
//! | `memex stats` | Index statistics |
//!
//! ## Examples
//!
//! ```bash
//! memex init --config ./config/memex.toml
//! memex index ~/notes --prune
//! memex search "quarterly budget" --source gmail --limit 5
//! memex ask "when is my dentist appointment?"
//! ```
//!
//! Logging goes to stderr. Use `--verbose` or `RUST_LOG=memex=debug`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use memex::commands;
use memex::config;

/// Memex: index your files, mail, calendar, and documents, then search and
/// ask questions about them.
#[derive(Parser)]
#[command(name = "memex", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/memex.toml")]
    config: PathBuf,

    /// Log debug output to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Index files from a directory.
    ///
    /// Only new or changed files are embedded. Without a path, the
    /// `[loaders.filesystem]` root from the config is used.
    Index {
        /// Directory to index.
        path: Option<PathBuf>,

        /// Remove indexed files that no longer exist.
        #[arg(long)]
        prune: bool,
    },

    /// Search indexed documents.
    Search {
        query: String,

        /// Only return results from one source
        /// (`local_file`, `gmail`, `calendar`, `drive`).
        #[arg(long)]
        source: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum similarity in [0, 1].
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Find chunks similar to a chunk from a previous search.
    Similar {
        chunk_id: String,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Ask a question. Actions such as creating events are confirmed
    /// interactively before they run.
    Ask {
        query: String,

        /// Print the response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics.
    Stats,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "memex=debug,memex_core=debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            memex::migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index { path, prune } => {
            commands::run_index(cfg, path, prune).await?;
        }
        Commands::Search {
            query,
            source,
            limit,
            threshold,
        } => {
            commands::run_search(cfg, &query, source, limit, threshold).await?;
        }
        Commands::Similar { chunk_id, limit } => {
            commands::run_similar(cfg, &chunk_id, limit).await?;
        }
        Commands::Ask { query, json } => {
            commands::run_ask(cfg, &query, json).await?;
        }
        Commands::Stats => {
            memex::stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
