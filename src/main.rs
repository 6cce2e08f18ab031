//! # msgdex CLI
//!
//! ## Usage
//!
//! ```bash
//! msgdex --config ./config/msgdex.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `msgdex init` | Create the SQLite database and schema |
//! | `msgdex ingest` | Pull every page from the configured source and index it |
//! | `msgdex search "<query>"` | Ranked, paginated search |
//! | `msgdex get <id>` | Print one stored record and its tokens |
//! | `msgdex stats` | Record, token and posting counts |
//! | `msgdex reindex` | Rebuild the inverted index from stored records |
//! | `msgdex serve` | Start the HTTP server |
//!
//! Diagnostics go to stderr through `tracing`; set `RUST_LOG` to change
//! the level (default `msgdex=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use msgdex::config;
use msgdex::{db, get, index, ingest, migrate, search, server, stats};

#[derive(Parser)]
#[command(
    name = "msgdex",
    about = "Ingest paginated message feeds and serve ranked full-text search",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/msgdex.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it again on an existing database is safe.
    Init,

    /// Ingest every page from the configured source.
    ///
    /// Each run starts from the beginning of the source. Records already
    /// stored with identical content are counted as duplicates.
    Ingest {
        /// Override `[source] url`.
        #[arg(long)]
        source_url: Option<String>,

        /// Override `[source] kind`: `offset`, `cursor` or `jsonl`.
        #[arg(long)]
        kind: Option<String>,
    },

    /// Search stored records.
    Search {
        query: String,

        /// 1-based page number.
        #[arg(long, default_value_t = 1)]
        page: u32,

        /// Results per page. Defaults to `[query] default_limit`.
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Print one record by id.
    Get { id: String },

    /// Show index statistics.
    Stats,

    /// Rebuild the inverted index from stored records.
    ///
    /// Needed after changing `[index] min_token_len`.
    Reindex,

    /// Start the HTTP server on `[server] bind`.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("msgdex=info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { source_url, kind } => {
            ingest::run_ingest(&cfg, source_url, kind).await?;
        }
        Commands::Search { query, page, limit } => {
            search::run_search(&cfg, &query, page, limit).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Reindex => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let index = index::Index::new(pool.clone(), &cfg);
            let count = index.reindex().await?;
            pool.close().await;
            println!("Reindexed {} records.", count);
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
