//! # Styletell CLI (`styletell`)
//!
//! The `styletell` binary is the primary interface to the recommendation
//! engine. It provides commands for database initialization, running
//! recommendation queries, prewarming the query cache, and validating the
//! query manifest.
//!
//! ## Usage
//!
//! ```bash
//! styletell --config ./config/styletell.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `styletell init` | Create the SQLite catalog schema |
//! | `styletell query "<text>"` | Run a recommendation query |
//! | `styletell prewarm` | Precompute cache entries for manifest queries |
//! | `styletell manifest` | Validate and summarize the query manifest |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! styletell init --config ./config/styletell.toml
//!
//! # Run a query, human-readable output
//! styletell query "o que vestir num casamento no campo"
//!
//! # Stream raw pipeline events as NDJSON
//! styletell query "look para praia à noite" --json
//!
//! # Bypass the cache for a fresh run
//! styletell query "festa formal" --no-cache
//!
//! # Prewarm the first 10 manifest rows, overwriting existing entries
//! styletell prewarm --limit 10 --overwrite
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use styletell::llm::OpenAiChatClient;
use styletell::pipeline::Pipeline;
use styletell::{cache, config, db, migrate, prewarm, query};

/// Styletell — fashion-product recommendations from natural-language queries.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/styletell.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "styletell",
    about = "Styletell — fashion-product recommendations from natural-language queries",
    version,
    long_about = "Styletell orchestrates a six-stage LLM pipeline (context analysis, attribute \
    selection and scoring, exclusion filtering, category selection, product ranking) over a \
    SQLite product catalog, with a filesystem cache keyed by normalized query text."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/styletell.toml`. Database, cache, prompt, LLM,
    /// and pipeline settings are read from this file.
    #[arg(long, global = true, default_value = "./config/styletell.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the catalog tables (products,
    /// attributes, products_taxonomy). This command is idempotent — running
    /// it multiple times is safe.
    Init,

    /// Run a recommendation query.
    ///
    /// Canonicalizes the query, serves it from the cache when the manifest
    /// knows it, and otherwise drives the full pipeline, streaming progress
    /// and results to the terminal. A successful result whose query appears
    /// in the manifest is written back to the cache.
    Query {
        /// The natural-language query text.
        text: String,

        /// Emit raw pipeline events as NDJSON instead of human output.
        #[arg(long)]
        json: bool,

        /// Skip both cache lookup and cache write-back.
        #[arg(long)]
        no_cache: bool,
    },

    /// Precompute cache entries for manifest queries.
    ///
    /// Runs the pipeline for each manifest row and stores the result as a
    /// cache envelope. Rows that already have a cache file are skipped, and
    /// a row that fails is logged and counted without stopping the run.
    Prewarm {
        /// Regenerate entries that already exist.
        #[arg(long)]
        overwrite: bool,

        /// Maximum number of manifest rows to process.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Validate and summarize the query manifest.
    ///
    /// Loads the manifest CSV, applying all row validations (filenames,
    /// duplicate canonical keys), and prints the entry count with a short
    /// preview. Exits with an error naming the offending row when the
    /// manifest is invalid.
    Manifest,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Query {
            text,
            json,
            no_cache,
        } => {
            let pool = db::connect(&cfg).await?;
            let client = Arc::new(OpenAiChatClient::from_config(&cfg.llm)?);
            let pipeline = Arc::new(Pipeline::new(pool, client, &cfg)?);
            query::run(&cfg, pipeline, &text, json, no_cache).await?;
        }
        Commands::Prewarm { overwrite, limit } => {
            let pool = db::connect(&cfg).await?;
            let client = Arc::new(OpenAiChatClient::from_config(&cfg.llm)?);
            let pipeline = Arc::new(Pipeline::new(pool, client, &cfg)?);

            let rows = cache::read_rows(&cfg.cache.manifest)?;
            let summary = prewarm::run(
                &cfg.cache.dir,
                &rows,
                |q| prewarm::fetch_result(Arc::clone(&pipeline), q),
                overwrite,
                limit,
            )
            .await?;
            println!(
                "Prewarm finished: {} processed, {} written, {} skipped, {} failed",
                summary.total, summary.written, summary.skipped, summary.failed
            );
        }
        Commands::Manifest => {
            let rows = cache::read_rows(&cfg.cache.manifest)?;
            println!(
                "Manifest OK: {} entries ({})",
                rows.len(),
                cfg.cache.manifest.display()
            );
            for row in rows.iter().take(5) {
                println!("  row {}: '{}' -> {}", row.line_no, row.query_norm, row.filename);
            }
            if rows.len() > 5 {
                println!("  ... and {} more", rows.len() - 5);
            }
        }
    }

    Ok(())
}
