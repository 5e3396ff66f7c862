//! # Styletell
//!
//! A fashion-product recommendation engine driven by a six-stage LLM
//! pipeline, a SQLite product catalog, and a filesystem cache keyed by
//! normalized query text.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────┐   ┌──────────┐
//! │  Query   │──▶│  Pipeline                  │──▶│  SQLite   │
//! │  (text)  │   │ context → attrs → filter   │   │ catalog + │
//! └──────────┘   │ → categories → ranking     │   │ taxonomy  │
//!                └────────────┬───────────────┘   └──────────┘
//!                             │ events
//!              ┌──────────────┼──────────────┐
//!              ▼              ▼              ▼
//!         ┌─────────┐   ┌──────────┐   ┌──────────┐
//!         │   CLI   │   │  cache   │   │ prewarm  │
//!         │ (human/ │   │ (query → │   │ (batch)  │
//!         │  NDJSON)│   │  JSON)   │   │          │
//!         └─────────┘   └──────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! styletell init                          # create the catalog schema
//! styletell query "casamento no campo"    # run a recommendation query
//! styletell query "praia à noite" --json  # NDJSON event stream
//! styletell prewarm --limit 10            # precompute manifest queries
//! styletell manifest                      # validate the query manifest
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types and the pipeline event stream |
//! | [`canon`] | Query canonicalization (cache keys) |
//! | [`cache`] | Manifest-backed filesystem cache |
//! | [`llm`] | Model-call trait and OpenAI-compatible client |
//! | [`executor`] | Prompt templating, execution, response parsing |
//! | [`exclusions`] | Occasion/weather exclusion rules |
//! | [`ranker`] | Weighted product ranking over the taxonomy |
//! | [`pipeline`] | The six-stage query pipeline |
//! | [`prewarm`] | Batch cache prewarming with per-row isolation |
//! | [`query`] | The `query` command flow |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod cache;
pub mod canon;
pub mod config;
pub mod db;
pub mod exclusions;
pub mod executor;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod prewarm;
pub mod query;
pub mod ranker;
