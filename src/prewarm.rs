//! Batch prewarm: run the pipeline for every manifest row and persist the
//! result as a cache envelope.
//!
//! Unlike the sequential [`crate::cache::prewarm`] primitive, this runner
//! isolates failures per row: one query failing (model down, no categories
//! accepted) is counted and logged, and the run moves on to the next row.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::Value;

use crate::cache::{write_cache, Envelope, QueryRow};
use crate::models::Event;
use crate::pipeline::Pipeline;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrewarmSummary {
    pub total: usize,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Drain one pipeline run down to its final grouped payload. A
/// `final_message` (nothing accepted) or an error event is a failure here,
/// since there is nothing worth caching.
pub async fn fetch_result(pipeline: Arc<Pipeline>, query: String) -> Result<Value> {
    let mut rx = pipeline.stream(query);
    while let Some(event) = rx.recv().await {
        match event {
            Event::FinalResult { data } => return Ok(data),
            Event::FinalMessage { message } => bail!("no categories accepted: {message}"),
            Event::Error { message } => bail!("pipeline error: {message}"),
            _ => {}
        }
    }
    bail!("pipeline stream ended without a terminal event")
}

/// Prewarm the cache for manifest rows with per-row failure isolation.
///
/// Rows whose file already exists are skipped unless `overwrite`; `limit`
/// bounds how many rows are considered. Fetch failures are logged and
/// counted, never fatal; a cache write failure still propagates, since a
/// broken cache directory would fail every remaining row the same way.
pub async fn run<F, Fut>(
    dir: &Path,
    rows: &[QueryRow],
    mut fetch: F,
    overwrite: bool,
    limit: Option<usize>,
) -> Result<PrewarmSummary>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    std::fs::create_dir_all(dir)?;

    let mut summary = PrewarmSummary::default();

    for row in rows {
        if let Some(limit) = limit {
            if summary.total >= limit {
                break;
            }
        }
        summary.total += 1;

        let path = dir.join(&row.filename);
        if path.exists() && !overwrite {
            summary.skipped += 1;
            continue;
        }

        let result = match fetch(row.query_raw.clone()).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(row = row.line_no, query = %row.query_raw, %err, "prewarm row failed");
                summary.failed += 1;
                continue;
            }
        };

        let envelope = Envelope::new(row, "prewarm_from_file", result);
        write_cache(dir, &row.filename, &envelope)?;
        tracing::info!(row = row.line_no, file = %row.filename, "prewarm row written");
        summary.written += 1;
    }

    Ok(summary)
}
