//! The `query` command: cache lookup, pipeline run, event rendering, cache
//! write-back.
//!
//! Flow: canonicalize the query, consult the manifest-backed cache, and only
//! on a miss drive the pipeline, streaming events to the terminal as they
//! arrive (human-readable by default, NDJSON with `--json`). A successful
//! final result whose canonical key appears in the manifest is written back
//! as a cache envelope.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::Value;

use crate::cache::{read_cached, read_rows, write_cache, Envelope, QueryRow};
use crate::canon::canonicalize;
use crate::config::Config;
use crate::models::{Event, IntermediateKind};
use crate::pipeline::Pipeline;

pub async fn run(
    config: &Config,
    pipeline: Arc<Pipeline>,
    text: &str,
    json_output: bool,
    no_cache: bool,
) -> Result<()> {
    let key = canonicalize(text);
    let cache_active = config.cache.enabled && !no_cache;

    let rows: Vec<QueryRow> = if cache_active && config.cache.manifest.exists() {
        read_rows(&config.cache.manifest)?
    } else {
        Vec::new()
    };
    let index: std::collections::HashMap<String, String> = rows
        .iter()
        .map(|r| (r.query_norm.clone(), r.filename.clone()))
        .collect();

    if cache_active {
        if let Some(result) = read_cached(&config.cache.dir, &key, &index) {
            tracing::info!(%key, "serving cached result");
            let event = Event::FinalResult { data: result };
            print_event(&event, json_output)?;
            return Ok(());
        }
    }

    let mut rx = pipeline.stream(text.to_string());
    let mut failure: Option<String> = None;

    while let Some(event) = rx.recv().await {
        print_event(&event, json_output)?;
        match &event {
            Event::FinalResult { data } => {
                if config.cache.record && !no_cache {
                    record_result(config, &rows, &key, data)?;
                }
            }
            Event::Error { message } => failure = Some(message.clone()),
            _ => {}
        }
        if event.is_terminal() {
            break;
        }
    }

    if let Some(message) = failure {
        bail!("{message}");
    }
    Ok(())
}

/// Write the final payload back to the cache when the canonical key has a
/// manifest row. Queries outside the manifest are simply not recorded.
fn record_result(config: &Config, rows: &[QueryRow], key: &str, data: &Value) -> Result<()> {
    let Some(row) = rows.iter().find(|r| r.query_norm == key) else {
        tracing::debug!(%key, "query not in manifest, result not cached");
        return Ok(());
    };
    let envelope = Envelope::new(row, "pipeline", data.clone());
    let path = write_cache(&config.cache.dir, &row.filename, &envelope)?;
    tracing::info!(path = %path.display(), "result cached");
    Ok(())
}

fn print_event(event: &Event, json_output: bool) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!("{}", render_event(event));
    }
    Ok(())
}

fn render_event(event: &Event) -> String {
    match event {
        Event::Progress { message } => format!("... {message}"),
        Event::ContextResult { data } => format!("Contexto: {data}"),
        Event::IntermediateResult { kind, data } => match kind {
            IntermediateKind::Attributes => format!("Atributos selecionados: {}", render_list(data)),
            IntermediateKind::Categories => format!("Categorias aceitas: {}", render_list(data)),
        },
        Event::FinalResult { data } => render_final(data),
        Event::FinalMessage { message } => message.clone(),
        Event::Error { message } => format!("Erro: {message}"),
    }
}

fn render_list(data: &Value) -> String {
    match data.as_array() {
        Some(items) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(", "),
        None => data.to_string(),
    }
}

/// Human rendering of the grouped category -> products payload.
fn render_final(data: &Value) -> String {
    let Some(groups) = data.as_object() else {
        return data.to_string();
    };
    if groups.is_empty() {
        return "Nenhum produto encontrado.".to_string();
    }

    let mut out = String::new();
    for (category, products) in groups {
        out.push_str(&format!("\n{category}\n"));
        let Some(products) = products.as_array() else {
            continue;
        };
        for product in products {
            let name = product.get("name").and_then(Value::as_str).unwrap_or("?");
            let price = product.get("price").and_then(Value::as_str).unwrap_or("-");
            let score = product
                .get("relevance_score")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            out.push_str(&format!("  - {name} ({price}) [relevância {score}]\n"));
        }
    }
    out.trim_end().to_string()
}
