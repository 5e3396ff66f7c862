//! The six-stage query pipeline.
//!
//! A spawned task drives the stages and pushes [`Event`]s into a bounded
//! channel; the consumer pulls until a terminal event (`final_result`,
//! `final_message`, or `error`). Exactly one terminal event is always sent,
//! whatever happens inside the stages.
//!
//! Stage fatality is narrow: a failed context call degrades to an empty
//! context, a failed per-attribute call drops that attribute, and a failed
//! category call counts as zero accepted categories. Only a failed attribute
//! selection (stage 2) or all attribute calls failing (stage 3) terminate the
//! stream with an error.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::config::{Config, LlmConfig, PipelineConfig, PromptsConfig};
use crate::exclusions::exclusions_for;
use crate::executor::{self, load_prompt, PromptVars};
use crate::llm::{ModelClient, Usage};
use crate::models::{
    group_products, grouped_to_json, normalize_attribute_name, AttributeBlock, Event,
    IntermediateKind, OccasionContext,
};
use crate::ranker::rank_products;

/// Attribute display names and the template file analyzing each.
const ATTRIBUTE_PROMPTS: &[(&str, &str)] = &[
    ("Material", "attribute_material.txt"),
    ("Cor", "attribute_color.txt"),
    ("Estrutura", "attribute_structure.txt"),
    ("Linha", "attribute_line.txt"),
    ("Textura", "attribute_texture.txt"),
    ("Superfície", "attribute_surface.txt"),
    ("Mensagem", "attribute_message.txt"),
];

const CONTEXT_PROMPT: &str = "context_analyzer.txt";
const SELECTION_PROMPT: &str = "attribute_selection.txt";
const CATEGORY_PROMPT: &str = "category_composer.txt";

/// All templates the pipeline needs, loaded once at construction.
struct PromptSet {
    context: String,
    selection: String,
    attributes: HashMap<String, String>,
    category: String,
}

impl PromptSet {
    fn load(config: &PromptsConfig) -> Result<Self> {
        let dir = &config.dir;
        let mut attributes = HashMap::new();
        for (name, file) in ATTRIBUTE_PROMPTS {
            attributes.insert(name.to_string(), load_prompt(&dir.join(file))?);
        }
        Ok(Self {
            context: load_prompt(&dir.join(CONTEXT_PROMPT))?,
            selection: load_prompt(&dir.join(SELECTION_PROMPT))?,
            attributes,
            category: load_prompt(&dir.join(CATEGORY_PROMPT))?,
        })
    }
}

pub struct Pipeline {
    pool: SqlitePool,
    client: Arc<dyn ModelClient>,
    prompts_cfg: PromptsConfig,
    settings: PipelineConfig,
    llm: LlmConfig,
    prompts: PromptSet,
}

impl Pipeline {
    /// Build a pipeline, loading every prompt template from disk up front so
    /// a missing file fails here rather than mid-stream.
    pub fn new(pool: SqlitePool, client: Arc<dyn ModelClient>, config: &Config) -> Result<Self> {
        let prompts = PromptSet::load(&config.prompts)
            .context("Failed to load prompt templates")?;
        Ok(Self {
            pool,
            client,
            prompts_cfg: config.prompts.clone(),
            settings: config.pipeline.clone(),
            llm: config.llm.clone(),
            prompts,
        })
    }

    /// Run the pipeline for one query. The returned receiver yields events
    /// until a terminal one; the driving task owns the pipeline handle.
    pub fn stream(self: Arc<Self>, user_query: String) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            if let Err(err) = self.drive(&user_query, &tx).await {
                tracing::error!(%err, "pipeline failed");
                let _ = tx
                    .send(Event::Error {
                        message: "A consulta falhou por um erro interno.".to_string(),
                    })
                    .await;
            }
        });
        rx
    }

    async fn drive(&self, user_query: &str, tx: &mpsc::Sender<Event>) -> Result<()> {
        let mut usage = Usage::default();
        let mut calls = 0u32;

        // Stage 1: occasion/weather context. Failure degrades to an empty
        // context and the pipeline continues.
        emit(tx, progress("Analisando o contexto da consulta...")).await;
        let vars = PromptVars::new().with("user_query", user_query);
        let (context_value, call_usage) = self
            .execute(&vars, &self.prompts.context, "context_analyzer")
            .await;
        usage.add(call_usage);
        calls += 1;

        let context_value =
            context_value.unwrap_or_else(|| json!({"occasion": {}, "weather": {}}));
        let context = OccasionContext::from_value(&context_value);
        emit(tx, Event::ContextResult { data: context_value.clone() }).await;

        let query_context =
            serde_json::to_string(&context_value).context("context serialization")?;

        // Stage 2: attribute selection. This one is fatal on failure.
        emit(tx, progress("Selecionando os atributos relevantes...")).await;
        let vars = PromptVars::new()
            .with("user_query", user_query)
            .with("query_context", query_context.clone());
        let (selection, call_usage) = self
            .execute(&vars, &self.prompts.selection, "attribute_selection")
            .await;
        usage.add(call_usage);
        calls += 1;

        let selected = selection
            .map(|value| parse_selected_attributes(&value, &self.prompts.attributes))
            .unwrap_or_default();
        if selected.is_empty() {
            emit(
                tx,
                Event::Error {
                    message: "Não foi possível selecionar os atributos da consulta.".to_string(),
                },
            )
            .await;
            return Ok(());
        }
        emit(
            tx,
            Event::IntermediateResult {
                kind: IntermediateKind::Attributes,
                data: json!(selected),
            },
        )
        .await;

        // Stage 3: one detail call per attribute, bounded fan-out, collected
        // in completion order. Failed attributes drop out silently.
        emit(tx, progress("Analisando os atributos selecionados...")).await;
        let semaphore = Arc::new(Semaphore::new(self.settings.workers));
        let mut set: JoinSet<(Option<AttributeBlock>, Usage)> = JoinSet::new();
        for name in &selected {
            let Some(template) = self.prompts.attributes.get(name).cloned() else {
                continue;
            };
            let client = Arc::clone(&self.client);
            let pool = self.pool.clone();
            let prompts_cfg = self.prompts_cfg.clone();
            let temperature = self.llm.temperature;
            let semaphore = Arc::clone(&semaphore);
            let vars = PromptVars::new()
                .with("user_query", user_query)
                .with("query_context", query_context.clone());
            let label = format!("attribute:{name}");
            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (None, Usage::default()),
                };
                let (value, call_usage) = executor::execute(
                    client.as_ref(),
                    &pool,
                    &prompts_cfg,
                    &vars,
                    &template,
                    temperature,
                    &label,
                )
                .await;
                (value.as_ref().and_then(AttributeBlock::from_value), call_usage)
            });
        }

        let mut blocks = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((block, call_usage)) => {
                    usage.add(call_usage);
                    calls += 1;
                    if let Some(block) = block {
                        blocks.push(block);
                    }
                }
                Err(err) => tracing::warn!(%err, "attribute task panicked"),
            }
        }
        if blocks.is_empty() {
            emit(
                tx,
                Event::Error {
                    message: "A análise de atributos falhou para todos os atributos."
                        .to_string(),
                },
            )
            .await;
            return Ok(());
        }

        // Stage 4: exclusion filtering. The unfiltered set stays around so the
        // log can show what the context ruled out.
        emit(tx, progress("Aplicando as regras de exclusão...")).await;
        let rules = exclusions_for(&context.occasion, &context.weather);
        let filtered = apply_exclusions(&blocks, &rules);
        let before: usize = blocks.iter().map(|b| b.values.len()).sum();
        let after: usize = filtered.iter().map(|b| b.values.len()).sum();
        if before != after {
            tracing::debug!(removed = before - after, "exclusion rules filtered values");
        }

        // Stage 5: project the surviving labels and ask for categories.
        emit(tx, progress("Selecionando as categorias...")).await;
        let summary = filtered
            .iter()
            .map(|block| {
                format!(
                    "{}: {}",
                    block.attribute,
                    project_labels(block, self.settings.value_score_threshold).join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let vars = PromptVars::new()
            .with("user_query", user_query)
            .with("query_context", query_context)
            .with("query_attributes", summary);
        let (category_value, call_usage) = self
            .execute(&vars, &self.prompts.category, "category_composer")
            .await;
        usage.add(call_usage);
        calls += 1;

        let accepted = category_value
            .map(|value| parse_categories(&value, self.settings.category_score_threshold))
            .unwrap_or_default();
        // The categories event is emitted even when empty; the terminal
        // decision comes after the stage result
        emit(
            tx,
            Event::IntermediateResult {
                kind: IntermediateKind::Categories,
                data: json!(accepted),
            },
        )
        .await;
        if accepted.is_empty() {
            emit(
                tx,
                Event::FinalMessage {
                    message: "Não encontramos categorias adequadas para a sua consulta. \
                              Tente reformular."
                        .to_string(),
                },
            )
            .await;
            self.log_usage(calls, usage);
            return Ok(());
        }

        // Stage 6: rank per category, then group with dedup and the global cap.
        emit(tx, progress("Buscando os produtos...")).await;
        let mut results = Vec::new();
        for category in &accepted {
            let products = rank_products(
                &self.pool,
                &filtered,
                Some(category),
                self.settings.per_category_limit,
            )
            .await?;
            results.push((category.clone(), products));
        }
        let grouped = group_products(&results, self.settings.max_products);
        emit(tx, Event::FinalResult { data: grouped_to_json(&grouped) }).await;

        self.log_usage(calls, usage);
        Ok(())
    }

    async fn execute(
        &self,
        vars: &PromptVars,
        template: &str,
        context: &str,
    ) -> (Option<Value>, Usage) {
        executor::execute(
            self.client.as_ref(),
            &self.pool,
            &self.prompts_cfg,
            vars,
            template,
            self.llm.temperature,
            context,
        )
        .await
    }

    fn log_usage(&self, calls: u32, usage: Usage) {
        tracing::info!(
            calls,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            cost_usd = usage.cost(&self.llm),
            "pipeline complete"
        );
    }
}

fn progress(message: &str) -> Event {
    Event::Progress {
        message: message.to_string(),
    }
}

async fn emit(tx: &mpsc::Sender<Event>, event: Event) {
    // A dropped receiver just means nobody is listening anymore
    let _ = tx.send(event).await;
}

/// Pull `att_1..att_5` from the selection response, keeping only names with a
/// known analysis template, first occurrence wins.
fn parse_selected_attributes(value: &Value, known: &HashMap<String, String>) -> Vec<String> {
    let mut selected = Vec::new();
    for i in 1..=5 {
        let Some(name) = value.get(format!("att_{i}")).and_then(Value::as_str) else {
            continue;
        };
        let name = name.trim();
        if known.contains_key(name) && !selected.iter().any(|s| s == name) {
            selected.push(name.to_string());
        }
    }
    selected
}

/// Drop excluded value names per attribute and drop blocks left empty. When
/// an attribute has exclusion rules, a value without a name cannot be checked
/// against them and is dropped too; attributes without rules pass through
/// untouched.
fn apply_exclusions(
    blocks: &[AttributeBlock],
    rules: &HashMap<String, std::collections::HashSet<String>>,
) -> Vec<AttributeBlock> {
    let mut filtered = Vec::new();
    for block in blocks {
        let key = normalize_attribute_name(&block.attribute);
        let values: Vec<_> = match rules.get(key) {
            Some(excluded) => block
                .values
                .iter()
                .filter(|v| v.name.as_deref().is_some_and(|n| !excluded.contains(n)))
                .cloned()
                .collect(),
            None => block.values.clone(),
        };
        if !values.is_empty() {
            filtered.push(AttributeBlock {
                attribute: block.attribute.clone(),
                values,
            });
        }
    }
    filtered
}

/// Labels carried into the category prompt: the top value always, the second
/// one only when its score is a JSON integer at or above the threshold.
fn project_labels(block: &AttributeBlock, value_threshold: i64) -> Vec<String> {
    let mut labels = Vec::new();
    if let Some(name) = block.values.first().and_then(|v| v.name.clone()) {
        labels.push(name);
    }
    if let Some(second) = block.values.get(1) {
        let strong = second
            .score
            .as_ref()
            .and_then(Value::as_i64)
            .is_some_and(|score| score >= value_threshold);
        if strong {
            if let Some(name) = second.name.clone() {
                labels.push(name);
            }
        }
    }
    labels
}

/// Pull `cat_1..cat_5` with their scores, keeping categories scoring strictly
/// above the acceptance threshold, first occurrence wins. Scores must be JSON
/// integers; a string or float score rejects the category, same as the
/// secondary-value check in [`project_labels`].
fn parse_categories(value: &Value, threshold: i64) -> Vec<String> {
    let mut accepted = Vec::new();
    for i in 1..=5 {
        let Some(name) = value.get(format!("cat_{i}")).and_then(Value::as_str) else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let Some(score) = value.get(format!("cat_{i}_score")).and_then(Value::as_i64) else {
            continue;
        };
        if score > threshold && !accepted.iter().any(|s| s == name) {
            accepted.push(name.to_string());
        }
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttributeValue;

    fn block(attribute: &str, names: &[(&str, Option<i64>)]) -> AttributeBlock {
        AttributeBlock {
            attribute: attribute.to_string(),
            values: names
                .iter()
                .map(|(name, score)| AttributeValue {
                    id: Some(json!(1)),
                    name: Some(name.to_string()),
                    score: score.map(|s| json!(s)),
                    justification: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_parse_selected_attributes_filters_unknown() {
        let mut known = HashMap::new();
        known.insert("Material".to_string(), String::new());
        known.insert("Cor".to_string(), String::new());
        let value = json!({
            "att_1": "Material",
            "att_2": "Perfume",
            "att_3": "Cor",
            "att_4": "Material"
        });
        assert_eq!(parse_selected_attributes(&value, &known), vec!["Material", "Cor"]);
    }

    #[test]
    fn test_apply_exclusions_drops_values_and_empty_blocks() {
        let blocks = vec![
            block("Material", &[("Couro", Some(9)), ("Algodão", Some(7))]),
            block("Superfície", &[("Brilhante", Some(8))]),
        ];
        let mut rules = HashMap::new();
        rules.insert(
            "Material".to_string(),
            ["Couro".to_string()].into_iter().collect(),
        );
        rules.insert(
            "Superfície".to_string(),
            ["Brilhante".to_string()].into_iter().collect(),
        );

        let filtered = apply_exclusions(&blocks, &rules);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].attribute, "Material");
        assert_eq!(filtered[0].values.len(), 1);
        assert_eq!(filtered[0].values[0].name.as_deref(), Some("Algodão"));
    }

    #[test]
    fn test_apply_exclusions_drops_nameless_values_under_rules() {
        let mut nameless = block("Material", &[("Couro", Some(9))]);
        nameless.values.push(crate::models::AttributeValue {
            id: Some(json!(2)),
            name: None,
            score: Some(json!(8)),
            justification: None,
        });
        let blocks = vec![nameless.clone(), AttributeBlock {
            attribute: "Cor".to_string(),
            values: nameless.values.clone(),
        }];

        let mut rules = HashMap::new();
        rules.insert(
            "Material".to_string(),
            ["Couro".to_string()].into_iter().collect(),
        );

        let filtered = apply_exclusions(&blocks, &rules);
        // Material had rules: Couro excluded, the nameless value unverifiable
        assert_eq!(filtered.len(), 1);
        // Cor had no rules: everything passes through, nameless included
        assert_eq!(filtered[0].attribute, "Cor");
        assert_eq!(filtered[0].values.len(), 2);
    }

    #[test]
    fn test_apply_exclusions_compound_attribute_key() {
        let blocks = vec![block("Linha | Forma", &[("Reta", Some(9))])];
        let mut rules = HashMap::new();
        rules.insert("Linha".to_string(), ["Reta".to_string()].into_iter().collect());
        assert!(apply_exclusions(&blocks, &rules).is_empty());
    }

    #[test]
    fn test_project_labels_second_needs_integer_score() {
        let b = block("Material", &[("Couro", Some(9)), ("Jeans", Some(7))]);
        assert_eq!(project_labels(&b, 7), vec!["Couro", "Jeans"]);

        let b = block("Material", &[("Couro", Some(9)), ("Jeans", Some(6))]);
        assert_eq!(project_labels(&b, 7), vec!["Couro"]);

        // A stringly-typed score does not satisfy the integer check
        let mut b = block("Material", &[("Couro", Some(9)), ("Jeans", None)]);
        b.values[1].score = Some(json!("8"));
        assert_eq!(project_labels(&b, 7), vec!["Couro"]);
    }

    #[test]
    fn test_parse_categories_strict_threshold() {
        let value = json!({
            "cat_1": "Vestidos", "cat_1_score": 9,
            "cat_2": "Saias", "cat_2_score": 6,
            "cat_3": "", "cat_3_score": 10
        });
        assert_eq!(parse_categories(&value, 6), vec!["Vestidos"]);
    }

    #[test]
    fn test_parse_categories_rejects_non_integer_scores() {
        // Stringly-typed and float scores do not count as integer scores
        let value = json!({
            "cat_1": "Vestidos", "cat_1_score": "9",
            "cat_2": "Saias", "cat_2_score": 8.5,
            "cat_3": "Calças", "cat_3_score": 8
        });
        assert_eq!(parse_categories(&value, 6), vec!["Calças"]);
    }

    #[test]
    fn test_parse_categories_missing_score_rejected() {
        let value = json!({"cat_1": "Vestidos"});
        assert!(parse_categories(&value, 6).is_empty());
    }
}
