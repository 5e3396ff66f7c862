use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Connection pool size for the catalog database.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    /// Serve cached results when the canonical key is in the manifest.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Write a cache envelope after a successful uncached query whose key
    /// appears in the manifest.
    #[serde(default = "default_true")]
    pub record: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            manifest: default_manifest(),
            enabled: true,
            record: true,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/cached_queries_v1")
}
fn default_manifest() -> PathBuf {
    PathBuf::from("data/queries.csv")
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptsConfig {
    #[serde(default = "default_prompt_dir")]
    pub dir: PathBuf,
    /// Table joined against for `entity.field` template placeholders.
    #[serde(default = "default_context_table")]
    pub context_table: String,
    /// Foreign id column shared by the context table and its lookups.
    #[serde(default = "default_context_id")]
    pub context_id: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            dir: default_prompt_dir(),
            context_table: default_context_table(),
            context_id: default_context_id(),
        }
    }
}

fn default_prompt_dir() -> PathBuf {
    PathBuf::from("prompts")
}
fn default_context_table() -> String {
    "brand_profile".to_string()
}
fn default_context_id() -> String {
    "brand_id".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Chat-completions base URL (OpenAI-compatible).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Per-million-token rates used for cost logging.
    #[serde(default)]
    pub cost_per_million_input: f64,
    #[serde(default)]
    pub cost_per_million_output: f64,
}

fn default_base_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}
fn default_temperature() -> f32 {
    0.8
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_api_key_env() -> String {
    "STYLETELL_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Worker pool size for the per-attribute detail stage.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Categories must score strictly above this to be accepted.
    #[serde(default = "default_category_threshold")]
    pub category_score_threshold: i64,
    /// Secondary values must score at least this to reach category selection.
    #[serde(default = "default_value_threshold")]
    pub value_score_threshold: i64,
    /// Products fetched per accepted category.
    #[serde(default = "default_per_category_limit")]
    pub per_category_limit: i64,
    /// Global cap across all categories in the grouped result.
    #[serde(default = "default_max_products")]
    pub max_products: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            category_score_threshold: default_category_threshold(),
            value_score_threshold: default_value_threshold(),
            per_category_limit: default_per_category_limit(),
            max_products: default_max_products(),
        }
    }
}

fn default_workers() -> usize {
    5
}
fn default_category_threshold() -> i64 {
    6
}
fn default_value_threshold() -> i64 {
    7
}
fn default_per_category_limit() -> i64 {
    3
}
fn default_max_products() -> usize {
    15
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.llm.model.trim().is_empty() {
        anyhow::bail!("llm.model must not be empty");
    }

    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be >= 1");
    }

    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be >= 1");
    }

    if config.pipeline.per_category_limit < 1 {
        anyhow::bail!("pipeline.per_category_limit must be >= 1");
    }

    if config.pipeline.max_products == 0 {
        anyhow::bail!("pipeline.max_products must be >= 1");
    }

    if !is_sql_identifier(&config.prompts.context_table) {
        anyhow::bail!(
            "prompts.context_table is not a valid identifier: '{}'",
            config.prompts.context_table
        );
    }
    if !is_sql_identifier(&config.prompts.context_id) {
        anyhow::bail!(
            "prompts.context_id is not a valid identifier: '{}'",
            config.prompts.context_id
        );
    }

    Ok(config)
}

/// Identifiers that may appear in SQL text (everything else is bound).
pub fn is_sql_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().unwrap_or('0').is_ascii_digit()
}
