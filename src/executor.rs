//! Prompt execution: placeholder resolution, the model call, and response
//! parsing.
//!
//! Every failure mode here — a failed model call, an unresolvable template,
//! an unparseable response — collapses to a `None` result. The caller decides
//! whether that is fatal; this layer only logs.

use regex::Regex;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

use crate::config::{is_sql_identifier, PromptsConfig};
use crate::llm::{ChatMessage, ModelClient, Usage};

const SYSTEM_MESSAGE: &str = "You are a fashion expert with knowledge in AI and semiotics.";

/// Typed key-value set for template substitution. Placeholders in a template
/// form its required-key set; rendering validates coverage before formatting.
#[derive(Debug, Clone, Default)]
pub struct PromptVars {
    values: BTreeMap<String, String>,
}

impl PromptVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unresolved placeholders in prompt template: {0:?}")]
    MissingKeys(Vec<String>),
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_.]+)\}").expect("placeholder regex"))
}

/// List the placeholder names appearing in a template, in order of first use.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for cap in placeholder_re().captures_iter(template) {
        let name = cap[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Substitute plain placeholders from `vars`. The template's placeholders are
/// its required-key set: any left unresolved is a typed error (missing keys
/// are logged first, so the log shows what the caller forgot).
pub fn render(template: &str, vars: &PromptVars) -> Result<String, TemplateError> {
    let names = placeholders(template);
    let missing: Vec<String> = names
        .iter()
        .filter(|n| vars.get(n).is_none())
        .cloned()
        .collect();
    if !missing.is_empty() {
        tracing::warn!(?missing, "missing keys for prompt template");
        return Err(TemplateError::MissingKeys(missing));
    }

    let mut rendered = template.to_string();
    for name in &names {
        if let Some(value) = vars.get(name) {
            rendered = rendered.replace(&format!("{{{name}}}"), value);
        }
    }
    Ok(rendered)
}

/// Resolve `entity.field` placeholders against the relational store before
/// general substitution: each becomes the first value of `field` joined from
/// `entity` through the configured context table on its fixed foreign id.
/// Identifiers are validated before they enter SQL text; all other values are
/// bound.
pub async fn resolve_entity_params(
    pool: &SqlitePool,
    prompts: &PromptsConfig,
    template: &str,
) -> anyhow::Result<String> {
    let mut resolved = template.to_string();

    for name in placeholders(template) {
        let Some((table, column)) = name.split_once('.') else {
            continue;
        };
        if !is_sql_identifier(table) || !is_sql_identifier(column) {
            anyhow::bail!("invalid entity placeholder '{{{name}}}'");
        }

        let sql = format!(
            "SELECT {table}.{column} FROM {ctx} JOIN {table} ON {ctx}.{id} = {table}.{id} LIMIT 1",
            ctx = prompts.context_table,
            id = prompts.context_id,
        );
        let value: Option<String> = sqlx::query_scalar(&sql).fetch_optional(pool).await?;
        resolved = resolved.replace(&format!("{{{name}}}"), &value.unwrap_or_default());
    }

    Ok(resolved)
}

fn control_char_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\x00-\x1f\x7f]|[\u{0080}-\u{009f}]").expect("control char regex"))
}

fn bare_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+):").expect("bare key regex"))
}

fn backslash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\(.)").expect("backslash regex"))
}

/// Extract the outermost `{...}` span from cleaned response text.
fn extract_json(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&content[start..=end])
}

/// Parse a model response into structured data.
///
/// A CSV-shaped response (delimiter or `csv` marker in the first line) passes
/// through as raw text. Otherwise: strip markdown fences, drop control
/// characters, normalize curly quotes, extract the outermost JSON object, and
/// parse strictly. On failure, one bounded repair pass (quote bare keys,
/// strip spurious backslash escapes) and a final strict parse. Anything still
/// unparseable returns `None` and logs the raw content with its context.
pub fn parse_response(content: &str, context: &str) -> Option<Value> {
    let first_line = content.lines().next().unwrap_or("");
    if first_line.contains(';') || first_line.contains(',') || first_line.contains("csv") {
        tracing::debug!(context, "detected CSV-shaped response, passing through");
        return Some(Value::String(content.to_string()));
    }

    let cleaned = content
        .replace("```json\n", "")
        .replace("\n```", "")
        .replace("```json", "")
        .replace("```", "");
    let cleaned = cleaned.trim().replace('\n', "");
    let cleaned = control_char_re().replace_all(&cleaned, "").into_owned();
    let cleaned = cleaned
        .replace('\u{201c}', "\"")
        .replace('\u{201d}', "\"");

    let Some(json_content) = extract_json(&cleaned) else {
        tracing::warn!(context, raw = content, "no JSON structure found in response");
        return None;
    };

    match serde_json::from_str::<Value>(json_content) {
        Ok(value) => Some(value),
        Err(_) => {
            // Bounded repair: quote bare keys, drop stray backslash escapes
            let repaired = bare_key_re().replace_all(json_content, "\"$1\":");
            let repaired = backslash_re().replace_all(&repaired, "$1");
            match serde_json::from_str::<Value>(&repaired) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(context, %err, raw = content, "failed to parse model response");
                    None
                }
            }
        }
    }
}

/// Load a prompt template from disk.
pub fn load_prompt(path: &Path) -> anyhow::Result<String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read prompt template {}: {e}", path.display()))?;
    Ok(content.trim().to_string())
}

/// Resolve the template, call the model, parse the response.
///
/// Returns the structured result (or `None` on any failure) together with the
/// token usage of the call (zero when the call never completed).
pub async fn execute(
    client: &dyn ModelClient,
    pool: &SqlitePool,
    prompts: &PromptsConfig,
    vars: &PromptVars,
    template: &str,
    temperature: f32,
    context: &str,
) -> (Option<Value>, Usage) {
    let resolved = match resolve_entity_params(pool, prompts, template).await {
        Ok(resolved) => resolved,
        Err(err) => {
            tracing::warn!(context, %err, "entity placeholder resolution failed");
            return (None, Usage::default());
        }
    };

    let prompt = match render(&resolved, vars) {
        Ok(prompt) => prompt,
        Err(err) => {
            tracing::warn!(context, %err, "prompt rendering failed");
            return (None, Usage::default());
        }
    };

    let messages = [ChatMessage::system(SYSTEM_MESSAGE), ChatMessage::user(prompt)];
    let outcome = match client.complete(&messages, temperature).await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::warn!(context, %err, "model call failed");
            return (None, Usage::default());
        }
    };

    let usage = outcome.usage;
    (parse_response(&outcome.content, context), usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placeholders() {
        let tpl = "Query: {user_query}\nContext: {query_context}\nTone: {brand.tone}\nAgain: {user_query}";
        assert_eq!(
            placeholders(tpl),
            vec!["user_query", "query_context", "brand.tone"]
        );
    }

    #[test]
    fn test_render_ok() {
        let vars = PromptVars::new()
            .with("user_query", "casamento no campo")
            .with("query_context", "{}");
        let out = render("Q: {user_query} C: {query_context}", &vars).unwrap();
        assert_eq!(out, "Q: casamento no campo C: {}");
    }

    #[test]
    fn test_render_missing_key_is_typed_error() {
        let vars = PromptVars::new().with("user_query", "praia");
        let err = render("Q: {user_query} C: {query_context}", &vars).unwrap_err();
        match err {
            TemplateError::MissingKeys(keys) => assert_eq!(keys, vec!["query_context"]),
        }
    }

    #[test]
    fn test_parse_plain_json() {
        let parsed = parse_response(r#"{"att_1": "Material"}"#, "test").unwrap();
        assert_eq!(parsed, json!({"att_1": "Material"}));
    }

    #[test]
    fn test_parse_strips_markdown_fences() {
        let content = "```json\n{\"att_1\": \"Material\"}\n```";
        let parsed = parse_response(content, "test").unwrap();
        assert_eq!(parsed, json!({"att_1": "Material"}));
    }

    #[test]
    fn test_parse_normalizes_curly_quotes() {
        let content = "{\u{201c}att_1\u{201d}: \u{201c}Cor\u{201d}}";
        let parsed = parse_response(content, "test").unwrap();
        assert_eq!(parsed, json!({"att_1": "Cor"}));
    }

    #[test]
    fn test_parse_repairs_bare_keys() {
        // Multi-line so the first-line CSV sniff does not fire on the comma
        let content = "{\natt_1: \"Material\",\natt_2: \"Cor\"\n}";
        let parsed = parse_response(content, "test").unwrap();
        assert_eq!(parsed, json!({"att_1": "Material", "att_2": "Cor"}));
    }

    #[test]
    fn test_parse_single_line_with_comma_is_csv_shaped() {
        // Faithful to the detection rule: a comma in the first line wins
        let content = "{\"att_1\": \"Material\", \"att_2\": \"Cor\"}";
        let parsed = parse_response(content, "test").unwrap();
        assert_eq!(parsed, Value::String(content.to_string()));
    }

    #[test]
    fn test_parse_extracts_embedded_json() {
        let content = "Here is the analysis.\n\n{\"attribute\": \"Material\"}";
        // First line has no delimiter, so this is not CSV-shaped
        let parsed = parse_response(content, "test").unwrap();
        assert_eq!(parsed, json!({"attribute": "Material"}));
    }

    #[test]
    fn test_parse_csv_passthrough() {
        let content = "name;score\nCouro;9\nJeans;6";
        let parsed = parse_response(content, "test").unwrap();
        assert_eq!(parsed, Value::String(content.to_string()));
    }

    #[test]
    fn test_parse_unrecoverable_returns_none() {
        assert!(parse_response("no json here at all", "test").is_none());
        assert!(parse_response("{definitely [not (json", "test").is_none());
    }

    #[test]
    fn test_parse_drops_control_characters() {
        let content = "{\"att_1\": \"Mat\u{0001}erial\"}";
        let parsed = parse_response(content, "test").unwrap();
        assert_eq!(parsed, json!({"att_1": "Material"}));
    }
}
