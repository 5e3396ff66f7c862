//! Core data types flowing through the recommendation pipeline.
//!
//! These cover the pipeline event stream, the per-attribute analysis blocks
//! produced by model calls, the occasion/weather context, and ranked product
//! rows with their grouped final shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event emitted by the query pipeline. Consumers pull events until a
/// terminal status (`final_result`, `final_message`, or `error`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Event {
    /// A stage is about to run.
    Progress { message: String },
    /// Occasion/weather context from stage 1 (possibly empty).
    ContextResult { data: Value },
    /// Typed mid-pipeline result: selected attributes or accepted categories.
    IntermediateResult {
        #[serde(rename = "type")]
        kind: IntermediateKind,
        data: Value,
    },
    /// Terminal: grouped category -> products payload.
    FinalResult { data: Value },
    /// Terminal: no categories passed the acceptance threshold.
    FinalMessage { message: String },
    /// Terminal: the pipeline could not proceed.
    Error { message: String },
}

impl Event {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::FinalResult { .. } | Event::FinalMessage { .. } | Event::Error { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntermediateKind {
    Attributes,
    Categories,
}

/// Occasion/weather classification of a query, produced by the context stage.
/// Every field is advisory; an empty context is a valid outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OccasionContext {
    #[serde(default)]
    pub occasion: Occasion,
    #[serde(default)]
    pub weather: Weather,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Occasion {
    pub formality: Option<String>,
    pub time: Option<String>,
    pub location: Option<String>,
    pub activity: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Weather {
    pub climate: Option<String>,
}

impl OccasionContext {
    /// Parse the context stage's model output, tolerating missing or
    /// wrongly-typed fields. Returns an empty context when nothing fits.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// One ranked candidate value inside an attribute block. Ids and scores are
/// kept as raw JSON values because models return them inconsistently
/// (`7`, `"7"`, `7.0`); conversion happens at the ranking boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeValue {
    pub id: Option<Value>,
    pub name: Option<String>,
    pub score: Option<Value>,
    pub justification: Option<String>,
}

/// Result of one attribute-analysis model call: the attribute name plus up to
/// three ranked candidate values.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeBlock {
    pub attribute: String,
    pub values: Vec<AttributeValue>,
}

impl AttributeBlock {
    /// Parse a model response of the flat `value_{i}_*` shape into a block.
    /// Returns `None` when there is no `attribute` field.
    pub fn from_value(value: &Value) -> Option<Self> {
        let attribute = value.get("attribute")?.as_str()?.to_string();
        let mut values = Vec::new();
        for i in 1..=3 {
            let id = value.get(format!("value_{i}_id")).cloned();
            let name = value
                .get(format!("value_{i}_name"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let score = value.get(format!("value_{i}_score")).cloned();
            let justification = value
                .get(format!("value_{i}_justification"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if id.is_some() || name.is_some() || score.is_some() {
                values.push(AttributeValue {
                    id,
                    name,
                    score,
                    justification,
                });
            }
        }
        Some(AttributeBlock { attribute, values })
    }
}

/// Take the part of an attribute label before `|` and trim it. Handles
/// compound labels like `"Linha | Forma"`.
pub fn normalize_attribute_name(raw: &str) -> &str {
    raw.split('|').next().unwrap_or("").trim()
}

/// Convert a loosely-typed JSON scalar to an integer. Accepts integers,
/// floats, booleans, and numeric strings (including `"10.0"`); anything else
/// falls back to `default`.
pub fn to_int_safe(value: &Value, default: i64) -> i64 {
    match value {
        Value::Bool(b) => *b as i64,
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(default),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                default
            } else {
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                    .unwrap_or(default)
            }
        }
        _ => default,
    }
}

/// A product row returned by the ranker, immutable once produced. `price` is
/// the display string in major units; `price_cents` keeps the stored value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedProduct {
    pub product_id: i64,
    pub name: String,
    pub price: String,
    pub price_cents: i64,
    pub image_url: Option<String>,
    pub category: String,
    pub description: Option<String>,
    pub relevance_score: i64,
}

/// Products for one accepted category, in ranker order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryGroup {
    pub category: String,
    pub products: Vec<RankedProduct>,
}

/// Ordered grouping by category with a global cap and dedup by product id.
///
/// Categories keep their input order. A product seen in an earlier category is
/// skipped in later ones, and once `cap` products have been collected the
/// grouping stops, mid-category if necessary.
pub fn group_products(results: &[(String, Vec<RankedProduct>)], cap: usize) -> Vec<CategoryGroup> {
    let mut grouped = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut total = 0usize;

    for (category, items) in results {
        let mut bucket = Vec::new();
        for product in items {
            if !seen.insert(product.product_id) {
                continue;
            }
            let mut product = product.clone();
            product.category = category.clone();
            bucket.push(product);
            total += 1;
            if total >= cap {
                break;
            }
        }
        if !bucket.is_empty() {
            grouped.push(CategoryGroup {
                category: category.clone(),
                products: bucket,
            });
        }
        if total >= cap {
            break;
        }
    }
    grouped
}

/// Serialize grouped results as a JSON object mapping category -> products,
/// preserving category order.
pub fn grouped_to_json(groups: &[CategoryGroup]) -> Value {
    let mut map = serde_json::Map::new();
    for group in groups {
        map.insert(
            group.category.clone(),
            serde_json::to_value(&group.products).unwrap_or(Value::Null),
        );
    }
    Value::Object(map)
}
