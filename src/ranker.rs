//! Weighted product ranking over the taxonomy store.
//!
//! Scored (attribute, value, score) triples from the filtered attribute
//! blocks are folded into a single aggregate query: every product sums
//! `score * weight` over the taxonomy pairs it carries that match a triple,
//! unmatched pairs contribute nothing. All external values are bound
//! positionally; nothing from the model ever reaches SQL text.

use anyhow::Result;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::models::{normalize_attribute_name, to_int_safe, AttributeBlock, RankedProduct};

/// Storage names for the attribute labels the prompts use.
fn attribute_db_name(display: &str) -> Option<&'static str> {
    match display {
        "Material" => Some("material"),
        "Cor" => Some("color"),
        "Estrutura" => Some("structure"),
        "Linha" => Some("line"),
        "Textura" => Some("texture"),
        "Superfície" => Some("surface"),
        "Mensagem" => Some("message"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScoredTriple {
    attribute_id: i64,
    value_id: i64,
    score: i64,
}

/// Resolve blocks to (attribute_id, value_id, score) triples. Blocks whose
/// attribute is unknown to the store and values missing an id or score are
/// skipped.
async fn build_triples(pool: &SqlitePool, blocks: &[AttributeBlock]) -> Result<Vec<ScoredTriple>> {
    let mut triples = Vec::new();

    for block in blocks {
        let key = normalize_attribute_name(&block.attribute);
        let Some(db_name) = attribute_db_name(key) else {
            continue;
        };

        let attribute_id: Option<i64> = sqlx::query_scalar("SELECT id FROM attributes WHERE name = ?")
            .bind(db_name)
            .fetch_optional(pool)
            .await?;
        let Some(attribute_id) = attribute_id else {
            continue;
        };

        for value in &block.values {
            if let (Some(id), Some(score)) = (&value.id, &value.score) {
                triples.push(ScoredTriple {
                    attribute_id,
                    value_id: to_int_safe(id, 0),
                    score: to_int_safe(score, 0),
                });
            }
        }
    }

    Ok(triples)
}

/// Rank products by weighted relevance, optionally filtered to one category.
///
/// Returns rows ordered by descending relevance score (product id breaks
/// ties, so repeated runs on identical input are stable), truncated to
/// `limit`. No triples or no matching rows yields an empty vec, never an
/// error.
pub async fn rank_products(
    pool: &SqlitePool,
    blocks: &[AttributeBlock],
    category: Option<&str>,
    limit: i64,
) -> Result<Vec<RankedProduct>> {
    if blocks.is_empty() {
        return Ok(Vec::new());
    }

    let triples = build_triples(pool, blocks).await?;
    if triples.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT p.product_id, p.name, p.price, p.image_url, p.category, p.description, \
         ranked.relevance_score \
         FROM (SELECT product_id, SUM(CASE ",
    );
    for triple in &triples {
        qb.push("WHEN attribute_id = ");
        qb.push_bind(triple.attribute_id);
        qb.push(" AND value_id = ");
        qb.push_bind(triple.value_id);
        qb.push(" THEN score * ");
        qb.push_bind(triple.score);
        qb.push(" ");
    }
    qb.push(
        "ELSE 0 END) AS relevance_score FROM products_taxonomy GROUP BY product_id) AS ranked \
         JOIN products p ON p.product_id = ranked.product_id ",
    );
    if let Some(category) = category {
        qb.push("WHERE p.category = ");
        qb.push_bind(category);
        qb.push(" ");
    }
    qb.push("ORDER BY ranked.relevance_score DESC, p.product_id ASC LIMIT ");
    qb.push_bind(limit);

    let rows = qb.build().fetch_all(pool).await?;

    let products = rows
        .iter()
        .map(|row| {
            let price_cents: i64 = row.get("price");
            RankedProduct {
                product_id: row.get("product_id"),
                name: row.get("name"),
                price: format_brl(price_cents),
                price_cents,
                image_url: row.get("image_url"),
                category: row.get("category"),
                description: row.get("description"),
                relevance_score: row.get("relevance_score"),
            }
        })
        .collect();

    Ok(products)
}

/// Format integer minor units as a pt-BR currency string
/// (`123456` -> `"R$ 1.234,56"`).
pub fn format_brl(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents_abs = cents.unsigned_abs();
    let reais = cents_abs / 100;
    let centavos = cents_abs % 100;

    let digits = reais.to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(c);
    }

    format!("R$ {sign}{grouped},{centavos:02}")
}
