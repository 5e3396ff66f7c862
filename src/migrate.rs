use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the product catalog schema. Idempotent.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Products table: price stored in integer minor units (cents)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products (
            product_id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            price INTEGER NOT NULL DEFAULT 0,
            image_url TEXT,
            category TEXT NOT NULL,
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Attribute dictionary (material, color, structure, ...)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS attributes (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-product taxonomy weights used by the ranker
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products_taxonomy (
            product_id INTEGER NOT NULL,
            attribute_id INTEGER NOT NULL,
            value_id INTEGER NOT NULL,
            score INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (product_id) REFERENCES products(product_id),
            FOREIGN KEY (attribute_id) REFERENCES attributes(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_taxonomy_pair
        ON products_taxonomy(attribute_id, value_id)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_products_category
        ON products(category)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
