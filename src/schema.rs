//! Database schema bootstrap.

use anyhow::{Context, Result};
use sqlx::PgPool;

const SCHEMA_SQL: &str = include_str!("../migrations/001_company_enrichment.sql");

/// Create the `enrichment` schema, tables and indexes if they do not exist.
pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .context("Failed to apply company enrichment schema")?;
    tracing::info!("Company enrichment schema applied");
    Ok(())
}
