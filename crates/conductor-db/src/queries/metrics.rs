//! Query functions for the `metrics` samples table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::Metric;

/// Record one sample.
pub async fn record_metric(pool: &PgPool, name: &str, value: f64) -> Result<()> {
    sqlx::query("INSERT INTO metrics (name, value) VALUES ($1, $2)")
        .bind(name)
        .bind(value)
        .execute(pool)
        .await
        .context("failed to record metric")?;

    Ok(())
}

/// Most recent samples for a metric name, newest first.
pub async fn recent_metrics(pool: &PgPool, name: &str, limit: i64) -> Result<Vec<Metric>> {
    let rows = sqlx::query_as::<_, Metric>(
        "SELECT * FROM metrics WHERE name = $1 ORDER BY recorded_at DESC LIMIT $2",
    )
    .bind(name)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch metrics")?;

    Ok(rows)
}
