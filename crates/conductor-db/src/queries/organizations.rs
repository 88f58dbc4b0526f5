//! Query functions for the `organizations` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Organization;

/// Insert a new organization. Returns the inserted row with
/// server-generated defaults.
pub async fn insert_organization(
    pool: &PgPool,
    name: &str,
    slug: &str,
    plan_tier: &str,
    max_concurrent_runs: i32,
    retention_days: i32,
) -> Result<Organization> {
    let org = sqlx::query_as::<_, Organization>(
        "INSERT INTO organizations (name, slug, plan_tier, max_concurrent_runs, retention_days) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(name)
    .bind(slug)
    .bind(plan_tier)
    .bind(max_concurrent_runs)
    .bind(retention_days)
    .fetch_one(pool)
    .await
    .context("failed to insert organization")?;

    Ok(org)
}

/// Fetch a single organization by ID.
pub async fn get_organization(pool: &PgPool, id: Uuid) -> Result<Option<Organization>> {
    let org = sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch organization")?;

    Ok(org)
}

/// List all organizations (retention sweeps iterate these).
pub async fn list_organizations(pool: &PgPool) -> Result<Vec<Organization>> {
    let orgs =
        sqlx::query_as::<_, Organization>("SELECT * FROM organizations ORDER BY created_at ASC")
            .fetch_all(pool)
            .await
            .context("failed to list organizations")?;

    Ok(orgs)
}
