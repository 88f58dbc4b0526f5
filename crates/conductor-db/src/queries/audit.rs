//! Query functions for the append-only `audit_logs` table.
//!
//! Audit rows are inserted and pruned by retention policy, never updated.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::AuditLog;

/// Fields for a new audit record.
#[derive(Debug, Clone)]
pub struct NewAuditRecord<'a> {
    pub organization_id: Option<Uuid>,
    /// `None` for system-originated actions.
    pub user_id: Option<Uuid>,
    pub action: &'a str,
    pub resource: &'a str,
    pub resource_id: Option<String>,
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
}

/// Append an audit record.
pub async fn insert_audit(pool: &PgPool, record: &NewAuditRecord<'_>) -> Result<AuditLog> {
    let row = sqlx::query_as::<_, AuditLog>(
        "INSERT INTO audit_logs (organization_id, user_id, action, resource, resource_id, details, ip_address) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(record.organization_id)
    .bind(record.user_id)
    .bind(record.action)
    .bind(record.resource)
    .bind(&record.resource_id)
    .bind(&record.details)
    .bind(&record.ip_address)
    .fetch_one(pool)
    .await
    .context("failed to insert audit record")?;

    Ok(row)
}

/// List audit records for a resource, newest first.
pub async fn list_audit_for_resource(
    pool: &PgPool,
    resource: &str,
    resource_id: &str,
    limit: i64,
) -> Result<Vec<AuditLog>> {
    let rows = sqlx::query_as::<_, AuditLog>(
        "SELECT * FROM audit_logs \
         WHERE resource = $1 AND resource_id = $2 \
         ORDER BY created_at DESC \
         LIMIT $3",
    )
    .bind(resource)
    .bind(resource_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list audit records")?;

    Ok(rows)
}

/// Delete an organization's audit records older than the cutoff.
/// Returns the number of rows removed.
pub async fn prune_expired(
    pool: &PgPool,
    organization_id: Uuid,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM audit_logs WHERE organization_id = $1 AND created_at < $2",
    )
    .bind(organization_id)
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to prune audit records")?;

    Ok(result.rows_affected())
}
