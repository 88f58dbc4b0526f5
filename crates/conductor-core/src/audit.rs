//! Append-only audit trail.
//!
//! Writing an audit record must never take down the operation being
//! audited: inserts are best-effort, failures are logged and swallowed.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::queries::audit::{self, NewAuditRecord};
use conductor_db::queries::organizations;

/// Severity tag carried in the details blob of security-relevant records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Best-effort writer over the store's append-only audit table.
pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one record. Failures are logged, never propagated.
    pub async fn record(&self, record: NewAuditRecord<'_>) {
        if let Err(e) = audit::insert_audit(&self.pool, &record).await {
            tracing::warn!(
                action = record.action,
                error = %e,
                "failed to append audit record (best-effort)"
            );
        }
    }

    /// Record a run lifecycle action (`workflow_run.*`).
    pub async fn run_event(
        &self,
        organization_id: Uuid,
        user_id: Option<Uuid>,
        action: &str,
        run_id: Uuid,
        details: serde_json::Value,
    ) {
        self.record(NewAuditRecord {
            organization_id: Some(organization_id),
            user_id,
            action,
            resource: "workflow_run",
            resource_id: Some(run_id.to_string()),
            details,
            ip_address: None,
        })
        .await;
    }

    /// Record a task terminal transition.
    pub async fn task_event(
        &self,
        organization_id: Uuid,
        action: &str,
        task_id: Uuid,
        details: serde_json::Value,
    ) {
        self.record(NewAuditRecord {
            organization_id: Some(organization_id),
            user_id: None,
            action,
            resource: "task_execution",
            resource_id: Some(task_id.to_string()),
            details,
            ip_address: None,
        })
        .await;
    }

    /// Record a security-relevant event (permission denial, failed
    /// authentication) with its severity tag.
    pub async fn security_event(
        &self,
        organization_id: Option<Uuid>,
        user_id: Option<Uuid>,
        action: &str,
        severity: Severity,
        mut details: serde_json::Value,
        ip_address: Option<String>,
    ) {
        if let serde_json::Value::Object(map) = &mut details {
            map.insert(
                "severity".to_string(),
                serde_json::Value::String(severity.as_str().to_string()),
            );
        }
        self.record(NewAuditRecord {
            organization_id,
            user_id,
            action,
            resource: "security",
            resource_id: None,
            details,
            ip_address,
        })
        .await;
    }

    /// Record a resource utilization warning.
    pub async fn resource_warning(&self, resource: &str, pct: f64) {
        self.record(NewAuditRecord {
            organization_id: None,
            user_id: None,
            action: "resource.warning",
            resource: "resource",
            resource_id: Some(resource.to_string()),
            details: serde_json::json!({ "pct": pct }),
            ip_address: None,
        })
        .await;
    }

    /// Delete audit records past each organization's retention window.
    pub async fn prune_per_retention(&self) {
        let orgs = match organizations::list_organizations(&self.pool).await {
            Ok(orgs) => orgs,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list organizations for audit pruning");
                return;
            }
        };
        for org in orgs {
            let cutoff = Utc::now() - Duration::days(org.retention_days.max(1) as i64);
            match audit::prune_expired(&self.pool, org.id, cutoff).await {
                Ok(0) => {}
                Ok(count) => {
                    tracing::info!(org = %org.slug, count, "pruned expired audit records");
                }
                Err(e) => {
                    tracing::warn!(org = %org.slug, error = %e, "failed to prune audit records");
                }
            }
        }
    }
}
