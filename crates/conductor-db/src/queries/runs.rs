//! Query functions for the `workflow_runs` table.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{RunPriority, RunStatus, TaskExecution, WorkflowRun, WorkflowStatus};

/// Fields for creating a new run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_id: Uuid,
    /// The submitting user.
    pub submitted_by: Uuid,
    /// The submitting user's organization; must own the workflow.
    pub organization_id: Uuid,
    pub input: serde_json::Value,
    pub priority: RunPriority,
    /// Retry budget applied to every task in the run.
    pub max_retries: i32,
    /// Per-task timeout applied to every task in the run.
    pub timeout_ms: i64,
}

/// Atomically create a run and its task-execution snapshot.
///
/// In a single transaction: validates that the workflow exists, belongs to
/// the submitting organization, and is `active`; inserts the run (`pending`);
/// and inserts one `pending` task-execution row per workflow step with the
/// step definition (name, agent, config, order, dependencies are resolved
/// through `step_id`) captured onto the row.
pub async fn create_run(pool: &PgPool, new: &NewRun) -> Result<(WorkflowRun, Vec<TaskExecution>)> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let workflow = sqlx::query_as::<_, crate::models::Workflow>(
        "SELECT * FROM workflows WHERE id = $1",
    )
    .bind(new.workflow_id)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to fetch workflow")?;

    let Some(workflow) = workflow else {
        bail!("workflow {} not found", new.workflow_id);
    };

    if workflow.organization_id != new.organization_id {
        bail!(
            "workflow {} does not belong to organization {}",
            new.workflow_id,
            new.organization_id
        );
    }

    if workflow.status != WorkflowStatus::Active {
        bail!("workflow {} is disabled", new.workflow_id);
    }

    let steps = sqlx::query_as::<_, crate::models::WorkflowStep>(
        "SELECT * FROM workflow_steps WHERE workflow_id = $1 ORDER BY step_order ASC",
    )
    .bind(new.workflow_id)
    .fetch_all(&mut *tx)
    .await
    .context("failed to fetch workflow steps")?;

    if steps.is_empty() {
        bail!("workflow {} has no steps", new.workflow_id);
    }

    let run = sqlx::query_as::<_, WorkflowRun>(
        "INSERT INTO workflow_runs (workflow_id, submitted_by, priority, input) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.workflow_id)
    .bind(new.submitted_by)
    .bind(new.priority)
    .bind(&new.input)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert workflow run")?;

    let mut tasks = Vec::with_capacity(steps.len());
    for step in &steps {
        let task = sqlx::query_as::<_, TaskExecution>(
            "INSERT INTO task_executions \
                 (run_id, step_id, step_name, step_order, agent_id, config, max_retries, timeout_ms) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING *",
        )
        .bind(run.id)
        .bind(step.id)
        .bind(&step.name)
        .bind(step.step_order)
        .bind(step.agent_id)
        .bind(&step.config)
        .bind(new.max_retries)
        .bind(new.timeout_ms)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to insert task execution for step {}", step.name))?;
        tasks.push(task);
    }

    tx.commit().await.context("failed to commit run creation")?;

    Ok((run, tasks))
}

/// Terminal and timing fields applied alongside a run status transition.
#[derive(Debug, Clone, Default)]
pub struct RunTransitionFields {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Atomically transition a run from one status to another.
///
/// Optimistic locking: the UPDATE only matches when the current status
/// equals `from`. Returns rows-affected (0 means the status did not match,
/// i.e. a concurrent transition won).
pub async fn transition_run_status(
    pool: &PgPool,
    run_id: Uuid,
    from: RunStatus,
    to: RunStatus,
    fields: &RunTransitionFields,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workflow_runs \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at), \
             duration_ms = COALESCE($4, duration_ms), \
             output = COALESCE($5, output), \
             error = COALESCE($6, error) \
         WHERE id = $7 AND status = $8",
    )
    .bind(to)
    .bind(fields.started_at)
    .bind(fields.completed_at)
    .bind(fields.duration_ms)
    .bind(&fields.output)
    .bind(&fields.error)
    .bind(run_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition run status")?;

    Ok(result.rows_affected())
}

/// Fetch a single run by ID.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<WorkflowRun>> {
    let run = sqlx::query_as::<_, WorkflowRun>("SELECT * FROM workflow_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow run")?;

    Ok(run)
}

/// Fetch a run together with its task executions (ascending step order).
pub async fn get_run_with_tasks(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<(WorkflowRun, Vec<TaskExecution>)>> {
    let Some(run) = get_run(pool, id).await? else {
        return Ok(None);
    };

    let tasks = crate::queries::tasks::list_tasks_for_run(pool, id).await?;
    Ok(Some((run, tasks)))
}

/// List every run currently in `running` status (startup recovery sweep).
pub async fn list_running_runs(pool: &PgPool) -> Result<Vec<WorkflowRun>> {
    let runs = sqlx::query_as::<_, WorkflowRun>(
        "SELECT * FROM workflow_runs WHERE status = 'running' ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list running runs")?;

    Ok(runs)
}

/// Count an organization's non-terminal runs (plan-limit admission).
pub async fn count_active_runs_for_org(pool: &PgPool, organization_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) \
         FROM workflow_runs r \
         JOIN workflows w ON w.id = r.workflow_id \
         WHERE w.organization_id = $1 \
           AND r.status IN ('pending', 'running')",
    )
    .bind(organization_id)
    .fetch_one(pool)
    .await
    .context("failed to count active runs")?;

    Ok(row.0)
}

/// The organization that owns a run (resolved through its workflow).
pub async fn get_run_organization(pool: &PgPool, run_id: Uuid) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT w.organization_id \
         FROM workflow_runs r \
         JOIN workflows w ON w.id = r.workflow_id \
         WHERE r.id = $1",
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("failed to resolve run organization")?;

    Ok(row.map(|(id,)| id))
}
