//! Query functions for the `workflows` and `workflow_steps` tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Workflow, WorkflowStatus, WorkflowStep};

/// Insert a new workflow definition (version 1, `active`).
pub async fn insert_workflow(
    pool: &PgPool,
    organization_id: Uuid,
    name: &str,
) -> Result<Workflow> {
    let workflow = sqlx::query_as::<_, Workflow>(
        "INSERT INTO workflows (organization_id, name) \
         VALUES ($1, $2) \
         RETURNING *",
    )
    .bind(organization_id)
    .bind(name)
    .fetch_one(pool)
    .await
    .context("failed to insert workflow")?;

    Ok(workflow)
}

/// Fields for inserting a new workflow step.
#[derive(Debug, Clone)]
pub struct NewWorkflowStep<'a> {
    pub workflow_id: Uuid,
    pub agent_id: Uuid,
    pub name: &'a str,
    pub step_order: i32,
    pub config: serde_json::Value,
    pub depends_on: &'a [Uuid],
}

/// Insert a step into a workflow's DAG.
///
/// The caller is responsible for DAG validation (acyclicity, sibling-only
/// dependencies) before insertion; the database only enforces the
/// `(workflow_id, step_order)` uniqueness.
pub async fn insert_workflow_step(pool: &PgPool, step: &NewWorkflowStep<'_>) -> Result<WorkflowStep> {
    let row = sqlx::query_as::<_, WorkflowStep>(
        "INSERT INTO workflow_steps (workflow_id, agent_id, name, step_order, config, depends_on) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(step.workflow_id)
    .bind(step.agent_id)
    .bind(step.name)
    .bind(step.step_order)
    .bind(&step.config)
    .bind(step.depends_on)
    .fetch_one(pool)
    .await
    .context("failed to insert workflow step")?;

    Ok(row)
}

/// Fetch a single workflow by ID.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<Option<Workflow>> {
    let workflow = sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow")?;

    Ok(workflow)
}

/// List a workflow's steps in ascending `step_order`.
pub async fn get_workflow_steps(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<WorkflowStep>> {
    let steps = sqlx::query_as::<_, WorkflowStep>(
        "SELECT * FROM workflow_steps WHERE workflow_id = $1 ORDER BY step_order ASC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflow steps")?;

    Ok(steps)
}

/// Update a workflow's status (`active` / `disabled`).
pub async fn set_workflow_status(
    pool: &PgPool,
    id: Uuid,
    status: WorkflowStatus,
) -> Result<()> {
    let result =
        sqlx::query("UPDATE workflows SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(pool)
            .await
            .context("failed to update workflow status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("workflow {id} not found");
    }

    Ok(())
}
