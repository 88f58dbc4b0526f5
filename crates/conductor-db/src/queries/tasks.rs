//! Query functions for the `task_executions` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{TaskExecution, TaskStatus};

/// Fetch a single task execution by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<TaskExecution>> {
    let task = sqlx::query_as::<_, TaskExecution>("SELECT * FROM task_executions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task execution")?;

    Ok(task)
}

/// List all task executions for a run, ordered by step order.
pub async fn list_tasks_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<TaskExecution>> {
    let tasks = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions WHERE run_id = $1 ORDER BY step_order ASC",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to list task executions for run")?;

    Ok(tasks)
}

/// Timing and result fields applied alongside a task status transition.
#[derive(Debug, Clone, Default)]
pub struct TaskTransitionFields {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Atomically transition a task from one status to another.
///
/// Optimistic locking: the UPDATE's WHERE clause includes `status = $from`,
/// so the row is only updated if the current status matches. Returns the
/// number of rows affected (0 means the status did not match — a duplicate
/// delivery or a concurrent transition already won).
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    fields: &TaskTransitionFields,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_executions \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at), \
             duration_ms = COALESCE($4, duration_ms), \
             input = COALESCE($5, input), \
             output = COALESCE($6, output), \
             error = COALESCE($7, error) \
         WHERE id = $8 AND status = $9",
    )
    .bind(to)
    .bind(fields.started_at)
    .bind(fields.completed_at)
    .bind(fields.duration_ms)
    .bind(&fields.input)
    .bind(&fields.output)
    .bind(&fields.error)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Atomically reset a `failed` task to `pending` for a retry, incrementing
/// the retry counter and clearing the previous attempt's result fields.
/// Optimistic on both status and the current retry count.
pub async fn transition_task_retry(
    pool: &PgPool,
    task_id: Uuid,
    current_retry_count: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_executions \
         SET status = 'pending', \
             retry_count = retry_count + 1, \
             output = NULL, \
             error = NULL, \
             started_at = NULL, \
             completed_at = NULL, \
             duration_ms = NULL \
         WHERE id = $1 AND status = 'failed' AND retry_count = $2",
    )
    .bind(task_id)
    .bind(current_retry_count)
    .execute(pool)
    .await
    .context("failed to retry task")?;

    Ok(result.rows_affected())
}

/// Fail every non-terminal task of a run with the given error text.
///
/// Used by the startup recovery sweep: tasks left `pending` or `running` by
/// a crashed orchestrator instance are failed rather than resumed.
pub async fn fail_nonterminal_tasks_for_run(
    pool: &PgPool,
    run_id: Uuid,
    error: &str,
) -> Result<Vec<TaskExecution>> {
    let tasks = sqlx::query_as::<_, TaskExecution>(
        "UPDATE task_executions \
         SET status = 'failed', error = $2, completed_at = NOW() \
         WHERE run_id = $1 AND status IN ('pending', 'running') \
         RETURNING *",
    )
    .bind(run_id)
    .bind(error)
    .fetch_all(pool)
    .await
    .context("failed to fail tasks for run")?;

    Ok(tasks)
}

/// Append a line to a task's log text.
pub async fn append_task_logs(pool: &PgPool, task_id: Uuid, line: &str) -> Result<()> {
    sqlx::query(
        "UPDATE task_executions \
         SET logs = COALESCE(logs || E'\\n', '') || $2 \
         WHERE id = $1",
    )
    .bind(task_id)
    .bind(line)
    .execute(pool)
    .await
    .context("failed to append task logs")?;

    Ok(())
}
