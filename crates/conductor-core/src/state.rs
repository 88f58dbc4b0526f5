//! Run and task state machine transitions.
//!
//! Validates and executes state transitions against the state store,
//! enforcing the allowed transition graphs, optimistic locking, and retry
//! limits. The store's CAS is the authority; the in-process matrices exist
//! so illegal transitions fail before touching the database.

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{RunStatus, TaskStatus};
use conductor_db::queries::runs::{self as run_db, RunTransitionFields};
use conductor_db::queries::tasks::{self as task_db, TaskTransitionFields};

/// The run state machine.
///
/// ```text
/// pending -> running
/// pending -> cancelled
/// running -> completed
/// running -> failed
/// running -> cancelled
/// ```
pub struct RunStateMachine;

impl RunStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge.
    pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
        matches!(
            (from, to),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Cancelled)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Cancelled)
        )
    }

    /// Execute a CAS transition. Returns `Ok(false)` when the optimistic
    /// lock loses (the run was concurrently transitioned), `Err` for an
    /// edge that is not in the graph or a missing run.
    pub async fn transition(
        pool: &PgPool,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
        fields: &RunTransitionFields,
    ) -> Result<bool> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid run transition: {from} -> {to} for run {run_id}");
        }

        let rows = run_db::transition_run_status(pool, run_id, from, to, fields)
            .await
            .with_context(|| format!("failed to transition run {run_id} from {from} to {to}"))?;

        if rows == 0 {
            let run = run_db::get_run(pool, run_id).await?;
            match run {
                None => bail!("run {run_id} not found"),
                Some(_) => return Ok(false),
            }
        }

        Ok(true)
    }
}

/// The task state machine.
///
/// ```text
/// pending -> running
/// pending -> skipped    (upstream dependency failed terminally)
/// pending -> cancelled
/// running -> completed
/// running -> failed
/// running -> cancelled
/// failed  -> pending    (retry, while retry_count < max_retries)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Skipped)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
                | (TaskStatus::Failed, TaskStatus::Pending)
        )
    }

    /// Execute a CAS transition. Returns `Ok(false)` when the optimistic
    /// lock loses (duplicate delivery or concurrent transition), `Err` for
    /// an invalid edge or a missing task.
    ///
    /// The `failed -> pending` retry edge must go through [`Self::retry`],
    /// which also checks the retry budget and increments the counter.
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        fields: &TaskTransitionFields,
    ) -> Result<bool> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid task transition: {from} -> {to} for task {task_id}");
        }
        if from == TaskStatus::Failed && to == TaskStatus::Pending {
            bail!("retry transitions must go through TaskStateMachine::retry");
        }

        let rows = task_db::transition_task_status(pool, task_id, from, to, fields)
            .await
            .with_context(|| format!("failed to transition task {task_id} from {from} to {to}"))?;

        if rows == 0 {
            let task = task_db::get_task(pool, task_id).await?;
            match task {
                None => bail!("task {task_id} not found"),
                Some(_) => return Ok(false),
            }
        }

        Ok(true)
    }

    /// Handle the `failed -> pending` retry transition.
    ///
    /// Fetches the task to check the retry counter against `max_retries`,
    /// then atomically increments the counter and resets the result fields.
    /// Returns `Ok(false)` on a lost optimistic lock.
    pub async fn retry(pool: &PgPool, task_id: Uuid) -> Result<bool> {
        let task = task_db::get_task(pool, task_id)
            .await?
            .with_context(|| format!("task {task_id} not found"))?;

        if task.status != TaskStatus::Failed {
            bail!(
                "cannot retry task {task_id}: current status is {}, expected failed",
                task.status
            );
        }

        if task.retry_count >= task.max_retries {
            bail!(
                "cannot retry task {task_id}: retry_count {} >= max_retries {}",
                task.retry_count,
                task.max_retries
            );
        }

        let rows = task_db::transition_task_retry(pool, task_id, task.retry_count).await?;
        Ok(rows > 0)
    }
}
