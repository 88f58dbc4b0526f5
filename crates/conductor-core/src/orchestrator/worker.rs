//! The job-consuming worker loop.
//!
//! Each worker repeatedly leases a job, runs admission control, invokes the
//! agent with the run's cancellation signal, records the terminal task
//! state, and notifies the owning executor. Task transitions are CAS-backed,
//! so a redelivered job whose task already settled is dropped without side
//! effects.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use conductor_db::models::TaskStatus;
use conductor_db::queries::tasks::{self as task_db, TaskTransitionFields};

use crate::agent::registry::{AgentRegistry, InvokeOutcome, RegisteredAgent, TIMEOUT_ERROR};
use crate::agent::TaskContext;
use crate::audit::AuditLogger;
use crate::executor::TaskCompletion;
use crate::queue::{DurableQueue, Job};
use crate::resources::ResourceManager;
use crate::tracker::TaskTracker;

use super::{RunHandle, RunTable};

/// Everything a worker needs, cloned per worker task.
#[derive(Clone)]
pub(super) struct WorkerContext {
    pub pool: PgPool,
    pub queue: Arc<DurableQueue>,
    pub registry: Arc<AgentRegistry>,
    pub resources: Arc<ResourceManager>,
    pub tracker: Arc<TaskTracker>,
    pub audit: Arc<AuditLogger>,
    pub runs: Arc<RunTable>,
    pub shutdown: CancellationToken,
    pub allocation_retry_delay: Duration,
}

/// Dequeue-and-process until shutdown.
pub(super) async fn worker_loop(worker_id: String, ctx: WorkerContext) {
    tracing::debug!(worker = %worker_id, "worker started");
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            dequeued = ctx.queue.dequeue(&worker_id) => match dequeued {
                Ok(Some(job)) => {
                    if let Err(e) = process_job(&ctx, &worker_id, job).await {
                        // Infrastructure failure: abort the job and let the
                        // lease expire so the queue redelivers it.
                        tracing::error!(worker = %worker_id, error = %e, "job aborted");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(worker = %worker_id, error = %e, "dequeue failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }
    tracing::debug!(worker = %worker_id, "worker stopped");
}

async fn process_job(ctx: &WorkerContext, worker_id: &str, job: Job) -> Result<()> {
    let Some(task) = task_db::get_task(&ctx.pool, job.task_id).await? else {
        ctx.queue.ack(job.id).await?;
        return Ok(());
    };

    // Duplicate delivery, or a task already resolved elsewhere (cancel,
    // recovery sweep). Dropping the job here is the at-most-once guarantee.
    if task.status != TaskStatus::Pending {
        ctx.queue.ack(job.id).await?;
        return Ok(());
    }

    let Some(handle) = ctx.runs.get(job.run_id) else {
        // The owning run is gone (finalized or recovered); stale job.
        ctx.queue.ack(job.id).await?;
        return Ok(());
    };

    if handle.cancel.is_cancelled() {
        // The run is winding down; resolve without invoking the agent.
        let cancelled = ctx
            .tracker
            .update_status(task.id, TaskStatus::Pending, TaskStatus::Cancelled, &TaskTransitionFields {
                completed_at: Some(Utc::now()),
                ..Default::default()
            })
            .await?;
        if cancelled {
            notify(&handle, TaskCompletion {
                task_id: task.id,
                status: TaskStatus::Cancelled,
                output: None,
                error: None,
            })
            .await;
        }
        ctx.queue.ack(job.id).await?;
        return Ok(());
    }

    let agent = match ctx.registry.get(job.agent_id) {
        Ok(agent) => agent,
        Err(e) => {
            // No handler will ever serve this job; fail the task through
            // the legal transition chain.
            let error = e.to_string();
            if ctx
                .tracker
                .update_status(task.id, TaskStatus::Pending, TaskStatus::Running, &TaskTransitionFields {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                })
                .await?
            {
                ctx.tracker
                    .update_status(task.id, TaskStatus::Running, TaskStatus::Failed, &TaskTransitionFields {
                        completed_at: Some(Utc::now()),
                        error: Some(error.clone()),
                        ..Default::default()
                    })
                    .await?;
                notify(&handle, TaskCompletion {
                    task_id: task.id,
                    status: TaskStatus::Failed,
                    output: None,
                    error: Some(error),
                })
                .await;
            }
            ctx.queue.ack(job.id).await?;
            return Ok(());
        }
    };

    let hint = ctx
        .registry
        .resource_hint(job.agent_id)
        .unwrap_or_default();
    if let Err(reason) = ctx.resources.allocate(task.id, job.agent_id, &hint) {
        // Transient: back off without consuming a retry attempt and
        // without telling the submitter.
        tracing::debug!(
            task_id = %task.id,
            reason = %reason,
            "allocation denied, delaying job"
        );
        ctx.queue.release(job.id, ctx.allocation_retry_delay).await?;
        return Ok(());
    }

    let result = run_leased(ctx, worker_id, &job, &agent, &handle).await;
    ctx.resources.release(task.id);
    result
}

/// The job with an allocation held: start the task, invoke the agent,
/// settle the outcome.
async fn run_leased(
    ctx: &WorkerContext,
    worker_id: &str,
    job: &Job,
    agent: &RegisteredAgent,
    handle: &RunHandle,
) -> Result<()> {
    // Re-read for the current retry counter; the job may be a redelivery.
    let Some(task) = task_db::get_task(&ctx.pool, job.task_id).await? else {
        ctx.queue.ack(job.id).await?;
        return Ok(());
    };

    let started_at = Utc::now();
    let became_running = ctx
        .tracker
        .update_status(task.id, TaskStatus::Pending, TaskStatus::Running, &TaskTransitionFields {
            started_at: Some(started_at),
            input: Some(job.payload.clone()),
            ..Default::default()
        })
        .await?;
    if !became_running {
        // Someone else resolved the task between our check and the CAS.
        ctx.queue.ack(job.id).await?;
        return Ok(());
    }

    if let Err(e) = task_db::append_task_logs(
        &ctx.pool,
        task.id,
        &format!("attempt {} leased by {}", task.retry_count + 1, worker_id),
    )
    .await
    {
        tracing::warn!(task_id = %task.id, error = %e, "failed to append task log");
    }

    let timeout = Duration::from_millis(task.timeout_ms.max(1) as u64);
    let task_ctx = TaskContext {
        task_id: task.id,
        run_id: job.run_id,
        attempt: task.retry_count,
        input: job.payload.clone(),
        config: task.config.clone(),
    };

    // Keep the lease alive while the agent runs; a task is allowed to take
    // longer than the visibility timeout.
    let renewal = {
        let queue = Arc::clone(&ctx.queue);
        let job_id = job.id;
        let owner = worker_id.to_string();
        let interval = ctx.queue.config().visibility_timeout / 2;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match queue.renew_lease(job_id, &owner).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => break,
                }
            }
        })
    };

    let outcome = ctx
        .registry
        .invoke(agent, &task_ctx, &handle.cancel, timeout)
        .await;
    renewal.abort();

    let completed_at = Utc::now();
    let duration_ms = (completed_at - started_at).num_milliseconds();

    match outcome {
        InvokeOutcome::Completed(result) if result.success => {
            let settled = ctx
                .tracker
                .update_status(task.id, TaskStatus::Running, TaskStatus::Completed, &TaskTransitionFields {
                    completed_at: Some(completed_at),
                    duration_ms: Some(duration_ms),
                    output: Some(result.output.clone()),
                    ..Default::default()
                })
                .await?;
            if settled {
                ctx.audit
                    .task_event(
                        handle.organization_id,
                        "task_execution.completed",
                        task.id,
                        serde_json::json!({ "duration_ms": duration_ms }),
                    )
                    .await;
                notify(handle, TaskCompletion {
                    task_id: task.id,
                    status: TaskStatus::Completed,
                    output: Some(result.output),
                    error: None,
                })
                .await;
            }
            ctx.queue.ack(job.id).await?;
        }

        InvokeOutcome::Completed(result) => {
            let error = result
                .error
                .unwrap_or_else(|| "agent reported failure".to_string());
            settle_failure(ctx, job, &task.id, handle, error, completed_at, duration_ms).await?;
        }

        InvokeOutcome::TimedOut => {
            tracing::warn!(task_id = %task.id, timeout_ms = task.timeout_ms, "task timed out");
            settle_failure(
                ctx,
                job,
                &task.id,
                handle,
                TIMEOUT_ERROR.to_string(),
                completed_at,
                duration_ms,
            )
            .await?;
        }

        InvokeOutcome::Cancelled => {
            let settled = ctx
                .tracker
                .update_status(task.id, TaskStatus::Running, TaskStatus::Cancelled, &TaskTransitionFields {
                    completed_at: Some(completed_at),
                    duration_ms: Some(duration_ms),
                    ..Default::default()
                })
                .await?;
            if settled {
                notify(handle, TaskCompletion {
                    task_id: task.id,
                    status: TaskStatus::Cancelled,
                    output: None,
                    error: None,
                })
                .await;
            }
            ctx.queue.ack(job.id).await?;
        }
    }

    Ok(())
}

/// Record a failed attempt. Below the attempt budget the task is reset to
/// `pending` and the job requeued with backoff; otherwise the failure is
/// terminal and the executor is notified.
async fn settle_failure(
    ctx: &WorkerContext,
    job: &Job,
    task_id: &uuid::Uuid,
    handle: &RunHandle,
    error: String,
    completed_at: chrono::DateTime<Utc>,
    duration_ms: i64,
) -> Result<()> {
    let task_id = *task_id;
    let settled = ctx
        .tracker
        .update_status(task_id, TaskStatus::Running, TaskStatus::Failed, &TaskTransitionFields {
            completed_at: Some(completed_at),
            duration_ms: Some(duration_ms),
            error: Some(error.clone()),
            ..Default::default()
        })
        .await?;
    if !settled {
        ctx.queue.ack(job.id).await?;
        return Ok(());
    }

    let attempts_used = job.attempt_count + 1;
    if attempts_used < job.max_attempts {
        // Budget remains: reset for the next delivery of this job.
        ctx.tracker.retry(task_id).await?;
        tracing::info!(
            task_id = %task_id,
            attempt = attempts_used,
            error = %error,
            "task failed, retrying"
        );
    } else {
        ctx.audit
            .task_event(
                handle.organization_id,
                "task_execution.failed",
                task_id,
                serde_json::json!({ "error": error, "attempts": attempts_used }),
            )
            .await;
        notify(handle, TaskCompletion {
            task_id,
            status: TaskStatus::Failed,
            output: None,
            error: Some(error.clone()),
        })
        .await;
        tracing::warn!(
            task_id = %task_id,
            attempts = attempts_used,
            error = %error,
            "task failed terminally"
        );
    }

    ctx.queue.nack(job.id, &error).await?;
    Ok(())
}

async fn notify(handle: &RunHandle, completion: TaskCompletion) {
    if handle.completions.send(completion).await.is_err() {
        // Executor already finalized; nothing left to coordinate.
    }
}
