//! Per-run workflow executor.
//!
//! One executor instance coordinates one run: it walks the plan's step DAG,
//! enqueues ready steps, waits for completion notifications from the worker
//! pool, cascades skips on terminal failure, propagates cancellation, and
//! finalizes the run with a single terminal lifecycle event.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::models::{RunStatus, TaskStatus};
use conductor_db::queries::runs::{self as run_db, RunTransitionFields};
use conductor_db::queries::tasks::TaskTransitionFields;

use crate::audit::AuditLogger;
use crate::bus::NotificationBus;
use crate::events::{Event, EventKind};
use crate::plan::{merge_outputs, PlanStep, RunPlan};
use crate::queue::{DurableQueue, NewJob};
use crate::state::RunStateMachine;
use crate::tracker::TaskTracker;

/// Per-run execution policy.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// On a terminal step failure, cancel everything still outstanding
    /// instead of letting independent branches finish.
    pub fail_fast: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { fail_fast: true }
    }
}

/// Notification sent by a worker when a dispatched task reaches a terminal
/// state.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Executes one run to completion.
pub struct WorkflowExecutor {
    pool: PgPool,
    queue: Arc<DurableQueue>,
    tracker: Arc<TaskTracker>,
    bus: Arc<NotificationBus>,
    audit: Arc<AuditLogger>,
    plan: RunPlan,
    cancel: CancellationToken,
    completions: mpsc::Receiver<TaskCompletion>,
    config: ExecutorConfig,
}

/// Mutable scheduling state for one run, keyed by step ID.
#[derive(Default)]
struct ScheduleState {
    dispatched: HashSet<Uuid>,
    running: HashSet<Uuid>,
    done: HashMap<Uuid, serde_json::Value>,
    failed: HashSet<Uuid>,
    skipped: HashSet<Uuid>,
    cancelled: HashSet<Uuid>,
    /// `(step name, error text)` of the first terminal failure.
    first_failure: Option<(String, String)>,
    external_cancel: bool,
}

impl ScheduleState {
    fn terminal_count(&self) -> usize {
        self.done.len() + self.failed.len() + self.skipped.len() + self.cancelled.len()
    }

    fn is_settled(&self, step_id: Uuid) -> bool {
        self.done.contains_key(&step_id)
            || self.failed.contains(&step_id)
            || self.skipped.contains(&step_id)
            || self.cancelled.contains(&step_id)
    }
}

impl WorkflowExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        queue: Arc<DurableQueue>,
        tracker: Arc<TaskTracker>,
        bus: Arc<NotificationBus>,
        audit: Arc<AuditLogger>,
        plan: RunPlan,
        cancel: CancellationToken,
        completions: mpsc::Receiver<TaskCompletion>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            tracker,
            bus,
            audit,
            plan,
            cancel,
            completions,
            config,
        }
    }

    /// Drive the run to a terminal status.
    pub async fn run(mut self) -> Result<RunStatus> {
        let run_id = self.plan.run_id;

        let became_running = RunStateMachine::transition(
            &self.pool,
            run_id,
            RunStatus::Pending,
            RunStatus::Running,
            &RunTransitionFields {
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await?;

        if !became_running {
            // A cancel won the race before the run began; whoever won also
            // finalized the tasks and published the terminal event.
            let run = run_db::get_run(&self.pool, run_id)
                .await?
                .with_context(|| format!("run {run_id} disappeared"))?;
            tracing::info!(run_id = %run_id, status = %run.status, "run was finalized before start");
            return Ok(run.status);
        }

        self.publish_run_event(EventKind::WorkflowRunning, serde_json::json!({}));
        tracing::info!(
            run_id = %run_id,
            steps = self.plan.steps.len(),
            sequential = self.plan.sequential,
            "run started"
        );

        let mut state = ScheduleState::default();

        loop {
            if self.cancel.is_cancelled()
                && !state.external_cancel
                && state.first_failure.is_none()
            {
                state.external_cancel = true;
                self.cancel_outstanding(&mut state).await?;
            }

            let dispatch_allowed = !state.external_cancel
                && (state.first_failure.is_none() || !self.config.fail_fast);
            if dispatch_allowed {
                self.dispatch_ready(&mut state).await?;
            }

            if state.terminal_count() == self.plan.steps.len() && state.running.is_empty() {
                break;
            }

            if state.running.is_empty() {
                // Nothing in flight and nothing dispatchable: every
                // remaining step is blocked behind a failure or the run is
                // winding down. Resolve the stragglers and finish.
                self.cancel_outstanding(&mut state).await?;
                if state.terminal_count() == self.plan.steps.len() {
                    break;
                }
                bail!("run {run_id} stalled with unresolved steps");
            }

            tokio::select! {
                completion = self.completions.recv() => {
                    let Some(completion) = completion else {
                        bail!("completion channel for run {run_id} closed unexpectedly");
                    };
                    self.handle_completion(&mut state, completion).await?;
                }
                _ = self.cancel.cancelled(), if !state.external_cancel && state.first_failure.is_none() => {
                    // Handled at the top of the loop.
                }
            }
        }

        self.finalize(state).await
    }

    /// Enqueue every step whose dependencies are all satisfied, in
    /// ascending step order.
    async fn dispatch_ready(&self, state: &mut ScheduleState) -> Result<()> {
        let ready: Vec<PlanStep> = self
            .plan
            .steps
            .iter()
            .filter(|s| !state.dispatched.contains(&s.step_id) && !state.is_settled(s.step_id))
            .filter(|s| s.depends_on.iter().all(|d| state.done.contains_key(d)))
            .cloned()
            .collect();

        for step in ready {
            let dep_outputs = step.depends_on.iter().filter_map(|dep| {
                let dep_step = self.plan.step(*dep)?;
                let output = state.done.get(dep)?;
                Some((dep_step.slug.clone(), output.clone()))
            });
            let input = merge_outputs(&self.plan.input, dep_outputs);

            self.queue
                .enqueue(
                    &NewJob {
                        run_id: self.plan.run_id,
                        task_id: step.task_id,
                        agent_id: step.agent_id,
                        payload: input,
                        max_attempts: step.max_retries + 1,
                    },
                    Duration::ZERO,
                    self.plan.priority.weight(),
                )
                .await
                .with_context(|| format!("failed to enqueue step {}", step.name))?;

            tracing::debug!(
                run_id = %self.plan.run_id,
                step = %step.name,
                order = step.order,
                "step dispatched"
            );
            state.dispatched.insert(step.step_id);
            state.running.insert(step.step_id);
        }
        Ok(())
    }

    /// Fold one worker notification into the schedule.
    async fn handle_completion(
        &self,
        state: &mut ScheduleState,
        completion: TaskCompletion,
    ) -> Result<()> {
        let Some(step) = self.plan.step_for_task(completion.task_id) else {
            tracing::warn!(task_id = %completion.task_id, "completion for unknown task");
            return Ok(());
        };
        let step = step.clone();
        state.running.remove(&step.step_id);

        match completion.status {
            TaskStatus::Completed => {
                let output = completion.output.unwrap_or(serde_json::Value::Null);
                state.done.insert(step.step_id, output);
            }
            TaskStatus::Failed => {
                state.failed.insert(step.step_id);
                if state.first_failure.is_none() {
                    let error = completion
                        .error
                        .unwrap_or_else(|| "task failed".to_string());
                    state.first_failure = Some((step.name.clone(), error));
                }
                self.cascade_skip(state, step.step_id).await?;
                if self.config.fail_fast {
                    // Stop everything else; in-flight agents observe the
                    // token, undispatched work is cancelled here.
                    self.cancel.cancel();
                    self.cancel_outstanding(state).await?;
                }
            }
            TaskStatus::Cancelled => {
                state.cancelled.insert(step.step_id);
            }
            other => {
                tracing::warn!(
                    task_id = %completion.task_id,
                    status = %other,
                    "unexpected completion status"
                );
            }
        }
        Ok(())
    }

    /// Mark every transitive dependent of a failed step `skipped`.
    async fn cascade_skip(&self, state: &mut ScheduleState, failed_step: Uuid) -> Result<()> {
        for dependent in self.plan.transitive_dependents(failed_step) {
            if state.is_settled(dependent) || state.dispatched.contains(&dependent) {
                continue;
            }
            let Some(step) = self.plan.step(dependent) else {
                continue;
            };
            let skipped = self
                .tracker
                .update_status(
                    step.task_id,
                    TaskStatus::Pending,
                    TaskStatus::Skipped,
                    &TaskTransitionFields {
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            if skipped {
                state.skipped.insert(dependent);
            }
        }
        Ok(())
    }

    /// Cancel every unsettled step whose task is still `pending`. Steps a
    /// worker already owns keep running until the cancellation token reaches
    /// their agent invocation; they resolve through the worker's completion
    /// notification.
    async fn cancel_outstanding(&self, state: &mut ScheduleState) -> Result<()> {
        for step in &self.plan.steps {
            if state.is_settled(step.step_id) {
                continue;
            }
            let cancelled = self
                .tracker
                .update_status(
                    step.task_id,
                    TaskStatus::Pending,
                    TaskStatus::Cancelled,
                    &TaskTransitionFields {
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            if cancelled {
                state.cancelled.insert(step.step_id);
                state.running.remove(&step.step_id);
            }
        }
        Ok(())
    }

    /// CAS the run into its terminal status and publish the single terminal
    /// lifecycle event.
    async fn finalize(&self, state: ScheduleState) -> Result<RunStatus> {
        let run_id = self.plan.run_id;
        let completed_at = Utc::now();

        let run = run_db::get_run(&self.pool, run_id)
            .await?
            .with_context(|| format!("run {run_id} disappeared"))?;
        let duration_ms = run
            .started_at
            .map(|s| (completed_at - s).num_milliseconds());

        let (to, fields, kind) = if state.external_cancel {
            (
                RunStatus::Cancelled,
                RunTransitionFields {
                    completed_at: Some(completed_at),
                    duration_ms,
                    ..Default::default()
                },
                EventKind::WorkflowCancelled,
            )
        } else if let Some((step_name, error)) = &state.first_failure {
            (
                RunStatus::Failed,
                RunTransitionFields {
                    completed_at: Some(completed_at),
                    duration_ms,
                    error: Some(format!("{step_name}: {error}")),
                    ..Default::default()
                },
                EventKind::WorkflowFailed,
            )
        } else {
            let outputs = self.plan.steps.iter().filter_map(|step| {
                let output = state.done.get(&step.step_id)?;
                Some((step.slug.clone(), output.clone()))
            });
            (
                RunStatus::Completed,
                RunTransitionFields {
                    completed_at: Some(completed_at),
                    duration_ms,
                    output: Some(merge_outputs(&self.plan.input, outputs)),
                    ..Default::default()
                },
                EventKind::WorkflowCompleted,
            )
        };

        let transitioned =
            RunStateMachine::transition(&self.pool, run_id, RunStatus::Running, to, &fields)
                .await?;
        if !transitioned {
            let current = run_db::get_run(&self.pool, run_id)
                .await?
                .with_context(|| format!("run {run_id} disappeared"))?;
            tracing::warn!(run_id = %run_id, status = %current.status, "finalize lost the CAS");
            return Ok(current.status);
        }

        let mut data = serde_json::json!({ "status": to });
        if let Some(output) = &fields.output {
            data["output"] = output.clone();
        }
        if let Some(error) = &fields.error {
            data["error"] = serde_json::Value::String(error.clone());
        }
        self.publish_run_event(kind, data);

        self.audit
            .run_event(
                self.plan.organization_id,
                None,
                match to {
                    RunStatus::Completed => "workflow_run.completed",
                    RunStatus::Cancelled => "workflow_run.cancelled",
                    _ => "workflow_run.failed",
                },
                run_id,
                serde_json::json!({ "duration_ms": duration_ms }),
            )
            .await;

        tracing::info!(run_id = %run_id, status = %to, "run finalized");
        Ok(to)
    }

    fn publish_run_event(&self, kind: EventKind, mut data: serde_json::Value) {
        if let serde_json::Value::Object(map) = &mut data {
            map.insert(
                "run_id".to_string(),
                serde_json::Value::String(self.plan.run_id.to_string()),
            );
            map.insert(
                "workflow_id".to_string(),
                serde_json::Value::String(self.plan.workflow_id.to_string()),
            );
        }
        self.bus.publish(&Event::new(
            kind,
            Some(self.plan.organization_id),
            self.plan.run_id,
            data,
        ));
    }
}
