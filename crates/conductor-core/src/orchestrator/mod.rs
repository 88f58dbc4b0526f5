//! Top-level orchestrator: run lifecycle, worker pool, and the background
//! loops (resource monitor, lease purge, bus reaper, housekeeping).
//!
//! The orchestrator is constructed per process with explicit `start` and
//! `stop`; tests build fresh instances rather than sharing globals.

mod worker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::models::{
    RunPriority, RunStatus, TaskExecution, WorkflowRun, WorkflowStatus,
};
use conductor_db::queries::organizations as org_db;
use conductor_db::queries::runs::{self as run_db, NewRun, RunTransitionFields};
use conductor_db::queries::workflows as workflow_db;

use crate::agent::registry::AgentRegistry;
use crate::audit::{AuditLogger, Severity};
use crate::bus::NotificationBus;
use crate::error::OrchestratorError;
use crate::events::{Event, EventKind};
use crate::executor::{ExecutorConfig, TaskCompletion, WorkflowExecutor};
use crate::plan::RunPlan;
use crate::queue::DurableQueue;
use crate::resources::{ResourceEvent, ResourceManager};
use crate::state::RunStateMachine;
use crate::tracker::TaskTracker;

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Size of the job-consuming worker pool.
    pub worker_count: usize,
    /// Retry budget stamped onto each task at run creation.
    pub default_max_retries: i32,
    /// Per-task timeout stamped onto each task at run creation.
    pub default_timeout_ms: i64,
    /// Delay before a resource-denied job becomes available again.
    pub allocation_retry_delay: Duration,
    /// Resource monitor sampling period.
    pub monitor_interval: Duration,
    /// How often expired queue leases are purged.
    pub lease_purge_interval: Duration,
    /// How often settled tasks are evicted and audit retention enforced.
    pub housekeeping_interval: Duration,
    /// How long `stop` waits for in-flight runs to finalize.
    pub drain_grace: Duration,
    pub executor: ExecutorConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            default_max_retries: 3,
            default_timeout_ms: 300_000,
            allocation_retry_delay: Duration::from_millis(500),
            monitor_interval: Duration::from_secs(10),
            lease_purge_interval: Duration::from_secs(30),
            housekeeping_interval: Duration::from_secs(300),
            drain_grace: Duration::from_secs(10),
            executor: ExecutorConfig::default(),
        }
    }
}

/// The authenticated principal an operation runs as.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub role: String,
    pub permissions: Vec<String>,
}

/// Per-run coordination state shared between the orchestrator and workers.
#[derive(Clone)]
pub(crate) struct RunHandle {
    pub cancel: CancellationToken,
    pub completions: mpsc::Sender<TaskCompletion>,
    pub organization_id: Uuid,
}

/// Live runs, keyed by run ID.
#[derive(Default)]
pub(crate) struct RunTable {
    inner: Mutex<HashMap<Uuid, RunHandle>>,
}

impl RunTable {
    fn insert(&self, run_id: Uuid, handle: RunHandle) {
        self.inner
            .lock()
            .expect("run table lock poisoned")
            .insert(run_id, handle);
    }

    fn remove(&self, run_id: Uuid) {
        self.inner
            .lock()
            .expect("run table lock poisoned")
            .remove(&run_id);
    }

    pub(crate) fn get(&self, run_id: Uuid) -> Option<RunHandle> {
        self.inner
            .lock()
            .expect("run table lock poisoned")
            .get(&run_id)
            .cloned()
    }

    fn cancel_token(&self, run_id: Uuid) -> Option<CancellationToken> {
        self.get(run_id).map(|h| h.cancel)
    }

    fn all_tokens(&self) -> Vec<CancellationToken> {
        self.inner
            .lock()
            .expect("run table lock poisoned")
            .values()
            .map(|h| h.cancel.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().expect("run table lock poisoned").len()
    }
}

/// Top-level coordinator for one orchestrator instance.
pub struct Orchestrator {
    pool: PgPool,
    queue: Arc<DurableQueue>,
    registry: Arc<AgentRegistry>,
    resources: Arc<ResourceManager>,
    tracker: Arc<TaskTracker>,
    bus: Arc<NotificationBus>,
    audit: Arc<AuditLogger>,
    config: OrchestratorConfig,
    runs: Arc<RunTable>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        queue: Arc<DurableQueue>,
        registry: Arc<AgentRegistry>,
        resources: Arc<ResourceManager>,
        tracker: Arc<TaskTracker>,
        bus: Arc<NotificationBus>,
        audit: Arc<AuditLogger>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            queue,
            registry,
            resources,
            tracker,
            bus,
            audit,
            config,
            runs: Arc::new(RunTable::default()),
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    /// Number of runs currently coordinated by this instance.
    pub fn live_runs(&self) -> usize {
        self.runs.len()
    }

    /// Run the recovery sweep and start the worker pool and background
    /// loops. Call once.
    pub async fn start(&self) -> Result<()> {
        self.recovery_sweep().await?;

        let mut background = self.background.lock().expect("background lock poisoned");

        for i in 0..self.config.worker_count {
            let ctx = worker::WorkerContext {
                pool: self.pool.clone(),
                queue: Arc::clone(&self.queue),
                registry: Arc::clone(&self.registry),
                resources: Arc::clone(&self.resources),
                tracker: Arc::clone(&self.tracker),
                audit: Arc::clone(&self.audit),
                runs: Arc::clone(&self.runs),
                shutdown: self.shutdown.clone(),
                allocation_retry_delay: self.config.allocation_retry_delay,
            };
            background.push(tokio::spawn(worker::worker_loop(format!("worker-{i}"), ctx)));
        }

        background.push(Arc::clone(&self.resources).spawn_monitor(
            self.pool.clone(),
            self.config.monitor_interval,
            self.shutdown.clone(),
        ));
        background.push(Arc::clone(&self.bus).spawn_reaper(self.shutdown.clone()));
        background.push(self.spawn_lease_purger());
        background.push(self.spawn_housekeeping());
        background.push(self.spawn_resource_auditor());

        tracing::info!(
            workers = self.config.worker_count,
            "orchestrator started"
        );
        Ok(())
    }

    /// Fail every run left `running` by a previous instance, along with its
    /// non-terminal tasks. Mid-flight runs are not resumed.
    async fn recovery_sweep(&self) -> Result<()> {
        let stale = run_db::list_running_runs(&self.pool).await?;
        for run in stale {
            let failed = conductor_db::queries::tasks::fail_nonterminal_tasks_for_run(
                &self.pool,
                run.id,
                "orchestrator_restart",
            )
            .await?;

            RunStateMachine::transition(
                &self.pool,
                run.id,
                RunStatus::Running,
                RunStatus::Failed,
                &RunTransitionFields {
                    completed_at: Some(Utc::now()),
                    error: Some("orchestrator_restart".to_string()),
                    ..Default::default()
                },
            )
            .await?;

            let organization_id = run_db::get_run_organization(&self.pool, run.id).await?;
            if let Some(org) = organization_id {
                self.audit
                    .run_event(
                        org,
                        None,
                        "workflow_run.recovery_failed",
                        run.id,
                        serde_json::json!({ "tasks_failed": failed.len() }),
                    )
                    .await;
                self.bus.publish(&Event::new(
                    EventKind::WorkflowFailed,
                    Some(org),
                    run.id,
                    serde_json::json!({
                        "run_id": run.id,
                        "status": RunStatus::Failed,
                        "error": "orchestrator_restart",
                    }),
                ));
            }

            tracing::warn!(
                run_id = %run.id,
                tasks_failed = failed.len(),
                "recovered stale run as failed"
            );
        }
        Ok(())
    }

    /// Validate tenancy and workflow state, create the run snapshot, and
    /// hand it to a fresh executor.
    pub async fn submit_run(
        &self,
        actor: &Actor,
        workflow_id: Uuid,
        input: serde_json::Value,
        priority: RunPriority,
    ) -> Result<WorkflowRun, OrchestratorError> {
        let workflow = workflow_db::get_workflow(&self.pool, workflow_id)
            .await
            .map_err(OrchestratorError::Internal)?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("workflow {workflow_id} not found"))
            })?;

        if workflow.organization_id != actor.organization_id {
            self.audit
                .security_event(
                    Some(actor.organization_id),
                    Some(actor.user_id),
                    "workflow_run.denied",
                    Severity::High,
                    serde_json::json!({
                        "workflow_id": workflow_id,
                        "reason": "organization_mismatch",
                    }),
                    None,
                )
                .await;
            return Err(OrchestratorError::Forbidden(
                "workflow does not belong to your organization".to_string(),
            ));
        }

        if workflow.status != WorkflowStatus::Active {
            return Err(OrchestratorError::Validation(format!(
                "workflow {workflow_id} is disabled"
            )));
        }

        let organization = org_db::get_organization(&self.pool, actor.organization_id)
            .await
            .map_err(OrchestratorError::Internal)?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "organization {} not found",
                    actor.organization_id
                ))
            })?;

        let active = run_db::count_active_runs_for_org(&self.pool, organization.id)
            .await
            .map_err(OrchestratorError::Internal)?;
        if active >= organization.max_concurrent_runs as i64 {
            return Err(OrchestratorError::Validation(format!(
                "concurrent run limit reached ({})",
                organization.max_concurrent_runs
            )));
        }

        let steps = workflow_db::get_workflow_steps(&self.pool, workflow_id)
            .await
            .map_err(OrchestratorError::Internal)?;

        let (run, tasks) = run_db::create_run(&self.pool, &NewRun {
            workflow_id,
            submitted_by: actor.user_id,
            organization_id: actor.organization_id,
            input,
            priority,
            max_retries: self.config.default_max_retries,
            timeout_ms: self.config.default_timeout_ms,
        })
        .await
        .map_err(|e| OrchestratorError::Validation(format!("{e:#}")))?;

        let plan = RunPlan::build(&run, organization.id, &steps, &tasks)
            .map_err(|e| OrchestratorError::Validation(format!("{e:#}")))?;

        for task in &tasks {
            self.tracker.register(task, organization.id, run.priority);
        }

        self.bus.publish(&Event::new(
            EventKind::WorkflowStarted,
            Some(organization.id),
            run.id,
            serde_json::json!({
                "run_id": run.id,
                "workflow_id": workflow_id,
                "priority": run.priority,
            }),
        ));
        self.audit
            .run_event(
                organization.id,
                Some(actor.user_id),
                "workflow_run.submitted",
                run.id,
                serde_json::json!({
                    "workflow_id": workflow_id,
                    "priority": run.priority,
                    "tasks": tasks.len(),
                }),
            )
            .await;

        self.spawn_executor(plan, tasks.len());
        tracing::info!(run_id = %run.id, workflow_id = %workflow_id, "run submitted");
        Ok(run)
    }

    fn spawn_executor(&self, plan: RunPlan, task_count: usize) {
        let run_id = plan.run_id;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(task_count.max(8));

        self.runs.insert(run_id, RunHandle {
            cancel: cancel.clone(),
            completions: tx,
            organization_id: plan.organization_id,
        });

        let executor = WorkflowExecutor::new(
            self.pool.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.tracker),
            Arc::clone(&self.bus),
            Arc::clone(&self.audit),
            plan,
            cancel,
            rx,
            self.config.executor.clone(),
        );

        let runs = Arc::clone(&self.runs);
        tokio::spawn(async move {
            if let Err(e) = executor.run().await {
                tracing::error!(run_id = %run_id, error = %e, "executor failed");
            }
            runs.remove(run_id);
        });
    }

    /// Cancel a run: signal its executor when live, or CAS a `pending` run
    /// terminal directly.
    pub async fn cancel_run(
        &self,
        actor: Option<&Actor>,
        run_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        let run = run_db::get_run(&self.pool, run_id)
            .await
            .map_err(OrchestratorError::Internal)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {run_id} not found")))?;

        let organization_id = run_db::get_run_organization(&self.pool, run_id)
            .await
            .map_err(OrchestratorError::Internal)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {run_id} not found")))?;

        if let Some(actor) = actor {
            if actor.organization_id != organization_id {
                self.audit
                    .security_event(
                        Some(actor.organization_id),
                        Some(actor.user_id),
                        "workflow_run.cancel_denied",
                        Severity::Medium,
                        serde_json::json!({
                            "run_id": run_id,
                            "reason": "organization_mismatch",
                        }),
                        None,
                    )
                    .await;
                return Err(OrchestratorError::Forbidden(
                    "run does not belong to your organization".to_string(),
                ));
            }
        }

        if let Some(token) = self.runs.cancel_token(run_id) {
            token.cancel();
            self.audit
                .run_event(
                    organization_id,
                    actor.map(|a| a.user_id),
                    "workflow_run.cancel_requested",
                    run_id,
                    serde_json::json!({}),
                )
                .await;
            return Ok(());
        }

        match run.status {
            RunStatus::Pending => {
                let cancelled = RunStateMachine::transition(
                    &self.pool,
                    run_id,
                    RunStatus::Pending,
                    RunStatus::Cancelled,
                    &RunTransitionFields {
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await
                .map_err(OrchestratorError::Internal)?;
                if !cancelled {
                    return Err(OrchestratorError::Conflict(format!(
                        "run {run_id} is already terminal"
                    )));
                }

                let tasks = conductor_db::queries::tasks::list_tasks_for_run(&self.pool, run_id)
                    .await
                    .map_err(OrchestratorError::Internal)?;
                for task in tasks {
                    self.cancel_detached_task(&task).await?;
                }

                self.bus.publish(&Event::new(
                    EventKind::WorkflowCancelled,
                    Some(organization_id),
                    run_id,
                    serde_json::json!({ "run_id": run_id, "status": RunStatus::Cancelled }),
                ));
                self.audit
                    .run_event(
                        organization_id,
                        actor.map(|a| a.user_id),
                        "workflow_run.cancelled",
                        run_id,
                        serde_json::json!({}),
                    )
                    .await;
                Ok(())
            }
            RunStatus::Running => Err(OrchestratorError::Conflict(format!(
                "run {run_id} is not coordinated by this instance"
            ))),
            _ => Err(OrchestratorError::Conflict(format!(
                "run {run_id} is already {}",
                run.status
            ))),
        }
    }

    /// Cancel one task of a run that has no live executor. Goes through the
    /// tracker when the task is known to it, straight to the store
    /// otherwise (e.g. a run submitted by a previous instance).
    async fn cancel_detached_task(&self, task: &TaskExecution) -> Result<(), OrchestratorError> {
        if self.tracker.get(task.id).is_some() {
            self.tracker
                .cancel(task.id)
                .await
                .map_err(OrchestratorError::Internal)?;
            return Ok(());
        }
        if task.status == conductor_db::models::TaskStatus::Pending {
            crate::state::TaskStateMachine::transition(
                &self.pool,
                task.id,
                conductor_db::models::TaskStatus::Pending,
                conductor_db::models::TaskStatus::Cancelled,
                &conductor_db::queries::tasks::TaskTransitionFields {
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .map_err(OrchestratorError::Internal)?;
        }
        Ok(())
    }

    /// A run with its tasks, scoped to the actor's organization when an
    /// actor is given.
    pub async fn run_status(
        &self,
        actor: Option<&Actor>,
        run_id: Uuid,
    ) -> Result<(WorkflowRun, Vec<TaskExecution>), OrchestratorError> {
        let organization_id = run_db::get_run_organization(&self.pool, run_id)
            .await
            .map_err(OrchestratorError::Internal)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {run_id} not found")))?;

        if let Some(actor) = actor {
            if actor.organization_id != organization_id {
                return Err(OrchestratorError::NotFound(format!(
                    "run {run_id} not found"
                )));
            }
        }

        run_db::get_run_with_tasks(&self.pool, run_id)
            .await
            .map_err(OrchestratorError::Internal)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {run_id} not found")))
    }

    /// Signal cancellation to every run, wait out the grace period, and
    /// stop the background loops.
    pub async fn stop(&self) {
        tracing::info!("orchestrator stopping");
        for token in self.runs.all_tokens() {
            token.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.config.drain_grace;
        while self.runs.len() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.runs.len() > 0 {
            tracing::warn!(remaining = self.runs.len(), "drain grace expired");
        }

        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut background = self.background.lock().expect("background lock poisoned");
            background.drain(..).collect()
        };
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                tracing::warn!("background task did not stop within grace");
            }
        }

        self.queue.close().await;
        tracing::info!("orchestrator stopped");
    }

    fn spawn_lease_purger(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let interval = self.config.lease_purge_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => break,
                }
                match queue.purge_expired_leases().await {
                    Ok(0) => {}
                    Ok(count) => tracing::warn!(count, "restored expired job leases"),
                    Err(e) => tracing::warn!(error = %e, "lease purge failed"),
                }
            }
        })
    }

    fn spawn_housekeeping(&self) -> JoinHandle<()> {
        let tracker = Arc::clone(&self.tracker);
        let audit = Arc::clone(&self.audit);
        let interval = self.config.housekeeping_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => break,
                }
                let evicted = tracker.evict_settled(Utc::now());
                if evicted > 0 {
                    tracing::debug!(count = evicted, "settled tasks moved to history");
                }
                audit.prune_per_retention().await;
            }
        })
    }

    /// Forward resource warnings into the audit trail.
    fn spawn_resource_auditor(&self) -> JoinHandle<()> {
        let audit = Arc::clone(&self.audit);
        let shutdown = self.shutdown.clone();
        let mut events = self.resources.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ResourceEvent::Warning { resource, pct }) => {
                            audit.resource_warning(resource, pct).await;
                        }
                        Ok(ResourceEvent::LimitsUpdated) => {
                            tracing::info!("resource limits updated");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}
