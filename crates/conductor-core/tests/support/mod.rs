//! Shared harness for the engine integration tests: a fresh database and
//! queue, scripted agents, an orchestrator with fast timings, and a bus
//! subscriber for asserting event sequences.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::models::{
    Agent, Organization, RunStatus, TaskExecution, User, WorkflowRun,
};
use conductor_db::queries::runs as run_db;
use conductor_db::queries::tasks as task_db;

use conductor_core::agent::registry::AgentRegistry;
use conductor_core::agent::{AgentHandler, AgentOutcome, TaskContext};
use conductor_core::audit::AuditLogger;
use conductor_core::bus::{BusConfig, ClientMessage, Envelope, NotificationBus};
use conductor_core::executor::ExecutorConfig;
use conductor_core::orchestrator::{Actor, Orchestrator, OrchestratorConfig};
use conductor_core::queue::{BackoffPolicy, DurableQueue, QueueConfig};
use conductor_core::resources::{ResourceLimits, ResourceManager};
use conductor_core::tracker::{TaskTracker, TrackerConfig};

use conductor_test_utils::seed::{seed_agent, seed_org_and_user};
use conductor_test_utils::{create_test_db, drop_test_db, test_db_url};

// ---------------------------------------------------------------------------
// Scripted agents
// ---------------------------------------------------------------------------

/// What a scripted agent does when invoked.
#[derive(Clone)]
pub enum Behavior {
    /// Return this output successfully.
    Succeed(serde_json::Value),
    /// Report `success = false` with this error text.
    Fail(String),
    /// Sleep, then succeed (interruptible by cancellation).
    Sleep(Duration),
    /// Park until the cancellation signal fires.
    Hang,
}

/// A deterministic handler for tests: counts invocations and optionally
/// records the `tag` field of each input in arrival order.
pub struct ScriptedAgent {
    pub behavior: Behavior,
    pub invocations: Arc<AtomicUsize>,
    pub recorded_tags: Option<Arc<Mutex<Vec<String>>>>,
}

impl ScriptedAgent {
    pub fn new(behavior: Behavior) -> (Arc<Self>, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        let agent = Arc::new(Self {
            behavior,
            invocations: Arc::clone(&invocations),
            recorded_tags: None,
        });
        (agent, invocations)
    }

    pub fn recording(
        behavior: Behavior,
    ) -> (Arc<Self>, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        let tags = Arc::new(Mutex::new(Vec::new()));
        let agent = Arc::new(Self {
            behavior,
            invocations: Arc::clone(&invocations),
            recorded_tags: Some(Arc::clone(&tags)),
        });
        (agent, invocations, tags)
    }
}

#[async_trait]
impl AgentHandler for ScriptedAgent {
    fn kind(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, ctx: &TaskContext, cancel: &CancellationToken) -> Result<AgentOutcome> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(tags) = &self.recorded_tags {
            if let Some(tag) = ctx.input.get("tag").and_then(|t| t.as_str()) {
                tags.lock().unwrap().push(tag.to_string());
            }
        }
        match &self.behavior {
            Behavior::Succeed(output) => Ok(AgentOutcome::ok(output.clone())),
            Behavior::Fail(error) => Ok(AgentOutcome::fail(error.clone())),
            Behavior::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(*duration) => Ok(AgentOutcome::ok(serde_json::json!({"slept": true}))),
                    _ = cancel.cancelled() => Ok(AgentOutcome::fail("interrupted")),
                }
            }
            Behavior::Hang => {
                cancel.cancelled().await;
                Ok(AgentOutcome::fail("interrupted"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct HarnessOptions {
    pub worker_count: usize,
    pub max_concurrent_tasks: usize,
    pub max_retries: i32,
    pub timeout_ms: i64,
    pub fail_fast: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            worker_count: 2,
            max_concurrent_tasks: 8,
            max_retries: 1,
            timeout_ms: 10_000,
            fail_fast: true,
        }
    }
}

pub struct Harness {
    pub pool: PgPool,
    pub db_name: String,
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<AgentRegistry>,
    pub bus: Arc<NotificationBus>,
    pub org: Organization,
    pub user: User,
}

impl Harness {
    pub async fn new(options: HarnessOptions) -> Self {
        let (pool, db_name) = create_test_db().await;
        let (org, user) = seed_org_and_user(&pool).await;

        let queue = Arc::new(
            DurableQueue::connect(QueueConfig {
                max_attempts: options.max_retries + 1,
                backoff: BackoffPolicy::Fixed {
                    delay: Duration::from_millis(50),
                },
                visibility_timeout: Duration::from_secs(30),
                poll_interval: Duration::from_millis(25),
                poll_timeout: Duration::from_millis(200),
                ..QueueConfig::new(test_db_url(&db_name).await)
            })
            .await
            .expect("queue should connect"),
        );

        let bus = Arc::new(NotificationBus::new(BusConfig::default()));
        let audit = Arc::new(AuditLogger::new(pool.clone()));
        let tracker = Arc::new(TaskTracker::new(
            pool.clone(),
            Arc::clone(&bus),
            TrackerConfig::default(),
        ));
        let registry = Arc::new(AgentRegistry::new());
        let resources = Arc::new(ResourceManager::new(ResourceLimits {
            max_concurrent_tasks: options.max_concurrent_tasks,
            max_memory_bytes: 8 * 1024 * 1024 * 1024,
            max_cpu_percent: 400.0,
            max_disk_bytes: 64 * 1024 * 1024 * 1024,
        }));

        let orchestrator = Orchestrator::new(
            pool.clone(),
            queue,
            Arc::clone(&registry),
            resources,
            tracker,
            Arc::clone(&bus),
            audit,
            OrchestratorConfig {
                worker_count: options.worker_count,
                default_max_retries: options.max_retries,
                default_timeout_ms: options.timeout_ms,
                allocation_retry_delay: Duration::from_millis(50),
                monitor_interval: Duration::from_secs(3600),
                lease_purge_interval: Duration::from_secs(3600),
                housekeeping_interval: Duration::from_secs(3600),
                drain_grace: Duration::from_secs(5),
                executor: ExecutorConfig {
                    fail_fast: options.fail_fast,
                },
            },
        );

        Self {
            pool,
            db_name,
            orchestrator,
            registry,
            bus,
            org,
            user,
        }
    }

    pub async fn start(&self) {
        self.orchestrator
            .start()
            .await
            .expect("orchestrator should start");
    }

    pub fn actor(&self) -> Actor {
        Actor {
            user_id: self.user.id,
            organization_id: self.org.id,
            role: "admin".to_string(),
            permissions: vec!["workflows:execute".to_string()],
        }
    }

    /// Seed an agent row and bind it to a scripted handler.
    pub async fn scripted_agent(&self, behavior: Behavior) -> (Agent, Arc<AtomicUsize>) {
        let row = seed_agent(&self.pool, self.org.id, "testing").await;
        let (handler, invocations) = ScriptedAgent::new(behavior);
        self.registry.register(row.clone(), handler);
        (row, invocations)
    }

    /// Seed an agent row bound to a handler that records input tags.
    pub async fn recording_agent(
        &self,
        behavior: Behavior,
    ) -> (Agent, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let row = seed_agent(&self.pool, self.org.id, "testing").await;
        let (handler, invocations, tags) = ScriptedAgent::recording(behavior);
        self.registry.register(row.clone(), handler);
        (row, invocations, tags)
    }

    /// Poll until the run reaches a terminal status.
    pub async fn wait_run_terminal(&self, run_id: Uuid, timeout: Duration) -> WorkflowRun {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = run_db::get_run(&self.pool, run_id)
                .await
                .expect("get_run should succeed")
                .expect("run should exist");
            if run.status.is_terminal() {
                return run;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "run {run_id} did not terminate within {timeout:?} (status {})",
                run.status
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Poll until the given task reaches the given status.
    pub async fn wait_task_status(
        &self,
        task_id: Uuid,
        status: conductor_db::models::TaskStatus,
        timeout: Duration,
    ) -> TaskExecution {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = task_db::get_task(&self.pool, task_id)
                .await
                .expect("get_task should succeed")
                .expect("task should exist");
            if task.status == status {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {task_id} did not reach {status} within {timeout:?} (status {})",
                task.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn tasks_for_run(&self, run_id: Uuid) -> Vec<TaskExecution> {
        task_db::list_tasks_for_run(&self.pool, run_id)
            .await
            .expect("list_tasks_for_run should succeed")
    }

    pub async fn teardown(self) {
        self.orchestrator.stop().await;
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

/// Like `seed::seed_workflow`, but each step names its own agent:
/// `(name, order, depends-on indexes, agent id)`.
pub async fn seed_workflow_mixed(
    pool: &PgPool,
    organization_id: Uuid,
    name: &str,
    steps: &[(&str, i32, &[usize], Uuid)],
) -> (
    conductor_db::models::Workflow,
    Vec<conductor_db::models::WorkflowStep>,
) {
    use conductor_db::queries::workflows::{self, NewWorkflowStep};

    let workflow = workflows::insert_workflow(pool, organization_id, name)
        .await
        .expect("insert_workflow should succeed");

    let mut inserted: Vec<conductor_db::models::WorkflowStep> = Vec::with_capacity(steps.len());
    for (step_name, order, dep_indexes, agent_id) in steps {
        let depends_on: Vec<Uuid> = dep_indexes.iter().map(|i| inserted[*i].id).collect();
        let step = workflows::insert_workflow_step(
            pool,
            &NewWorkflowStep {
                workflow_id: workflow.id,
                agent_id: *agent_id,
                name: step_name,
                step_order: *order,
                config: serde_json::json!({}),
                depends_on: &depends_on,
            },
        )
        .await
        .expect("insert_workflow_step should succeed");
        inserted.push(step);
    }

    (workflow, inserted)
}

pub fn expect_terminal(run: &WorkflowRun, status: RunStatus) {
    assert_eq!(
        run.status, status,
        "run {} should be {status}, error: {:?}",
        run.id, run.error
    );
}

// ---------------------------------------------------------------------------
// Event collection
// ---------------------------------------------------------------------------

/// A bus subscriber that records envelopes for sequence assertions.
pub struct EventCollector {
    rx: mpsc::Receiver<Envelope>,
}

impl EventCollector {
    /// Open a connection subscribed to the given channels; the welcome
    /// message is consumed here.
    pub async fn subscribe(bus: &NotificationBus, channels: &[&str]) -> Self {
        let (id, mut rx) = bus.open();
        let welcome = rx.recv().await.expect("welcome should arrive");
        assert_eq!(welcome.kind, "welcome");
        for channel in channels {
            bus.handle_client_message(id, ClientMessage::Subscribe {
                channel: channel.to_string(),
            });
        }
        Self { rx }
    }

    /// Receive the next envelope, or panic after the timeout.
    pub async fn next(&mut self, timeout: Duration) -> Envelope {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus connection closed")
    }

    /// Drain events until one matches `kind`, returning the whole prefix
    /// (inclusive).
    pub async fn collect_until(&mut self, kind: &str, timeout: Duration) -> Vec<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut out = Vec::new();
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            let envelope = self.next(remaining.max(Duration::from_millis(1))).await;
            let done = envelope.kind == kind;
            out.push(envelope);
            if done {
                return out;
            }
        }
    }

    /// Assert no further event arrives within the window.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(envelope)) = tokio::time::timeout(window, self.rx.recv()).await {
            panic!("unexpected event after terminal: {}", envelope.kind);
        }
    }
}
