//! HTTP surface: health probes, agent catalog views, and the workflow
//! execute/status/cancel operations.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sysinfo::System;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use conductor_core::audit::AuditLogger;
use conductor_core::bus::NotificationBus;
use conductor_core::error::OrchestratorError;
use conductor_core::orchestrator::Orchestrator;
use conductor_db::models::{Agent, RunPriority, TaskExecution, WorkflowRun};

use crate::auth::AuthContext;
use crate::config::ServerConfig;
use crate::ws;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub pool: PgPool,
    pub bus: Arc<NotificationBus>,
    pub audit: Arc<AuditLogger>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
    code: Option<&'static str>,
}

impl AppError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: msg.into(),
            code: Some("unauthorized"),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
            code: Some("validation_error"),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
            code: Some("internal_error"),
        }
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::Validation(_) | OrchestratorError::Conflict(_) => {
                StatusCode::BAD_REQUEST
            }
            OrchestratorError::Forbidden(_) => StatusCode::FORBIDDEN,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
            code: Some(err.code()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        // Security events never leak stack traces; the message is the
        // operator-facing line only.
        let mut body = serde_json::json!({
            "error": self
                .status
                .canonical_reason()
                .unwrap_or("error"),
            "message": self.message,
            "requestId": Uuid::new_v4(),
        });
        if let Some(code) = self.code {
            body["code"] = serde_json::Value::String(code.to_string());
        }
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub workflow_id: Uuid,
    pub input: Option<serde_json::Value>,
    pub priority: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub workflow_run_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RunStatusResponse {
    #[serde(flatten)]
    pub run: WorkflowRun,
    pub tasks: Vec<TaskExecution>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsStatusResponse {
    pub agents: Vec<Agent>,
    pub total_agents: usize,
    pub active_agents: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningTaskView {
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    pub agent_id: Uuid,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTasksResponse {
    pub running_tasks: Vec<RunningTaskView>,
    pub total_running: usize,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/agents/status", get(agents_status))
        .route("/agents/tasks", get(agents_tasks))
        .route("/workflows/execute", post(execute_workflow))
        .route("/workflows/{run_id}/status", get(run_status))
        .route("/workflows/{run_id}/cancel", post(cancel_run))
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "uptime": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now(),
    }))
}

async fn health_detailed(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let queue_stats = state
        .orchestrator
        .queue()
        .stats()
        .await
        .map_err(AppError::internal)?;

    let mut sys = System::new();
    sys.refresh_memory();

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "uptime": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now(),
        "queue": queue_stats,
        "subscribers": state.bus.stats(),
        "liveRuns": state.orchestrator.live_runs(),
        "tasks": state.orchestrator.tracker().metrics(),
        "utilization": state.orchestrator.resources().utilization(),
        "memory": {
            "total_bytes": sys.total_memory(),
            "used_bytes": sys.used_memory(),
        },
    })))
}

async fn agents_status(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Json<AgentsStatusResponse> {
    let agents = state.orchestrator.registry().list();
    let active = agents
        .iter()
        .filter(|a| a.status == conductor_db::models::AgentStatus::Active)
        .count();
    Json(AgentsStatusResponse {
        total_agents: agents.len(),
        active_agents: active,
        agents,
    })
}

async fn agents_tasks(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Json<AgentTasksResponse> {
    let running: Vec<RunningTaskView> = state
        .orchestrator
        .tracker()
        .running()
        .into_iter()
        .map(|t| RunningTaskView {
            task_id: t.id,
            run_id: t.run_id,
            name: t.name,
            agent_id: t.agent_id,
            started_at: t.started_at,
        })
        .collect();
    Json(AgentTasksResponse {
        total_running: running.len(),
        running_tasks: running,
    })
}

async fn execute_workflow(
    State(state): State<AppState>,
    AuthContext(actor): AuthContext,
    Json(request): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<ExecuteResponse>), AppError> {
    let priority = match &request.priority {
        Some(raw) => raw
            .parse::<RunPriority>()
            .map_err(|e| AppError::bad_request(e.to_string()))?,
        None => RunPriority::Normal,
    };
    let input = request.input.unwrap_or(serde_json::json!({}));

    let run = state
        .orchestrator
        .submit_run(&actor, request.workflow_id, input, priority)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ExecuteResponse {
            workflow_run_id: run.id,
            status: "started",
        }),
    ))
}

async fn run_status(
    State(state): State<AppState>,
    AuthContext(actor): AuthContext,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunStatusResponse>, AppError> {
    let (run, tasks) = state
        .orchestrator
        .run_status(Some(&actor), run_id)
        .await?;
    Ok(Json(RunStatusResponse { run, tasks }))
}

async fn cancel_run(
    State(state): State<AppState>,
    AuthContext(actor): AuthContext,
    Path(run_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.orchestrator.cancel_run(Some(&actor), run_id).await?;
    Ok(Json(serde_json::json!({
        "message": format!("cancellation requested for run {run_id}")
    })))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sqlx::PgPool;
    use tower::ServiceExt;

    use conductor_core::agent::registry::AgentRegistry;
    use conductor_core::audit::AuditLogger;
    use conductor_core::bus::{BusConfig, NotificationBus};
    use conductor_core::orchestrator::{Orchestrator, OrchestratorConfig};
    use conductor_core::queue::{BackoffPolicy, DurableQueue, QueueConfig};
    use conductor_core::resources::{ResourceLimits, ResourceManager};
    use conductor_core::tracker::{TaskTracker, TrackerConfig};
    use conductor_test_utils::seed::{seed_agent, seed_org_and_user, seed_workflow};
    use conductor_test_utils::{create_test_db, drop_test_db, test_db_url};

    use crate::auth::{issue_token, Claims};
    use crate::config::{Environment, ServerConfig};

    use super::*;

    const SECRET: &str = "route-testing-secret-key-of-decent-length";

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            host: "localhost".to_string(),
            environment: Environment::Test,
            database_url: String::new(),
            queue_url: String::new(),
            queue_concurrency: 2,
            task_timeout: Duration::from_secs(30),
            max_retries: 1,
            memory_limit_mb: 512,
            queue_max_attempts: 2,
            queue_backoff: BackoffPolicy::Fixed {
                delay: Duration::from_millis(50),
            },
            jwt_secret: SECRET.to_string(),
            cors_origins: vec![],
            rate_limit_max: 100,
            rate_limit_window: Duration::from_secs(900),
            log_level: "info".to_string(),
            enable_websockets: true,
            enable_real_time_monitoring: true,
            enable_workflow_caching: false,
        }
    }

    async fn test_state(pool: PgPool, db_name: &str) -> AppState {
        let config = Arc::new(test_config());
        let bus = Arc::new(NotificationBus::new(BusConfig::default()));
        let audit = Arc::new(AuditLogger::new(pool.clone()));
        let tracker = Arc::new(TaskTracker::new(
            pool.clone(),
            Arc::clone(&bus),
            TrackerConfig::default(),
        ));
        let registry = Arc::new(AgentRegistry::new());
        registry
            .seed_from_store(&pool)
            .await
            .expect("seed should succeed");
        let resources = Arc::new(ResourceManager::new(ResourceLimits {
            max_concurrent_tasks: 2,
            max_memory_bytes: 512 * 1024 * 1024,
            max_cpu_percent: 90.0,
            max_disk_bytes: 10 * 1024 * 1024 * 1024,
        }));
        let queue = Arc::new(
            DurableQueue::connect(QueueConfig::new(test_db_url(db_name).await))
                .await
                .expect("queue should connect"),
        );
        let orchestrator = Orchestrator::new(
            pool.clone(),
            queue,
            registry,
            resources,
            tracker,
            Arc::clone(&bus),
            Arc::clone(&audit),
            OrchestratorConfig::default(),
        );
        AppState {
            orchestrator,
            pool,
            bus,
            audit,
            config,
            started_at: Instant::now(),
        }
    }

    fn bearer(user_id: uuid::Uuid, organization_id: uuid::Uuid) -> String {
        let token = issue_token(SECRET, &Claims {
            user_id,
            organization_id,
            role: "admin".to_string(),
            permissions: vec!["workflows:execute".to_string()],
        });
        format!("Bearer {token}")
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone(), &db_name).await;
        let app = build_router(state);

        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "healthy");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_agents_status_requires_auth() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone(), &db_name).await;
        let app = build_router(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/agents/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_agents_status_lists_seeded_agents() {
        let (pool, db_name) = create_test_db().await;
        let (org, user) = seed_org_and_user(&pool).await;
        seed_agent(&pool, org.id, "testing").await;
        seed_agent(&pool, org.id, "code_review").await;

        let state = test_state(pool.clone(), &db_name).await;
        let app = build_router(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/agents/status")
                    .header("authorization", bearer(user.id, org.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["totalAgents"], 2);
        assert_eq!(json["activeAgents"], 2);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_execute_and_status_roundtrip() {
        let (pool, db_name) = create_test_db().await;
        let (org, user) = seed_org_and_user(&pool).await;
        let agent = seed_agent(&pool, org.id, "testing").await;
        let (workflow, _) = seed_workflow(
            &pool,
            org.id,
            agent.id,
            "api-flow",
            &[("first", 1, &[]), ("second", 2, &[])],
        )
        .await;

        let state = test_state(pool.clone(), &db_name).await;
        let app = build_router(state);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/workflows/execute")
                    .header("authorization", bearer(user.id, org.id))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "workflowId": workflow.id,
                            "input": {"title": "x"},
                            "priority": "high",
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "started");
        let run_id = json["workflowRunId"].as_str().unwrap().to_string();

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/workflows/{run_id}/status"))
                    .header("authorization", bearer(user.id, org.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["id"].as_str().unwrap(), run_id);
        assert_eq!(json["priority"], "high");
        let tasks = json["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(json["input"]["title"], "x");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_execute_rejects_bad_priority() {
        let (pool, db_name) = create_test_db().await;
        let (org, user) = seed_org_and_user(&pool).await;
        let agent = seed_agent(&pool, org.id, "testing").await;
        let (workflow, _) =
            seed_workflow(&pool, org.id, agent.id, "prio", &[("only", 1, &[])]).await;

        let state = test_state(pool.clone(), &db_name).await;
        let app = build_router(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/workflows/execute")
                    .header("authorization", bearer(user.id, org.id))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "workflowId": workflow.id,
                            "priority": "sooner-please",
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(json.get("requestId").is_some());
        assert!(json.get("message").is_some());

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_status_hides_foreign_runs() {
        let (pool, db_name) = create_test_db().await;
        let (org, user) = seed_org_and_user(&pool).await;
        let (other_org, other_user) = seed_org_and_user(&pool).await;
        let agent = seed_agent(&pool, org.id, "testing").await;
        let (workflow, _) =
            seed_workflow(&pool, org.id, agent.id, "scoped", &[("only", 1, &[])]).await;

        let state = test_state(pool.clone(), &db_name).await;
        let app = build_router(state);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/workflows/execute")
                    .header("authorization", bearer(user.id, org.id))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "workflowId": workflow.id }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let run_id = body_json(resp).await["workflowRunId"]
            .as_str()
            .unwrap()
            .to_string();

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/workflows/{run_id}/status"))
                    .header("authorization", bearer(other_user.id, other_org.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_run_is_404() {
        let (pool, db_name) = create_test_db().await;
        let (org, user) = seed_org_and_user(&pool).await;

        let state = test_state(pool.clone(), &db_name).await;
        let app = build_router(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/workflows/{}/cancel", uuid::Uuid::new_v4()))
                    .header("authorization", bearer(user.id, org.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
