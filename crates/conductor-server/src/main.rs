mod auth;
mod config;
mod routes;
mod ws;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use conductor_core::agent::registry::AgentRegistry;
use conductor_core::audit::AuditLogger;
use conductor_core::bus::{BusConfig, NotificationBus};
use conductor_core::executor::ExecutorConfig;
use conductor_core::orchestrator::{Orchestrator, OrchestratorConfig};
use conductor_core::queue::{DurableQueue, QueueConfig};
use conductor_core::resources::ResourceManager;
use conductor_core::tracker::{TaskTracker, TrackerConfig};
use conductor_db::config::DbConfig;
use conductor_db::pool;

use config::ServerConfig;
use routes::AppState;

#[derive(Parser)]
#[command(name = "conductor", about = "Multi-tenant AI-agent workflow orchestrator")]
struct Cli {
    /// Listen port (overrides the PORT env var)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::from_env().context("invalid configuration")?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    // State store. Development instances create their database on first
    // boot; production databases are provisioned out of band.
    let db_config = DbConfig::new(&config.database_url);
    if config.environment == config::Environment::Development {
        pool::ensure_database_exists(&db_config)
            .await
            .context("state store unreachable")?;
    }
    let pool = pool::create_pool(&db_config)
        .await
        .context("state store unreachable")?;
    pool::run_migrations(&pool).await?;

    // Durable queue.
    let queue_config = QueueConfig {
        max_attempts: config.queue_max_attempts,
        backoff: config.queue_backoff,
        ..QueueConfig::new(config.queue_url.as_str())
    };
    let queue = Arc::new(
        DurableQueue::connect(queue_config)
            .await
            .context("queue backend unreachable")?,
    );

    // Engine components.
    let bus = Arc::new(NotificationBus::new(BusConfig {
        feature_flags: config.feature_flags(),
        ..BusConfig::default()
    }));
    let audit = Arc::new(AuditLogger::new(pool.clone()));
    let tracker = Arc::new(TaskTracker::new(
        pool.clone(),
        Arc::clone(&bus),
        TrackerConfig::default(),
    ));
    let resources = Arc::new(ResourceManager::new(config.resource_limits()));
    let registry = Arc::new(AgentRegistry::new());
    registry
        .seed_from_store(&pool)
        .await
        .context("failed to seed agent registry")?;

    let orchestrator = Orchestrator::new(
        pool.clone(),
        Arc::clone(&queue),
        registry,
        resources,
        tracker,
        Arc::clone(&bus),
        Arc::clone(&audit),
        OrchestratorConfig {
            worker_count: config.queue_concurrency,
            default_max_retries: config.max_retries,
            default_timeout_ms: config.task_timeout.as_millis() as i64,
            executor: ExecutorConfig::default(),
            ..OrchestratorConfig::default()
        },
    );
    orchestrator.start().await?;

    let state = AppState {
        orchestrator: Arc::clone(&orchestrator),
        pool,
        bus,
        audit,
        config: Arc::new(config.clone()),
        started_at: Instant::now(),
    };
    let app = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        "conductor listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.stop().await;
    tracing::info!("conductor shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}
