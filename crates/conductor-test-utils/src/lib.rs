//! Test fixtures shared by the integration suites.
//!
//! Everything runs against real PostgreSQL. One server is booted per test
//! binary — or borrowed from `CONDUCTOR_TEST_PG_URL` when the environment
//! already provides one — and every test carves out its own throwaway,
//! uniquely named database, so suites can run concurrently without
//! stepping on each other's rows.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

pub mod seed;

/// The per-binary PostgreSQL server.
struct TestPostgres {
    /// Server root URL, without a database path.
    base_url: String,
    /// Holding the container keeps it alive for the life of the binary;
    /// `None` when an external server was supplied.
    _keepalive: Option<ContainerAsync<Postgres>>,
}

static PG: OnceCell<TestPostgres> = OnceCell::const_new();

impl TestPostgres {
    async fn boot() -> Self {
        if let Ok(base_url) = std::env::var("CONDUCTOR_TEST_PG_URL") {
            return Self {
                base_url,
                _keepalive: None,
            };
        }

        let container = Postgres::default()
            .with_tag("18")
            .start()
            .await
            .expect("failed to start PostgreSQL container");
        let host = container.get_host().await.expect("container has no host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("container port 5432 is not mapped");

        Self {
            base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
            _keepalive: Some(container),
        }
    }
}

/// Server root URL of the shared PostgreSQL (no database name). Boots the
/// container on first use.
pub async fn pg_url() -> &'static str {
    &PG.get_or_init(TestPostgres::boot).await.base_url
}

/// One-off connection to the server's `postgres` database, for the
/// CREATE/DROP DATABASE statements that cannot target the database they
/// operate on.
async fn maintenance_connection() -> PgConnection {
    let url = format!("{}/postgres", pg_url().await);
    PgConnection::connect(&url)
        .await
        .expect("failed to reach the test PostgreSQL server")
}

/// Connection URL for a database created by [`create_test_db`].
///
/// Components that open their own pool (the durable queue) take this URL
/// instead of sharing the state-store pool.
pub async fn test_db_url(db_name: &str) -> String {
    format!("{}/{db_name}", pg_url().await)
}

/// Provision a fresh database with migrations applied.
///
/// Returns the pool together with the generated database name; hand the
/// name to [`drop_test_db`] when the test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let db_name = format!("conductor_test_{}", Uuid::new_v4().simple());

    let mut maint = maintenance_connection().await;
    maint
        .execute(format!("CREATE DATABASE {db_name}").as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create test database {db_name}: {e}"));
    let _ = maint.close().await;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&test_db_url(&db_name).await)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to test database {db_name}: {e}"));
    conductor_db::pool::run_migrations(&pool)
        .await
        .expect("migrations should apply cleanly");

    (pool, db_name)
}

/// Tear down a database created by [`create_test_db`].
///
/// Connections a test leaked (queue pools, unfinished subscribers) are
/// terminated first so the DROP cannot hang; dropping an already-dropped
/// database is a no-op.
pub async fn drop_test_db(db_name: &str) {
    let mut maint = maintenance_connection().await;

    let evict = format!(
        "SELECT pg_terminate_backend(pid) \
         FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = maint.execute(evict.as_str()).await;
    let _ = maint
        .execute(format!("DROP DATABASE IF EXISTS {db_name}").as_str())
        .await;
    let _ = maint.close().await;
}
