use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Migrations embedded at compile time from `conductor-db/migrations/`.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// PostgreSQL error code for "database already exists".
const DUPLICATE_DATABASE: &str = "42P04";

/// Create a connection pool with sensible defaults.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .with_context(|| {
            format!("failed to connect to database at {}", config.database_url)
        })?;
    Ok(pool)
}

/// Run all pending migrations against the pool.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to run database migrations")?;
    info!("migrations applied successfully");
    Ok(())
}

/// Create the target database when it does not exist yet.
///
/// `CREATE DATABASE` has no `IF NOT EXISTS` form, so the statement is
/// issued unconditionally over a one-off maintenance connection and the
/// duplicate-database error is read as "already provisioned". The name is
/// interpolated, which is why [`DbConfig::checked_database_name`] gates it.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let name = config.checked_database_name()?;
    let maintenance_url = config.maintenance_url();

    let mut conn = PgConnection::connect(&maintenance_url)
        .await
        .with_context(|| {
            format!("failed to connect to maintenance database at {maintenance_url}")
        })?;

    let result = conn.execute(format!("CREATE DATABASE {name}").as_str()).await;
    let _ = conn.close().await;

    match result {
        Ok(_) => {
            info!(db = name, "database created");
            Ok(())
        }
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(DUPLICATE_DATABASE) => {
            info!(db = name, "database already exists");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("failed to create database {name}")),
    }
}
