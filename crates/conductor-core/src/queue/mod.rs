//! Durable job queue over PostgreSQL.
//!
//! At-least-once delivery with priority ordering, delayed availability,
//! leased dequeue (`FOR UPDATE SKIP LOCKED`), bounded retries with backoff,
//! and dead-letter retention. Handlers must be idempotent on `task_id`; the
//! task-state CAS in the store turns redelivery into at-most-once effect.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Backoff applied when a job is nacked below its attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// `base × 2^attempts`, exponent capped to keep the arithmetic sane.
    Exponential { base: Duration },
    Fixed { delay: Duration },
}

impl BackoffPolicy {
    /// Delay before the given (post-increment) attempt count runs again.
    pub fn delay_for(&self, attempt_count: i32) -> Duration {
        match self {
            Self::Exponential { base } => {
                let exponent = attempt_count.clamp(0, 16) as u32;
                base.saturating_mul(2u32.saturating_pow(exponent))
            }
            Self::Fixed { delay } => *delay,
        }
    }
}

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// PostgreSQL URL for the queue backend.
    pub url: String,
    /// Attempt budget per job before dead-lettering.
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,
    /// How long a lease lasts before an unacked job is considered abandoned.
    pub visibility_timeout: Duration,
    /// Sleep between dequeue polls.
    pub poll_interval: Duration,
    /// How long `dequeue` blocks before returning `None`.
    pub poll_timeout: Duration,
    /// How many `done` jobs are retained for inspection.
    pub retain_completed: i64,
    /// How many `dead` jobs are retained for inspection.
    pub retain_dead: i64,
}

impl QueueConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_attempts: 3,
            backoff: BackoffPolicy::Exponential {
                base: Duration::from_millis(2000),
            },
            visibility_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
            poll_timeout: Duration::from_secs(5),
            retain_completed: 100,
            retain_dead: 100,
        }
    }
}

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Ready,
    Leased,
    Done,
    Dead,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Leased => "leased",
            Self::Done => "done",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// A step-execution job.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Fields for enqueueing a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
}

/// What happened to a nacked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued,
    DeadLettered,
}

/// Counts per job state, for health reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub ready: i64,
    pub leased: i64,
    pub done: i64,
    pub dead: i64,
}

/// The queue owns exactly this table; the DDL is idempotent so connecting
/// twice (or sharing the state-store database) is harmless.
const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS queue_jobs (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    run_id UUID NOT NULL,
    task_id UUID NOT NULL,
    agent_id UUID NOT NULL,
    payload JSONB NOT NULL DEFAULT '{}',
    priority INTEGER NOT NULL DEFAULT 1,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    state TEXT NOT NULL DEFAULT 'ready'
        CHECK (state IN ('ready', 'leased', 'done', 'dead')),
    enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    available_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    leased_by TEXT,
    lease_expires_at TIMESTAMPTZ,
    last_error TEXT,
    finished_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS queue_jobs_ready_idx
    ON queue_jobs (state, available_at, priority DESC, enqueued_at)";

/// Durable queue client.
pub struct DurableQueue {
    pool: PgPool,
    config: QueueConfig,
}

impl DurableQueue {
    /// Connect to the queue backend and bootstrap the schema.
    pub async fn connect(config: QueueConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.url)
            .await
            .with_context(|| format!("failed to connect to queue backend at {}", config.url))?;

        for stmt in SCHEMA.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt)
                    .execute(&pool)
                    .await
                    .context("failed to bootstrap queue schema")?;
            }
        }

        Ok(Self { pool, config })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Persist a job; it becomes available after `delay`.
    pub async fn enqueue(&self, job: &NewJob, delay: Duration, priority: i32) -> Result<Job> {
        let row = sqlx::query_as::<_, Job>(
            "INSERT INTO queue_jobs \
                 (run_id, task_id, agent_id, payload, priority, max_attempts, available_at) \
             VALUES ($1, $2, $3, $4, $5, $6, NOW() + make_interval(secs => $7)) \
             RETURNING *",
        )
        .bind(job.run_id)
        .bind(job.task_id)
        .bind(job.agent_id)
        .bind(&job.payload)
        .bind(priority)
        .bind(job.max_attempts)
        .bind(delay.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .context("failed to enqueue job")?;

        Ok(row)
    }

    /// Lease the next available job, blocking up to the configured poll
    /// timeout. Ordering is `(priority DESC, enqueued_at ASC)` over jobs
    /// whose `available_at` has passed.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + self.config.poll_timeout;
        loop {
            if let Some(job) = self.try_dequeue(worker_id).await? {
                return Ok(Some(job));
            }
            if tokio::time::Instant::now() + self.config.poll_interval > deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One non-blocking dequeue attempt.
    pub async fn try_dequeue(&self, worker_id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            "UPDATE queue_jobs \
             SET state = 'leased', \
                 leased_by = $1, \
                 lease_expires_at = NOW() + make_interval(secs => $2) \
             WHERE id = ( \
                 SELECT id FROM queue_jobs \
                 WHERE state = 'ready' AND available_at <= NOW() \
                 ORDER BY priority DESC, enqueued_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING *",
        )
        .bind(worker_id)
        .bind(self.config.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .context("failed to dequeue job")?;

        Ok(job)
    }

    /// Extend the lease on a job this worker holds.
    pub async fn renew_lease(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queue_jobs \
             SET lease_expires_at = NOW() + make_interval(secs => $3) \
             WHERE id = $1 AND state = 'leased' AND leased_by = $2",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(self.config.visibility_timeout.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("failed to renew lease")?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a successfully handled job (retained as `done` up to the
    /// configured count).
    pub async fn ack(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE queue_jobs \
             SET state = 'done', finished_at = NOW(), leased_by = NULL, lease_expires_at = NULL \
             WHERE id = $1 AND state = 'leased'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("failed to ack job")?;

        self.prune(JobState::Done, self.config.retain_completed)
            .await?;
        Ok(())
    }

    /// Record a handling failure. Below the attempt budget the job returns
    /// to `ready` after the backoff delay; otherwise it is dead-lettered.
    pub async fn nack(&self, job_id: Uuid, reason: &str) -> Result<NackOutcome> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM queue_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch job for nack")?
            .with_context(|| format!("job {job_id} not found"))?;

        let attempts = job.attempt_count + 1;
        if attempts < job.max_attempts {
            let delay = self.config.backoff.delay_for(attempts);
            sqlx::query(
                "UPDATE queue_jobs \
                 SET state = 'ready', \
                     attempt_count = $2, \
                     last_error = $3, \
                     leased_by = NULL, \
                     lease_expires_at = NULL, \
                     available_at = NOW() + make_interval(secs => $4) \
                 WHERE id = $1 AND state = 'leased'",
            )
            .bind(job_id)
            .bind(attempts)
            .bind(reason)
            .bind(delay.as_secs_f64())
            .execute(&self.pool)
            .await
            .context("failed to requeue nacked job")?;
            Ok(NackOutcome::Requeued)
        } else {
            sqlx::query(
                "UPDATE queue_jobs \
                 SET state = 'dead', \
                     attempt_count = $2, \
                     last_error = $3, \
                     leased_by = NULL, \
                     lease_expires_at = NULL, \
                     finished_at = NOW() \
                 WHERE id = $1 AND state = 'leased'",
            )
            .bind(job_id)
            .bind(attempts)
            .bind(reason)
            .execute(&self.pool)
            .await
            .context("failed to dead-letter job")?;
            self.prune(JobState::Dead, self.config.retain_dead).await?;
            Ok(NackOutcome::DeadLettered)
        }
    }

    /// Return a leased job to `ready` without consuming an attempt.
    ///
    /// Used for resource-admission denials: the work never ran, so the
    /// retry budget must not shrink.
    pub async fn release(&self, job_id: Uuid, delay: Duration) -> Result<()> {
        sqlx::query(
            "UPDATE queue_jobs \
             SET state = 'ready', \
                 leased_by = NULL, \
                 lease_expires_at = NULL, \
                 available_at = NOW() + make_interval(secs => $2) \
             WHERE id = $1 AND state = 'leased'",
        )
        .bind(job_id)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("failed to release job")?;

        Ok(())
    }

    /// Restore leased-but-unacked jobs whose lease expired (crash recovery).
    /// Returns the number of jobs restored.
    pub async fn purge_expired_leases(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE queue_jobs \
             SET state = 'ready', leased_by = NULL, lease_expires_at = NULL \
             WHERE state = 'leased' AND lease_expires_at < NOW()",
        )
        .execute(&self.pool)
        .await
        .context("failed to purge expired leases")?;

        Ok(result.rows_affected())
    }

    /// Counts per state.
    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state::text, COUNT(*) FROM queue_jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .context("failed to fetch queue stats")?;

        let mut stats = QueueStats::default();
        for (state, count) in &rows {
            match state.as_str() {
                "ready" => stats.ready = *count,
                "leased" => stats.leased = *count,
                "done" => stats.done = *count,
                "dead" => stats.dead = *count,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Fetch a job by ID (inspection and tests).
    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM queue_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch job")?;

        Ok(job)
    }

    async fn prune(&self, state: JobState, keep: i64) -> Result<()> {
        sqlx::query(
            "DELETE FROM queue_jobs \
             WHERE state = $1 AND id NOT IN ( \
                 SELECT id FROM queue_jobs WHERE state = $1 \
                 ORDER BY finished_at DESC NULLS LAST LIMIT $2 \
             )",
        )
        .bind(state)
        .bind(keep)
        .execute(&self.pool)
        .await
        .context("failed to prune finished jobs")?;

        Ok(())
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
