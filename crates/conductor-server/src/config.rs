//! Environment configuration for the conductor binary.
//!
//! Every recognized option is enumerated here with its default; enumerated
//! values (`NODE_ENV`, `QUEUE_BACKOFF_TYPE`, `LOG_LEVEL`) are parsed
//! strictly so a typo fails startup instead of silently degrading.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use conductor_core::queue::BackoffPolicy;
use conductor_core::resources::ResourceLimits;

/// Deployment environment, from `NODE_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => bail!("invalid NODE_ENV: {other:?}"),
        }
    }
}

/// CPU ceiling applied to the resource manager; not separately
/// configurable through the environment.
const MAX_CPU_PERCENT: f64 = 90.0;
/// Disk budget applied to the resource manager.
const MAX_DISK_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// The full set of recognized options.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub environment: Environment,
    pub database_url: String,
    pub queue_url: String,
    /// Worker pool size.
    pub queue_concurrency: usize,
    /// Per-task timeout.
    pub task_timeout: Duration,
    pub max_retries: i32,
    /// Memory budget for the resource manager, in megabytes.
    pub memory_limit_mb: u64,
    pub queue_max_attempts: i32,
    pub queue_backoff: BackoffPolicy,
    pub jwt_secret: String,
    pub cors_origins: Vec<String>,
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    pub log_level: String,
    pub enable_websockets: bool,
    pub enable_real_time_monitoring: bool,
    pub enable_workflow_caching: bool,
}

impl ServerConfig {
    /// Read and validate the environment. Any invalid value is a startup
    /// error (the process exits 1).
    pub fn from_env() -> Result<Self> {
        let port = parsed_or("PORT", 3001u16)?;
        let host = env::var("HOST").unwrap_or_else(|_| "localhost".to_string());
        let environment: Environment = env::var("NODE_ENV")
            .unwrap_or_else(|_| "development".to_string())
            .parse()?;

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let queue_url = env::var("QUEUE_URL").context("QUEUE_URL is required")?;

        let queue_concurrency = parsed_or("AGENT_QUEUE_CONCURRENCY", 5usize)?;
        if queue_concurrency == 0 {
            bail!("AGENT_QUEUE_CONCURRENCY must be at least 1");
        }
        let task_timeout = Duration::from_secs(parsed_or("AGENT_TASK_TIMEOUT", 300u64)?);
        let max_retries = parsed_or("AGENT_MAX_RETRIES", 3i32)?;
        let memory_limit_mb = parsed_or("AGENT_MEMORY_LIMIT", 512u64)?;

        let queue_max_attempts = parsed_or("QUEUE_MAX_ATTEMPTS", 3i32)?;
        let backoff_delay = Duration::from_millis(parsed_or("QUEUE_BACKOFF_DELAY", 2000u64)?);
        let queue_backoff = match env::var("QUEUE_BACKOFF_TYPE")
            .unwrap_or_else(|_| "exponential".to_string())
            .as_str()
        {
            "exponential" => BackoffPolicy::Exponential {
                base: backoff_delay,
            },
            "fixed" => BackoffPolicy::Fixed {
                delay: backoff_delay,
            },
            other => bail!("invalid QUEUE_BACKOFF_TYPE: {other:?}"),
        };

        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET is required")?;
        if jwt_secret.len() < 32 {
            bail!("JWT_SECRET must be at least 32 characters");
        }

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let rate_limit_max = parsed_or("RATE_LIMIT_MAX", 100u32)?;
        let rate_limit_window =
            Duration::from_secs(parsed_or("RATE_LIMIT_WINDOW", 15 * 60u64)?);

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        if !matches!(
            log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            bail!("invalid LOG_LEVEL: {log_level:?}");
        }

        Ok(Self {
            port,
            host,
            environment,
            database_url,
            queue_url,
            queue_concurrency,
            task_timeout,
            max_retries,
            memory_limit_mb,
            queue_max_attempts,
            queue_backoff,
            jwt_secret,
            cors_origins,
            rate_limit_max,
            rate_limit_window,
            log_level,
            enable_websockets: bool_or("ENABLE_WEBSOCKETS", true)?,
            enable_real_time_monitoring: bool_or("ENABLE_REAL_TIME_MONITORING", true)?,
            enable_workflow_caching: bool_or("ENABLE_WORKFLOW_CACHING", false)?,
        })
    }

    /// Resource limits derived from the configured budgets.
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_concurrent_tasks: self.queue_concurrency,
            max_memory_bytes: self.memory_limit_mb * 1024 * 1024,
            max_cpu_percent: MAX_CPU_PERCENT,
            max_disk_bytes: MAX_DISK_BYTES,
        }
    }

    /// Feature flags advertised in the bus welcome message.
    pub fn feature_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.enable_websockets {
            flags.push("websockets".to_string());
        }
        if self.enable_real_time_monitoring {
            flags.push("real_time_monitoring".to_string());
        }
        if self.enable_workflow_caching {
            flags.push("workflow_caching".to_string());
        }
        flags
    }
}

fn parsed_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn bool_or(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => bail!("invalid {key}: {other:?} (expected true/false)"),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_known_values() {
        assert_eq!(
            "development".parse::<Environment>().unwrap(),
            Environment::Development
        );
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn resource_limits_scale_memory() {
        let config = ServerConfig {
            port: 3001,
            host: "localhost".to_string(),
            environment: Environment::Test,
            database_url: "postgresql://localhost/x".to_string(),
            queue_url: "postgresql://localhost/x".to_string(),
            queue_concurrency: 4,
            task_timeout: Duration::from_secs(300),
            max_retries: 3,
            memory_limit_mb: 512,
            queue_max_attempts: 3,
            queue_backoff: BackoffPolicy::Fixed {
                delay: Duration::from_millis(100),
            },
            jwt_secret: "0123456789abcdef0123456789abcdef".to_string(),
            cors_origins: vec![],
            rate_limit_max: 100,
            rate_limit_window: Duration::from_secs(900),
            log_level: "info".to_string(),
            enable_websockets: true,
            enable_real_time_monitoring: true,
            enable_workflow_caching: false,
        };
        let limits = config.resource_limits();
        assert_eq!(limits.max_concurrent_tasks, 4);
        assert_eq!(limits.max_memory_bytes, 512 * 1024 * 1024);

        let flags = config.feature_flags();
        assert!(flags.contains(&"websockets".to_string()));
        assert!(!flags.contains(&"workflow_caching".to_string()));
    }
}
