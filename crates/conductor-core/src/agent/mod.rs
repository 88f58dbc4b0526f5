//! The `AgentHandler` trait -- the adapter interface for step executors.
//!
//! Each concrete agent kind implements this trait. The trait is
//! intentionally object-safe so it can be stored as `Arc<dyn AgentHandler>`
//! in the [`registry::AgentRegistry`].

pub mod builtin;
pub mod registry;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What a handler receives for one invocation: the task's input payload and
/// the configuration snapshot captured at run creation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub run_id: Uuid,
    /// Zero-based attempt number (equals the task's retry count).
    pub attempt: i32,
    pub input: Value,
    pub config: Value,
}

/// Structured result of a handler invocation.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
    pub metadata: Value,
}

impl AgentOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            metadata: Value::Null,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
            metadata: Value::Null,
        }
    }
}

/// Per-kind resource defaults consumed by the resource manager.
#[derive(Debug, Clone, Copy)]
pub struct ResourceHint {
    pub memory_bytes: u64,
    pub cpu_cores: Option<f64>,
    pub disk_bytes: Option<u64>,
}

impl Default for ResourceHint {
    fn default() -> Self {
        Self {
            memory_bytes: 64 * 1024 * 1024,
            cpu_cores: None,
            disk_bytes: None,
        }
    }
}

/// Adapter interface for step executors.
///
/// Handlers are stateless; any external I/O is the handler's own
/// responsibility. The registry does not trust a handler's runtime: every
/// invocation is wrapped in a cancellation-aware timeout, and retries belong
/// to the queue, never to the handler.
///
/// # Object Safety
///
/// This trait is object-safe: it can be stored as `Arc<dyn AgentHandler>`.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// The agent type tag this handler serves (e.g. "code_review").
    fn kind(&self) -> &str;

    /// Execute one task. Implementations should observe `cancel` at their
    /// suspension points; handlers that ignore it are cut off by the
    /// per-task timeout.
    async fn invoke(&self, ctx: &TaskContext, cancel: &CancellationToken)
        -> Result<AgentOutcome>;

    /// Resource reservation defaults for this agent kind.
    fn resource_hint(&self) -> ResourceHint {
        ResourceHint::default()
    }
}

// Compile-time assertion: AgentHandler must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentHandler) {}
};
