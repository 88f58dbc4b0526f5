//! Lifecycle events published on the notification bus.

use uuid::Uuid;

/// Event types as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    WorkflowStarted,
    WorkflowRunning,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    TaskStatus,
    TaskCompleted,
    TaskFailed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowRunning => "workflow_running",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
            Self::WorkflowCancelled => "workflow_cancelled",
            Self::TaskStatus => "task_status",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
        }
    }

    /// Whether this is a run-level (as opposed to task-level) event.
    pub fn is_run_event(self) -> bool {
        !matches!(
            self,
            Self::TaskStatus | Self::TaskCompleted | Self::TaskFailed
        )
    }
}

/// One lifecycle event, addressed by organization and run.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub organization_id: Option<Uuid>,
    /// Target user for user-addressed messages; `None` for broadcasts.
    pub user_id: Option<Uuid>,
    pub run_id: Uuid,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(
        kind: EventKind,
        organization_id: Option<Uuid>,
        run_id: Uuid,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            organization_id,
            user_id: None,
            run_id,
            data,
        }
    }

    /// Channels this event is published on: the class channel plus the
    /// per-run channel.
    pub fn channels(&self) -> [String; 2] {
        let class = if self.kind.is_run_event() {
            "workflows"
        } else {
            "tasks"
        };
        [class.to_string(), format!("run:{}", self.run_id)]
    }
}
