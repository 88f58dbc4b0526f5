//! Authoritative in-memory view of live tasks.
//!
//! Synchronized with the state store: every status change goes through
//! [`TaskTracker::update_status`], which CAS-writes the store, mirrors the
//! in-memory entry, and publishes the matching bus event. Keeping that one
//! choke point is what makes per-task event order auditable.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{RunPriority, TaskExecution, TaskStatus};
use conductor_db::queries::tasks::TaskTransitionFields;

use crate::bus::NotificationBus;
use crate::events::{Event, EventKind};
use crate::state::TaskStateMachine;

/// Tracker tuning knobs.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Bounded history ring for settled tasks.
    pub history_capacity: usize,
    /// How long settled tasks stay in the live view before migrating to
    /// the ring.
    pub retention: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// The tracker's view of one task.
#[derive(Debug, Clone)]
pub struct TrackedTask {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub agent_id: Uuid,
    pub name: String,
    pub organization_id: Uuid,
    pub status: TaskStatus,
    pub priority: RunPriority,
    pub retry_count: i32,
    pub max_retries: i32,
    pub timeout_ms: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

impl TrackedTask {
    pub fn from_row(task: &TaskExecution, organization_id: Uuid, priority: RunPriority) -> Self {
        Self {
            id: task.id,
            run_id: task.run_id,
            step_id: task.step_id,
            agent_id: task.agent_id,
            name: task.step_name.clone(),
            organization_id,
            status: task.status,
            priority,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            timeout_ms: task.timeout_ms,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            duration_ms: task.duration_ms,
            error: task.error.clone(),
        }
    }
}

/// Dispatch order among pending tasks: priority descending, then FIFO on
/// creation time.
pub fn pending_order(a: &TrackedTask, b: &TrackedTask) -> Ordering {
    b.priority
        .weight()
        .cmp(&a.priority.weight())
        .then(a.created_at.cmp(&b.created_at))
}

/// Rolled-up task counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskMetrics {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub avg_exec_ms: f64,
    pub success_rate: f64,
}

#[derive(Default)]
struct Inner {
    live: HashMap<Uuid, TrackedTask>,
    history: VecDeque<TrackedTask>,
}

/// Priority-ordered live-task view, synchronized with the state store.
pub struct TaskTracker {
    pool: PgPool,
    bus: Arc<NotificationBus>,
    config: TrackerConfig,
    inner: Mutex<Inner>,
}

impl TaskTracker {
    pub fn new(pool: PgPool, bus: Arc<NotificationBus>, config: TrackerConfig) -> Self {
        Self {
            pool,
            bus,
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Admit a task created by run submission.
    pub fn register(&self, task: &TaskExecution, organization_id: Uuid, priority: RunPriority) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        inner
            .live
            .insert(task.id, TrackedTask::from_row(task, organization_id, priority));
    }

    pub fn get(&self, task_id: Uuid) -> Option<TrackedTask> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        inner.live.get(&task_id).cloned()
    }

    /// Pending tasks in dispatch order.
    pub fn pending_sorted(&self) -> Vec<TrackedTask> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        let mut pending: Vec<TrackedTask> = inner
            .live
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(pending_order);
        pending
    }

    /// Tasks currently running.
    pub fn running(&self) -> Vec<TrackedTask> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        let mut running: Vec<TrackedTask> = inner
            .live
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
            .collect();
        running.sort_by_key(|t| t.started_at);
        running
    }

    /// CAS a task transition through to the store, mirror it, and publish
    /// the matching event.
    ///
    /// Returns `Ok(false)` when the optimistic lock loses (duplicate
    /// delivery or a concurrent transition); nothing is mutated or
    /// published in that case.
    pub async fn update_status(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        fields: &TaskTransitionFields,
    ) -> Result<bool> {
        if !TaskStateMachine::transition(&self.pool, task_id, from, to, fields).await? {
            return Ok(false);
        }

        let event = {
            let mut inner = self.inner.lock().expect("tracker lock poisoned");
            let Some(task) = inner.live.get_mut(&task_id) else {
                return Ok(true);
            };
            task.status = to;
            if let Some(t) = fields.started_at {
                task.started_at = Some(t);
            }
            if let Some(t) = fields.completed_at {
                task.completed_at = Some(t);
            }
            if let Some(d) = fields.duration_ms {
                task.duration_ms = Some(d);
            }
            if let Some(e) = &fields.error {
                task.error = Some(e.clone());
            }
            self.status_event(task, fields.output.as_ref())
        };
        self.bus.publish(&event);
        Ok(true)
    }

    /// Reset a `failed` task for another attempt. Permitted only while the
    /// retry budget holds; resets result fields and bumps the counter.
    pub async fn retry(&self, task_id: Uuid) -> Result<bool> {
        if !TaskStateMachine::retry(&self.pool, task_id).await? {
            return Ok(false);
        }

        let event = {
            let mut inner = self.inner.lock().expect("tracker lock poisoned");
            let Some(task) = inner.live.get_mut(&task_id) else {
                return Ok(true);
            };
            task.status = TaskStatus::Pending;
            task.retry_count += 1;
            task.started_at = None;
            task.completed_at = None;
            task.duration_ms = None;
            task.error = None;
            self.status_event(task, None)
        };
        self.bus.publish(&event);
        Ok(true)
    }

    /// Cancel a non-terminal task. Returns false when the task is unknown
    /// or already terminal.
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool> {
        let Some(task) = self.get(task_id) else {
            return Ok(false);
        };
        let from = match task.status {
            TaskStatus::Pending | TaskStatus::Running => task.status,
            _ => return Ok(false),
        };
        self.update_status(task_id, from, TaskStatus::Cancelled, &TaskTransitionFields {
            completed_at: Some(Utc::now()),
            ..Default::default()
        })
        .await
    }

    /// Counters over the live view plus the settled-history ring.
    pub fn metrics(&self) -> TaskMetrics {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        let mut m = TaskMetrics::default();
        let mut exec_total_ms = 0i64;
        let mut exec_count = 0usize;

        for task in inner.live.values().chain(inner.history.iter()) {
            m.total += 1;
            match task.status {
                TaskStatus::Pending => m.pending += 1,
                TaskStatus::Running => m.running += 1,
                TaskStatus::Completed => m.completed += 1,
                TaskStatus::Failed => m.failed += 1,
                TaskStatus::Cancelled | TaskStatus::Skipped => {}
            }
            if let Some(d) = task.duration_ms {
                exec_total_ms += d;
                exec_count += 1;
            }
        }

        if exec_count > 0 {
            m.avg_exec_ms = exec_total_ms as f64 / exec_count as f64;
        }
        let settled = m.completed + m.failed;
        if settled > 0 {
            m.success_rate = m.completed as f64 / settled as f64;
        }
        m
    }

    /// Migrate settled tasks older than the retention window into the
    /// bounded history ring. Returns how many moved.
    pub fn evict_settled(&self, now: DateTime<Utc>) -> usize {
        let retention =
            chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::hours(24));
        let mut inner = self.inner.lock().expect("tracker lock poisoned");

        let expired: Vec<Uuid> = inner
            .live
            .values()
            .filter(|t| {
                t.status.is_terminal()
                    && t.completed_at
                        .map(|at| at + retention <= now)
                        .unwrap_or(false)
            })
            .map(|t| t.id)
            .collect();

        let moved = expired.len();
        for id in expired {
            if let Some(task) = inner.live.remove(&id) {
                inner.history.push_back(task);
            }
        }
        while inner.history.len() > self.config.history_capacity {
            inner.history.pop_front();
        }
        moved
    }

    fn status_event(&self, task: &TrackedTask, output: Option<&serde_json::Value>) -> Event {
        let kind = match task.status {
            TaskStatus::Completed => EventKind::TaskCompleted,
            TaskStatus::Failed => EventKind::TaskFailed,
            _ => EventKind::TaskStatus,
        };
        let mut data = serde_json::json!({
            "task_id": task.id,
            "run_id": task.run_id,
            "name": task.name,
            "status": task.status,
            "retry_count": task.retry_count,
        });
        if let Some(error) = &task.error {
            data["error"] = serde_json::Value::String(error.clone());
        }
        if let Some(output) = output {
            data["output"] = output.clone();
        }
        Event::new(kind, Some(task.organization_id), task.run_id, data)
    }
}
