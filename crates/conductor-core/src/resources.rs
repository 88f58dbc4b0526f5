//! Resource accounting and admission control.
//!
//! Tracks concurrent-task slots and memory/CPU/disk reservations against
//! hard limits. `allocate` is a non-blocking check-and-commit; a denial is
//! transient and handled by the dispatch loop (requeue with delay), never
//! surfaced to the submitter.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use sqlx::PgPool;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::ResourceHint;

/// Hard limits for one orchestrator instance. Required at construction;
/// running without limits is a configuration error.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub max_concurrent_tasks: usize,
    pub max_memory_bytes: u64,
    pub max_cpu_percent: f64,
    pub max_disk_bytes: u64,
}

/// Why an allocation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    CpuSaturated,
    MemoryExhausted,
    DiskExhausted,
    ConcurrencySaturated,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CpuSaturated => "cpu_saturated",
            Self::MemoryExhausted => "memory_exhausted",
            Self::DiskExhausted => "disk_exhausted",
            Self::ConcurrencySaturated => "concurrency_saturated",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted on the resource broadcast channel.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    /// A utilization figure crossed 80% (rising edge).
    Warning { resource: &'static str, pct: f64 },
    LimitsUpdated,
}

/// Current utilization percentages.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Utilization {
    pub memory_pct: f64,
    pub cpu_pct: f64,
    pub disk_pct: f64,
    pub concurrent_pct: f64,
}

#[derive(Debug, Clone)]
struct Allocation {
    agent_id: Uuid,
    memory_bytes: u64,
    cpu_cores: f64,
    disk_bytes: u64,
}

#[derive(Default)]
struct Inner {
    allocations: HashMap<Uuid, Allocation>,
    memory_reserved: u64,
    cpu_reserved_cores: f64,
    disk_reserved: u64,
    sampled_memory: u64,
    sampled_cpu_pct: f64,
    warned: HashSet<&'static str>,
}

/// Admission controller for the worker pool.
pub struct ResourceManager {
    limits: RwLock<ResourceLimits>,
    inner: Mutex<Inner>,
    sys: Mutex<System>,
    cores: f64,
    events: broadcast::Sender<ResourceEvent>,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        Self::new_with_cores(limits, cores)
    }

    /// Construct with an explicit core count (deterministic tests).
    pub fn new_with_cores(limits: ResourceLimits, cores: f64) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            limits: RwLock::new(limits),
            inner: Mutex::new(Inner::default()),
            sys: Mutex::new(System::new()),
            cores: cores.max(1.0),
            events,
        }
    }

    /// Subscribe to warning / limits-updated events.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    /// Atomic check-and-commit of a reservation for one task.
    ///
    /// Denies when any post-allocation figure would exceed its limit, or
    /// when CPU is already within 10% of its ceiling.
    pub fn allocate(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        hint: &ResourceHint,
    ) -> Result<(), DenyReason> {
        let limits = self.limits.read().expect("limits lock poisoned").clone();
        let mut inner = self.inner.lock().expect("resource lock poisoned");

        if inner.allocations.contains_key(&task_id) {
            // Duplicate delivery of the same task; the reservation stands.
            return Ok(());
        }

        if inner.allocations.len() + 1 > limits.max_concurrent_tasks {
            return Err(DenyReason::ConcurrencySaturated);
        }

        let cpu_pct = Self::cpu_pct_of(&inner, self.cores);
        if cpu_pct >= limits.max_cpu_percent * 0.9 {
            return Err(DenyReason::CpuSaturated);
        }

        let memory_in_use = inner.memory_reserved.max(inner.sampled_memory);
        if memory_in_use + hint.memory_bytes > limits.max_memory_bytes {
            return Err(DenyReason::MemoryExhausted);
        }

        let disk_wanted = hint.disk_bytes.unwrap_or(0);
        if inner.disk_reserved + disk_wanted > limits.max_disk_bytes {
            return Err(DenyReason::DiskExhausted);
        }

        let cores_wanted = hint.cpu_cores.unwrap_or(0.0);
        inner.memory_reserved += hint.memory_bytes;
        inner.cpu_reserved_cores += cores_wanted;
        inner.disk_reserved += disk_wanted;
        inner.allocations.insert(task_id, Allocation {
            agent_id,
            memory_bytes: hint.memory_bytes,
            cpu_cores: cores_wanted,
            disk_bytes: disk_wanted,
        });

        self.check_warnings(&mut inner, &limits);
        Ok(())
    }

    /// Deduct a recorded reservation. Idempotent: releasing a task that has
    /// no allocation is a no-op.
    pub fn release(&self, task_id: Uuid) {
        let limits = self.limits.read().expect("limits lock poisoned").clone();
        let mut inner = self.inner.lock().expect("resource lock poisoned");
        if let Some(alloc) = inner.allocations.remove(&task_id) {
            inner.memory_reserved = inner.memory_reserved.saturating_sub(alloc.memory_bytes);
            inner.cpu_reserved_cores = (inner.cpu_reserved_cores - alloc.cpu_cores).max(0.0);
            inner.disk_reserved = inner.disk_reserved.saturating_sub(alloc.disk_bytes);
            tracing::debug!(task_id = %task_id, agent_id = %alloc.agent_id, "released allocation");
        }
        self.check_warnings(&mut inner, &limits);
    }

    /// Current utilization percentages.
    pub fn utilization(&self) -> Utilization {
        let limits = self.limits.read().expect("limits lock poisoned").clone();
        let inner = self.inner.lock().expect("resource lock poisoned");
        Self::utilization_of(&inner, &limits, self.cores)
    }

    /// Number of live allocations.
    pub fn active_allocations(&self) -> usize {
        self.inner
            .lock()
            .expect("resource lock poisoned")
            .allocations
            .len()
    }

    /// Replace the limits; emits `limits_updated`.
    pub fn update_limits(&self, new_limits: ResourceLimits) {
        {
            let mut limits = self.limits.write().expect("limits lock poisoned");
            *limits = new_limits;
        }
        let _ = self.events.send(ResourceEvent::LimitsUpdated);
    }

    /// Sample process metrics (resident memory, process CPU) into the
    /// accounting state.
    pub fn sample_process(&self) {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return;
        };
        let mut sys = self.sys.lock().expect("sysinfo lock poisoned");
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        if let Some(process) = sys.process(pid) {
            let limits = self.limits.read().expect("limits lock poisoned").clone();
            let mut inner = self.inner.lock().expect("resource lock poisoned");
            inner.sampled_memory = process.memory();
            inner.sampled_cpu_pct = (process.cpu_usage() as f64 / self.cores).clamp(0.0, 100.0);
            self.check_warnings(&mut inner, &limits);
        }
    }

    /// Spawn the monitoring loop: periodically refresh process metrics and
    /// persist utilization samples.
    pub fn spawn_monitor(
        self: std::sync::Arc<Self>,
        pool: PgPool,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = cancel.cancelled() => break,
                }
                manager.sample_process();
                let u = manager.utilization();
                for (name, value) in [
                    ("resource.memory_pct", u.memory_pct),
                    ("resource.cpu_pct", u.cpu_pct),
                    ("resource.disk_pct", u.disk_pct),
                    ("resource.concurrency_pct", u.concurrent_pct),
                ] {
                    if let Err(e) =
                        conductor_db::queries::metrics::record_metric(&pool, name, value).await
                    {
                        tracing::warn!(error = %e, metric = name, "failed to record metric");
                    }
                }
            }
        })
    }

    fn cpu_pct_of(inner: &Inner, cores: f64) -> f64 {
        let reserved_pct = inner.cpu_reserved_cores / cores * 100.0;
        reserved_pct.max(inner.sampled_cpu_pct)
    }

    fn utilization_of(inner: &Inner, limits: &ResourceLimits, cores: f64) -> Utilization {
        let memory_in_use = inner.memory_reserved.max(inner.sampled_memory);
        Utilization {
            memory_pct: pct(memory_in_use as f64, limits.max_memory_bytes as f64),
            cpu_pct: pct(Self::cpu_pct_of(inner, cores), limits.max_cpu_percent),
            disk_pct: pct(inner.disk_reserved as f64, limits.max_disk_bytes as f64),
            concurrent_pct: pct(
                inner.allocations.len() as f64,
                limits.max_concurrent_tasks as f64,
            ),
        }
    }

    /// Emit a warning on each figure's rising edge through 80%; the edge
    /// re-arms once the figure falls back below.
    fn check_warnings(&self, inner: &mut Inner, limits: &ResourceLimits) {
        let u = Self::utilization_of(inner, limits, self.cores);
        for (resource, value) in [
            ("memory", u.memory_pct),
            ("cpu", u.cpu_pct),
            ("disk", u.disk_pct),
            ("concurrency", u.concurrent_pct),
        ] {
            if value >= 80.0 {
                if inner.warned.insert(resource) {
                    tracing::warn!(resource, pct = value, "resource utilization above 80%");
                    let _ = self.events.send(ResourceEvent::Warning {
                        resource,
                        pct: value,
                    });
                }
            } else {
                inner.warned.remove(resource);
            }
        }
    }
}

fn pct(used: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        0.0
    } else {
        (used / limit * 100.0).clamp(0.0, 100.0)
    }
}
