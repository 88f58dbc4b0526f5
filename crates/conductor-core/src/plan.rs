//! Run plans: the immutable snapshot of a workflow's steps taken at run
//! creation, plus DAG validation and payload-merging rules.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{bail, Result};
use uuid::Uuid;

use conductor_db::models::{RunPriority, TaskExecution, WorkflowRun, WorkflowStep};

/// One step of a run plan, bound to its task-execution row.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub task_id: Uuid,
    pub step_id: Uuid,
    pub name: String,
    /// `name` normalized for the output namespace.
    pub slug: String,
    pub agent_id: Uuid,
    pub order: i32,
    pub config: serde_json::Value,
    /// Retry budget snapshotted onto the task row.
    pub max_retries: i32,
    /// Step IDs this step waits on. For sequential workflows these are the
    /// synthesized chain edges.
    pub depends_on: Vec<Uuid>,
}

/// The immutable capture of a workflow's steps and dependencies at run
/// creation. Workflow edits after this point never affect the run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub organization_id: Uuid,
    pub priority: RunPriority,
    pub input: serde_json::Value,
    /// Steps in ascending `order`.
    pub steps: Vec<PlanStep>,
    /// True when no step declared dependencies and chain edges were
    /// synthesized from `step_order`.
    pub sequential: bool,
}

impl RunPlan {
    /// Build a plan from a run, its workflow's steps, and the snapshot task
    /// rows inserted by run creation.
    ///
    /// When every step has an empty dependency list, the legacy sequential
    /// contract applies: each step gets a synthetic edge to its predecessor
    /// in `step_order`, so the one scheduling loop executes them strictly in
    /// order.
    pub fn build(
        run: &WorkflowRun,
        organization_id: Uuid,
        steps: &[WorkflowStep],
        tasks: &[TaskExecution],
    ) -> Result<Self> {
        validate_dag(steps)?;

        let task_by_step: HashMap<Uuid, &TaskExecution> =
            tasks.iter().map(|t| (t.step_id, t)).collect();

        let mut ordered: Vec<&WorkflowStep> = steps.iter().collect();
        ordered.sort_by_key(|s| s.step_order);

        let sequential = ordered.iter().all(|s| s.depends_on.is_empty());

        let mut plan_steps = Vec::with_capacity(ordered.len());
        let mut prev_step_id: Option<Uuid> = None;
        for step in ordered {
            let Some(task) = task_by_step.get(&step.id) else {
                bail!("no task execution snapshot for step {}", step.name);
            };

            let depends_on = if sequential {
                prev_step_id.into_iter().collect()
            } else {
                step.depends_on.clone()
            };
            prev_step_id = Some(step.id);

            plan_steps.push(PlanStep {
                task_id: task.id,
                step_id: step.id,
                name: step.name.clone(),
                slug: slug(&step.name),
                agent_id: step.agent_id,
                order: step.step_order,
                config: step.config.clone(),
                max_retries: task.max_retries,
                depends_on,
            });
        }

        Ok(Self {
            run_id: run.id,
            workflow_id: run.workflow_id,
            organization_id,
            priority: run.priority,
            input: run.input.clone(),
            steps: plan_steps,
            sequential,
        })
    }

    /// Look up a plan step by its step ID.
    pub fn step(&self, step_id: Uuid) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Look up a plan step by its task-execution ID.
    pub fn step_for_task(&self, task_id: Uuid) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.task_id == task_id)
    }

    /// All steps that transitively depend on `step_id` (breadth-first).
    pub fn transitive_dependents(&self, step_id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut frontier = VecDeque::from([step_id]);
        while let Some(current) = frontier.pop_front() {
            for step in &self.steps {
                if step.depends_on.contains(&current) && seen.insert(step.step_id) {
                    out.push(step.step_id);
                    frontier.push_back(step.step_id);
                }
            }
        }
        out
    }
}

/// Normalize a step name into its output namespace key: lowercase, runs of
/// whitespace collapsed to a single `_`.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_gap = false;
    for c in name.trim().chars() {
        if c.is_whitespace() {
            in_gap = true;
            continue;
        }
        if in_gap && !out.is_empty() {
            out.push('_');
        }
        in_gap = false;
        for lower in c.to_lowercase() {
            out.push(lower);
        }
    }
    out
}

/// Merge named step outputs over a base payload.
///
/// The base is used as an object when it is one; any other JSON value is
/// wrapped as `{"input": value}` so the merge is total. Later writers win,
/// so a step output shadows a base key with the same name.
pub fn merge_outputs<I>(base: &serde_json::Value, outputs: I) -> serde_json::Value
where
    I: IntoIterator<Item = (String, serde_json::Value)>,
{
    let mut map = match base {
        serde_json::Value::Object(m) => m.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut m = serde_json::Map::new();
            m.insert("input".to_string(), other.clone());
            m
        }
    };
    for (key, value) in outputs {
        map.insert(key, value);
    }
    serde_json::Value::Object(map)
}

/// Validate a workflow's step DAG at registration time.
///
/// Rejects dependency references outside the workflow, self-loops, and
/// cycles (Kahn's algorithm: if the topological sort cannot consume every
/// step, a cycle exists).
pub fn validate_dag(steps: &[WorkflowStep]) -> Result<()> {
    let ids: HashSet<Uuid> = steps.iter().map(|s| s.id).collect();

    for step in steps {
        for dep in &step.depends_on {
            if *dep == step.id {
                bail!("step {:?} depends on itself", step.name);
            }
            if !ids.contains(dep) {
                bail!(
                    "step {:?} depends on {dep}, which is not a step of the same workflow",
                    step.name
                );
            }
        }
    }

    let mut in_degree: HashMap<Uuid, usize> =
        steps.iter().map(|s| (s.id, s.depends_on.len())).collect();
    let mut ready: VecDeque<Uuid> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut visited = 0usize;
    while let Some(id) = ready.pop_front() {
        visited += 1;
        for step in steps {
            if step.depends_on.contains(&id) {
                let degree = in_degree
                    .get_mut(&step.id)
                    .expect("every step has an in-degree entry");
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(step.id);
                }
            }
        }
    }

    if visited != steps.len() {
        bail!("workflow step dependencies contain a cycle");
    }

    Ok(())
}
