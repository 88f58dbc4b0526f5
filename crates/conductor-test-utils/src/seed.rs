//! Seed helpers shared by integration tests: a tenant with a user, catalog
//! agents, and small workflows.

use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{Agent, Organization, User, Workflow, WorkflowStep};
use conductor_db::queries::agents::{self, NewAgent};
use conductor_db::queries::organizations;
use conductor_db::queries::users;
use conductor_db::queries::workflows::{self, NewWorkflowStep};

/// Insert an organization and one member user.
pub async fn seed_org_and_user(pool: &PgPool) -> (Organization, User) {
    let suffix = Uuid::new_v4().simple().to_string();
    let org = organizations::insert_organization(
        pool,
        "Test Org",
        &format!("test-org-{suffix}"),
        "pro",
        10,
        90,
    )
    .await
    .expect("insert_organization should succeed");

    let user = users::insert_user(
        pool,
        org.id,
        &format!("user-{suffix}@example.com"),
        "Test User",
        "admin",
        &["workflows:execute".to_string(), "workflows:read".to_string()],
    )
    .await
    .expect("insert_user should succeed");

    (org, user)
}

/// Insert an `active` agent of the given type.
pub async fn seed_agent(pool: &PgPool, organization_id: Uuid, agent_type: &str) -> Agent {
    agents::insert_agent(
        pool,
        &NewAgent {
            organization_id,
            name: &format!("{agent_type} agent"),
            agent_type,
            capabilities: &[agent_type.to_string()],
            tools: &[],
            max_concurrency: 4,
            config: serde_json::json!({}),
        },
    )
    .await
    .expect("insert_agent should succeed")
}

/// Step description for [`seed_workflow`]: `(name, order, depends_on indexes)`.
///
/// Dependency entries index into the step list itself, so callers can write
/// `("report", 3, &[1, 2])` without knowing UUIDs up front.
pub type StepDef<'a> = (&'a str, i32, &'a [usize]);

/// Insert a workflow whose steps all reference the given agent.
pub async fn seed_workflow(
    pool: &PgPool,
    organization_id: Uuid,
    agent_id: Uuid,
    name: &str,
    steps: &[StepDef<'_>],
) -> (Workflow, Vec<WorkflowStep>) {
    let workflow = workflows::insert_workflow(pool, organization_id, name)
        .await
        .expect("insert_workflow should succeed");

    let mut inserted: Vec<WorkflowStep> = Vec::with_capacity(steps.len());
    for (step_name, order, dep_indexes) in steps {
        let depends_on: Vec<Uuid> = dep_indexes.iter().map(|i| inserted[*i].id).collect();
        let step = workflows::insert_workflow_step(
            pool,
            &NewWorkflowStep {
                workflow_id: workflow.id,
                agent_id,
                name: step_name,
                step_order: *order,
                config: serde_json::json!({}),
                depends_on: &depends_on,
            },
        )
        .await
        .expect("insert_workflow_step should succeed");
        inserted.push(step);
    }

    (workflow, inserted)
}
