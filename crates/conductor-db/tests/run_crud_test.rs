//! Run creation and optimistic-locked status transitions.

use conductor_db::models::{RunStatus, TaskStatus, WorkflowStatus};
use conductor_db::queries::runs::{self, NewRun, RunTransitionFields};
use conductor_db::queries::tasks::{self, TaskTransitionFields};
use conductor_db::queries::workflows;
use conductor_test_utils::seed::{seed_agent, seed_org_and_user, seed_workflow};
use conductor_test_utils::{create_test_db, drop_test_db};

fn new_run(
    workflow_id: uuid::Uuid,
    user_id: uuid::Uuid,
    org_id: uuid::Uuid,
) -> NewRun {
    NewRun {
        workflow_id,
        submitted_by: user_id,
        organization_id: org_id,
        input: serde_json::json!({"title": "x"}),
        priority: "normal".parse().unwrap(),
        max_retries: 3,
        timeout_ms: 300_000,
    }
}

#[tokio::test]
async fn create_run_snapshots_one_task_per_step() {
    let (pool, db_name) = create_test_db().await;
    let (org, user) = seed_org_and_user(&pool).await;
    let agent = seed_agent(&pool, org.id, "testing").await;
    let (workflow, steps) = seed_workflow(
        &pool,
        org.id,
        agent.id,
        "three-steps",
        &[("extract", 1, &[]), ("transform", 2, &[]), ("load", 3, &[])],
    )
    .await;

    let (run, task_rows) = runs::create_run(&pool, &new_run(workflow.id, user.id, org.id))
        .await
        .expect("create_run should succeed");

    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(task_rows.len(), steps.len());
    for (task, step) in task_rows.iter().zip(&steps) {
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.step_id, step.id);
        assert_eq!(task.step_name, step.name);
        assert_eq!(task.step_order, step.step_order);
        assert_eq!(task.agent_id, agent.id);
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn create_run_rejects_disabled_workflow() {
    let (pool, db_name) = create_test_db().await;
    let (org, user) = seed_org_and_user(&pool).await;
    let agent = seed_agent(&pool, org.id, "testing").await;
    let (workflow, _) =
        seed_workflow(&pool, org.id, agent.id, "disabled", &[("only", 1, &[])]).await;

    workflows::set_workflow_status(&pool, workflow.id, WorkflowStatus::Disabled)
        .await
        .expect("set_workflow_status should succeed");

    let result = runs::create_run(&pool, &new_run(workflow.id, user.id, org.id)).await;
    assert!(result.is_err(), "disabled workflow must reject new runs");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn create_run_rejects_foreign_organization() {
    let (pool, db_name) = create_test_db().await;
    let (org, _user) = seed_org_and_user(&pool).await;
    let (other_org, other_user) = seed_org_and_user(&pool).await;
    let agent = seed_agent(&pool, org.id, "testing").await;
    let (workflow, _) =
        seed_workflow(&pool, org.id, agent.id, "scoped", &[("only", 1, &[])]).await;

    let result =
        runs::create_run(&pool, &new_run(workflow.id, other_user.id, other_org.id)).await;
    assert!(result.is_err(), "cross-tenant submission must be rejected");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn run_transition_is_optimistically_locked() {
    let (pool, db_name) = create_test_db().await;
    let (org, user) = seed_org_and_user(&pool).await;
    let agent = seed_agent(&pool, org.id, "testing").await;
    let (workflow, _) = seed_workflow(&pool, org.id, agent.id, "cas", &[("only", 1, &[])]).await;
    let (run, _) = runs::create_run(&pool, &new_run(workflow.id, user.id, org.id))
        .await
        .unwrap();

    let rows = runs::transition_run_status(
        &pool,
        run.id,
        RunStatus::Pending,
        RunStatus::Running,
        &RunTransitionFields {
            started_at: Some(chrono::Utc::now()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    // A second transition expecting `pending` loses the race.
    let rows = runs::transition_run_status(
        &pool,
        run.id,
        RunStatus::Pending,
        RunStatus::Cancelled,
        &RunTransitionFields::default(),
    )
    .await
    .unwrap();
    assert_eq!(rows, 0, "stale CAS must not update the row");

    let current = runs::get_run(&pool, run.id).await.unwrap().unwrap();
    assert_eq!(current.status, RunStatus::Running);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn task_retry_resets_row_and_increments_counter() {
    let (pool, db_name) = create_test_db().await;
    let (org, user) = seed_org_and_user(&pool).await;
    let agent = seed_agent(&pool, org.id, "testing").await;
    let (workflow, _) = seed_workflow(&pool, org.id, agent.id, "retry", &[("only", 1, &[])]).await;
    let (_, task_rows) = runs::create_run(&pool, &new_run(workflow.id, user.id, org.id))
        .await
        .unwrap();
    let task = &task_rows[0];

    tasks::transition_task_status(
        &pool,
        task.id,
        TaskStatus::Pending,
        TaskStatus::Running,
        &TaskTransitionFields {
            started_at: Some(chrono::Utc::now()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    tasks::transition_task_status(
        &pool,
        task.id,
        TaskStatus::Running,
        TaskStatus::Failed,
        &TaskTransitionFields {
            completed_at: Some(chrono::Utc::now()),
            error: Some("boom".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let rows = tasks::transition_task_retry(&pool, task.id, 0).await.unwrap();
    assert_eq!(rows, 1);

    let reloaded = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Pending);
    assert_eq!(reloaded.retry_count, 1);
    assert!(reloaded.error.is_none());
    assert!(reloaded.started_at.is_none());
    assert!(reloaded.completed_at.is_none());

    // Retrying with a stale counter fails the optimistic lock.
    let rows = tasks::transition_task_retry(&pool, task.id, 0).await.unwrap();
    assert_eq!(rows, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn terminal_task_rejects_further_transitions() {
    let (pool, db_name) = create_test_db().await;
    let (org, user) = seed_org_and_user(&pool).await;
    let agent = seed_agent(&pool, org.id, "testing").await;
    let (workflow, _) =
        seed_workflow(&pool, org.id, agent.id, "terminal", &[("only", 1, &[])]).await;
    let (_, task_rows) = runs::create_run(&pool, &new_run(workflow.id, user.id, org.id))
        .await
        .unwrap();
    let task = &task_rows[0];

    tasks::transition_task_status(
        &pool,
        task.id,
        TaskStatus::Pending,
        TaskStatus::Running,
        &TaskTransitionFields::default(),
    )
    .await
    .unwrap();
    tasks::transition_task_status(
        &pool,
        task.id,
        TaskStatus::Running,
        TaskStatus::Completed,
        &TaskTransitionFields {
            completed_at: Some(chrono::Utc::now()),
            output: Some(serde_json::json!({"ok": true})),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // A duplicate delivery attempting running -> failed finds no matching row.
    let rows = tasks::transition_task_status(
        &pool,
        task.id,
        TaskStatus::Running,
        TaskStatus::Failed,
        &TaskTransitionFields::default(),
    )
    .await
    .unwrap();
    assert_eq!(rows, 0, "terminal state must be sticky");

    let reloaded = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Completed);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn recovery_fails_nonterminal_tasks_only() {
    let (pool, db_name) = create_test_db().await;
    let (org, user) = seed_org_and_user(&pool).await;
    let agent = seed_agent(&pool, org.id, "testing").await;
    let (workflow, _) = seed_workflow(
        &pool,
        org.id,
        agent.id,
        "recovery",
        &[("a", 1, &[]), ("b", 2, &[]), ("c", 3, &[])],
    )
    .await;
    let (run, task_rows) = runs::create_run(&pool, &new_run(workflow.id, user.id, org.id))
        .await
        .unwrap();

    // a completed, b running, c pending.
    tasks::transition_task_status(
        &pool,
        task_rows[0].id,
        TaskStatus::Pending,
        TaskStatus::Running,
        &TaskTransitionFields::default(),
    )
    .await
    .unwrap();
    tasks::transition_task_status(
        &pool,
        task_rows[0].id,
        TaskStatus::Running,
        TaskStatus::Completed,
        &TaskTransitionFields::default(),
    )
    .await
    .unwrap();
    tasks::transition_task_status(
        &pool,
        task_rows[1].id,
        TaskStatus::Pending,
        TaskStatus::Running,
        &TaskTransitionFields::default(),
    )
    .await
    .unwrap();

    let failed = tasks::fail_nonterminal_tasks_for_run(&pool, run.id, "orchestrator_restart")
        .await
        .unwrap();
    assert_eq!(failed.len(), 2, "only b and c should be failed");

    let reloaded = tasks::list_tasks_for_run(&pool, run.id).await.unwrap();
    assert_eq!(reloaded[0].status, TaskStatus::Completed);
    assert_eq!(reloaded[1].status, TaskStatus::Failed);
    assert_eq!(reloaded[2].status, TaskStatus::Failed);
    assert_eq!(reloaded[1].error.as_deref(), Some("orchestrator_restart"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn count_active_runs_tracks_terminal_transitions() {
    let (pool, db_name) = create_test_db().await;
    let (org, user) = seed_org_and_user(&pool).await;
    let agent = seed_agent(&pool, org.id, "testing").await;
    let (workflow, _) =
        seed_workflow(&pool, org.id, agent.id, "counted", &[("only", 1, &[])]).await;

    assert_eq!(runs::count_active_runs_for_org(&pool, org.id).await.unwrap(), 0);

    let (run, _) = runs::create_run(&pool, &new_run(workflow.id, user.id, org.id))
        .await
        .unwrap();
    assert_eq!(runs::count_active_runs_for_org(&pool, org.id).await.unwrap(), 1);

    runs::transition_run_status(
        &pool,
        run.id,
        RunStatus::Pending,
        RunStatus::Cancelled,
        &RunTransitionFields::default(),
    )
    .await
    .unwrap();
    assert_eq!(runs::count_active_runs_for_org(&pool, org.id).await.unwrap(), 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}
