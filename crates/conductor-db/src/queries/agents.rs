//! Query functions for the `agents` catalog table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Agent, AgentStatus};

/// Fields for inserting a new agent definition.
#[derive(Debug, Clone)]
pub struct NewAgent<'a> {
    pub organization_id: Uuid,
    pub name: &'a str,
    pub agent_type: &'a str,
    pub capabilities: &'a [String],
    pub tools: &'a [String],
    pub max_concurrency: i32,
    pub config: serde_json::Value,
}

/// Insert a new agent definition.
pub async fn insert_agent(pool: &PgPool, agent: &NewAgent<'_>) -> Result<Agent> {
    let row = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents (organization_id, name, agent_type, capabilities, tools, max_concurrency, config) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(agent.organization_id)
    .bind(agent.name)
    .bind(agent.agent_type)
    .bind(agent.capabilities)
    .bind(agent.tools)
    .bind(agent.max_concurrency)
    .bind(&agent.config)
    .fetch_one(pool)
    .await
    .context("failed to insert agent")?;

    Ok(row)
}

/// Fetch a single agent by ID.
pub async fn get_agent(pool: &PgPool, id: Uuid) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// List every `active` agent. The registry seeds itself from this at startup.
pub async fn list_active_agents(pool: &PgPool) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents WHERE status = 'active' ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active agents")?;

    Ok(agents)
}

/// Update an agent's status.
pub async fn set_agent_status(pool: &PgPool, id: Uuid, status: AgentStatus) -> Result<()> {
    let result = sqlx::query("UPDATE agents SET status = $1, updated_at = NOW() WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update agent status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("agent {id} not found");
    }

    Ok(())
}
