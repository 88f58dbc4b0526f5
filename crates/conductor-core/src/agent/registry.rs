//! Agent registry -- the in-memory catalog of invocable agents.
//!
//! Keyed by agent identifier; seeded at startup from the state store by
//! binding each catalog row to the built-in handler for its type tag.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::models::Agent;
use conductor_db::queries::agents as agent_db;

use super::{builtin, AgentHandler, AgentOutcome, ResourceHint, TaskContext};

/// Error text recorded when an invocation exceeds its deadline.
pub const TIMEOUT_ERROR: &str = "timeout_exceeded";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    AgentNotFound(Uuid),
}

/// A catalog row paired with its handler.
#[derive(Clone)]
pub struct RegisteredAgent {
    pub definition: Agent,
    pub handler: Arc<dyn AgentHandler>,
}

impl std::fmt::Debug for RegisteredAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAgent")
            .field("definition", &self.definition)
            .field("handler", &self.handler.kind())
            .finish()
    }
}

/// How an invocation ended, as seen by the worker.
#[derive(Debug)]
pub enum InvokeOutcome {
    /// The handler returned (successfully or not); handler panics and
    /// errors are folded into a failed [`AgentOutcome`].
    Completed(AgentOutcome),
    /// The cancellation signal fired first.
    Cancelled,
    /// The per-task deadline fired first.
    TimedOut,
}

/// In-memory catalog of agents, keyed by identity.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<Uuid, RegisteredAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an agent by identifier. Idempotent.
    pub fn register(&self, definition: Agent, handler: Arc<dyn AgentHandler>) {
        let mut agents = self.agents.write().expect("registry lock poisoned");
        agents.insert(definition.id, RegisteredAgent {
            definition,
            handler,
        });
    }

    /// Look up an agent by identifier.
    pub fn get(&self, agent_id: Uuid) -> Result<RegisteredAgent, RegistryError> {
        let agents = self.agents.read().expect("registry lock poisoned");
        agents
            .get(&agent_id)
            .cloned()
            .ok_or(RegistryError::AgentNotFound(agent_id))
    }

    /// All registered catalog rows.
    pub fn list(&self) -> Vec<Agent> {
        let agents = self.agents.read().expect("registry lock poisoned");
        let mut rows: Vec<Agent> = agents.values().map(|a| a.definition.clone()).collect();
        rows.sort_by_key(|a| a.created_at);
        rows
    }

    pub fn len(&self) -> usize {
        self.agents.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resource defaults for an agent, by way of its handler.
    pub fn resource_hint(&self, agent_id: Uuid) -> Result<ResourceHint, RegistryError> {
        Ok(self.get(agent_id)?.handler.resource_hint())
    }

    /// Seed the registry from every `active` agent row in the store.
    ///
    /// Rows whose type tag has no built-in handler are skipped with a
    /// warning; they stay invisible to dispatch until a handler exists.
    pub async fn seed_from_store(&self, pool: &PgPool) -> Result<usize> {
        let rows = agent_db::list_active_agents(pool).await?;
        let mut seeded = 0;
        for row in rows {
            match builtin::handler_for(&row.agent_type) {
                Some(handler) => {
                    self.register(row, handler);
                    seeded += 1;
                }
                None => {
                    tracing::warn!(
                        agent_id = %row.id,
                        agent_type = %row.agent_type,
                        "no handler for agent type, skipping registration"
                    );
                }
            }
        }
        tracing::info!(count = seeded, "agent registry seeded");
        Ok(seeded)
    }

    /// Invoke an agent with a cancellation signal and a hard deadline.
    ///
    /// The registry never retries; the queue owns redelivery. A handler
    /// error is a failed outcome, not an `Err` -- infrastructure failures
    /// are the worker's concern, agent misbehavior is data.
    pub async fn invoke(
        &self,
        agent: &RegisteredAgent,
        ctx: &TaskContext,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> InvokeOutcome {
        tokio::select! {
            result = agent.handler.invoke(ctx, cancel) => match result {
                Ok(outcome) => InvokeOutcome::Completed(outcome),
                Err(e) => InvokeOutcome::Completed(AgentOutcome::fail(format!("{e:#}"))),
            },
            _ = cancel.cancelled() => InvokeOutcome::Cancelled,
            _ = tokio::time::sleep(timeout) => InvokeOutcome::TimedOut,
        }
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let agents = self.agents.read().expect("registry lock poisoned");
        f.debug_struct("AgentRegistry")
            .field("agents", &agents.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use conductor_db::models::AgentStatus;

    fn definition(name: &str) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: name.to_string(),
            agent_type: "testing".to_string(),
            capabilities: vec!["testing".to_string()],
            tools: vec![],
            status: AgentStatus::Active,
            max_concurrency: 1,
            config: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn ctx() -> TaskContext {
        TaskContext {
            task_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            attempt: 0,
            input: serde_json::json!({}),
            config: serde_json::json!({}),
        }
    }

    struct SlowAgent;

    #[async_trait]
    impl AgentHandler for SlowAgent {
        fn kind(&self) -> &str {
            "slow"
        }

        async fn invoke(
            &self,
            _ctx: &TaskContext,
            cancel: &CancellationToken,
        ) -> Result<AgentOutcome> {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                _ = cancel.cancelled() => {}
            }
            Ok(AgentOutcome::ok(serde_json::json!({})))
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl AgentHandler for FailingAgent {
        fn kind(&self) -> &str {
            "failing"
        }

        async fn invoke(
            &self,
            _ctx: &TaskContext,
            _cancel: &CancellationToken,
        ) -> Result<AgentOutcome> {
            anyhow::bail!("handler blew up")
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = AgentRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn register_and_get() {
        let registry = AgentRegistry::new();
        let def = definition("alpha");
        let id = def.id;
        registry.register(def, Arc::new(SlowAgent));

        let found = registry.get(id).expect("agent should be registered");
        assert_eq!(found.definition.name, "alpha");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn register_replaces_by_id() {
        let registry = AgentRegistry::new();
        let mut def = definition("alpha");
        let id = def.id;
        registry.register(def.clone(), Arc::new(SlowAgent));
        def.name = "alpha v2".to_string();
        registry.register(def, Arc::new(SlowAgent));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(id).unwrap().definition.name, "alpha v2");
    }

    #[test]
    fn get_missing_fails() {
        let registry = AgentRegistry::new();
        let err = registry.get(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, RegistryError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn invoke_times_out() {
        let registry = AgentRegistry::new();
        let def = definition("slow");
        let id = def.id;
        registry.register(def, Arc::new(SlowAgent));
        let agent = registry.get(id).unwrap();

        let outcome = registry
            .invoke(
                &agent,
                &ctx(),
                &CancellationToken::new(),
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(outcome, InvokeOutcome::TimedOut));
    }

    #[tokio::test]
    async fn invoke_observes_cancellation() {
        let registry = AgentRegistry::new();
        let def = definition("slow");
        let id = def.id;
        registry.register(def, Arc::new(SlowAgent));
        let agent = registry.get(id).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = registry
            .invoke(&agent, &ctx(), &cancel, Duration::from_secs(5))
            .await;
        assert!(matches!(outcome, InvokeOutcome::Cancelled));
    }

    #[tokio::test]
    async fn handler_error_becomes_failed_outcome() {
        let registry = AgentRegistry::new();
        let def = definition("failing");
        let id = def.id;
        registry.register(def, Arc::new(FailingAgent));
        let agent = registry.get(id).unwrap();

        let outcome = registry
            .invoke(
                &agent,
                &ctx(),
                &CancellationToken::new(),
                Duration::from_secs(5),
            )
            .await;
        match outcome {
            InvokeOutcome::Completed(result) => {
                assert!(!result.success);
                assert!(result.error.unwrap().contains("handler blew up"));
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }
}
