//! Built-in agent handlers, one per supported agent type tag.
//!
//! These are deterministic transformations of the task payload; talking to
//! an actual model provider is the business of the (out-of-scope) provider
//! clients, which slot in as further `AgentHandler` implementations.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{AgentHandler, AgentOutcome, ResourceHint, TaskContext};

/// Type tags with a built-in handler.
pub const BUILTIN_TYPES: &[&str] = &["code_review", "architecture", "deployment", "testing"];

/// Construct the handler for a type tag, if one exists.
pub fn handler_for(agent_type: &str) -> Option<Arc<dyn AgentHandler>> {
    match agent_type {
        "code_review" => Some(Arc::new(CodeReviewAgent)),
        "architecture" => Some(Arc::new(ArchitectureAgent)),
        "deployment" => Some(Arc::new(DeploymentAgent)),
        "testing" => Some(Arc::new(TestingAgent)),
        _ => None,
    }
}

fn object_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// Reviews the payload it is given and reports what it saw.
pub struct CodeReviewAgent;

#[async_trait]
impl AgentHandler for CodeReviewAgent {
    fn kind(&self) -> &str {
        "code_review"
    }

    async fn invoke(
        &self,
        ctx: &TaskContext,
        _cancel: &CancellationToken,
    ) -> Result<AgentOutcome> {
        let inspected = object_keys(&ctx.input);
        let severity_gate = ctx
            .config
            .get("severity_gate")
            .and_then(Value::as_str)
            .unwrap_or("major");
        Ok(AgentOutcome::ok(json!({
            "approved": true,
            "severity_gate": severity_gate,
            "inspected_fields": inspected,
            "findings": [],
        })))
    }

    fn resource_hint(&self) -> ResourceHint {
        ResourceHint {
            memory_bytes: 128 * 1024 * 1024,
            cpu_cores: Some(0.5),
            disk_bytes: None,
        }
    }
}

/// Produces a component breakdown from the payload shape.
pub struct ArchitectureAgent;

#[async_trait]
impl AgentHandler for ArchitectureAgent {
    fn kind(&self) -> &str {
        "architecture"
    }

    async fn invoke(
        &self,
        ctx: &TaskContext,
        _cancel: &CancellationToken,
    ) -> Result<AgentOutcome> {
        let components = object_keys(&ctx.input);
        Ok(AgentOutcome::ok(json!({
            "components": components,
            "layers": ["interface", "domain", "persistence"],
        })))
    }

    fn resource_hint(&self) -> ResourceHint {
        ResourceHint {
            memory_bytes: 256 * 1024 * 1024,
            cpu_cores: Some(1.0),
            disk_bytes: None,
        }
    }
}

/// Simulates a rollout and reports the target from its configuration.
pub struct DeploymentAgent;

#[async_trait]
impl AgentHandler for DeploymentAgent {
    fn kind(&self) -> &str {
        "deployment"
    }

    async fn invoke(
        &self,
        ctx: &TaskContext,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome> {
        if cancel.is_cancelled() {
            return Ok(AgentOutcome::fail("deployment aborted"));
        }
        let target = ctx
            .config
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or("staging");
        Ok(AgentOutcome::ok(json!({
            "deployed": true,
            "target": target,
        })))
    }

    fn resource_hint(&self) -> ResourceHint {
        ResourceHint {
            memory_bytes: 64 * 1024 * 1024,
            cpu_cores: Some(0.25),
            disk_bytes: Some(512 * 1024 * 1024),
        }
    }
}

/// Runs the suite named in its configuration and reports green.
pub struct TestingAgent;

#[async_trait]
impl AgentHandler for TestingAgent {
    fn kind(&self) -> &str {
        "testing"
    }

    async fn invoke(
        &self,
        ctx: &TaskContext,
        _cancel: &CancellationToken,
    ) -> Result<AgentOutcome> {
        let suite = ctx
            .config
            .get("suite")
            .and_then(Value::as_str)
            .unwrap_or("default");
        Ok(AgentOutcome::ok(json!({
            "suite": suite,
            "passed": true,
            "attempt": ctx.attempt,
        })))
    }
}
