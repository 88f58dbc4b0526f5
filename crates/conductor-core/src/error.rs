//! Error taxonomy surfaced to API callers.

use thiserror::Error;

/// Client-attributable and internal failures of orchestrator operations.
///
/// Transient conditions (resource denial, queue redelivery) never surface
/// here; they are absorbed by requeue-with-backoff inside the engine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed input, missing fields, illegal values. Not retried.
    #[error("{0}")]
    Validation(String),

    /// The actor lacks permission or crossed an organization boundary.
    #[error("{0}")]
    Forbidden(String),

    /// Workflow, run, or task does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Illegal status transition (e.g. cancelling a terminal run).
    #[error("{0}")]
    Conflict(String),

    /// State store or queue failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Stable machine-readable code for the API error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
        }
    }
}
