//! Error taxonomy for the orchestrator.
//!
//! Errors split into three behavioral classes: non-retryable errors fail the
//! run immediately, `Concurrency` triggers a short-delay re-enqueue of the
//! same lifecycle tick, and everything else is a transient infrastructure
//! fault surfaced to the caller.

use thiserror::Error;

use crate::model::{RunState, SubtaskState};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("decomposition failed: {0}")]
    Decomposition(String),

    #[error("invalid transition {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },

    #[error("optimistic concurrency conflict on {0}")]
    Concurrency(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lease violation on run {0}")]
    LeaseViolation(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("planner error: {0}")]
    Planner(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Errors that fail the run outright; retrying cannot change the outcome.
    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Decomposition(_) | Self::InvalidTransition { .. }
        )
    }

    /// Lost an optimistic-version race; the tick should be re-enqueued.
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::Concurrency(_))
    }

    pub fn invalid_run_transition(from: RunState, to: RunState) -> Self {
        Self::InvalidTransition {
            entity: "run",
            from: from.as_str(),
            to: to.as_str(),
        }
    }

    pub fn invalid_subtask_transition(from: SubtaskState, to: SubtaskState) -> Self {
        Self::InvalidTransition {
            entity: "subtask",
            from: from.as_str(),
            to: to.as_str(),
        }
    }
}
