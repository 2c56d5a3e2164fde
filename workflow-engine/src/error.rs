//! Error taxonomy for the engine.
//!
//! Build-time errors ([`EngineError::CyclicDependency`],
//! [`EngineError::Validation`]) abort a run before any node executes.
//! Execution-time failures are data: they are recorded on the affected nodes
//! and surface through the run report, never as panics.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The phase dependency graph contains a cycle. Fatal, non-retryable,
    /// detected before any task executes.
    #[error("workflow contains a dependency cycle involving phase '{0}'")]
    CyclicDependency(String),

    /// The definition failed schema validation. All violations are collected
    /// in one pass so a workflow author gets complete feedback at once.
    #[error("workflow definition is invalid: {}", format_validation(.0))]
    Validation(Vec<ValidationError>),

    /// A node exhausted its retry budget. Surfaces per node in the report;
    /// returned directly only by node-level helpers.
    #[error("node '{node_id}' exhausted its retry budget after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        node_id: String,
        attempts: u32,
        last_error: String,
    },

    /// The run-scoped cancellation signal fired.
    #[error("run cancelled")]
    RunCancelled,

    /// The overall run deadline passed before every node reached a terminal
    /// state.
    #[error("run deadline exceeded")]
    DeadlineExceeded,
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// One schema violation in a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("workflow has no phases")]
    EmptyWorkflow,

    #[error("phase '{phase_id}' is defined more than once")]
    DuplicatePhase { phase_id: String },

    #[error("phase '{phase_id}' lists no agents")]
    EmptyPhase { phase_id: String },

    #[error("phase '{phase_id}' lists agent '{agent_id}' more than once")]
    DuplicateAgent { phase_id: String, agent_id: String },

    #[error("phase '{phase_id}' references unknown predecessor '{predecessor_id}'")]
    UnknownPredecessor {
        phase_id: String,
        predecessor_id: String,
    },

    #[error("phase '{phase_id}' carries a loop condition but is not iterative")]
    LoopConditionOnNonIterativePhase { phase_id: String },

    #[error("iterative phase '{phase_id}' is missing a loop condition")]
    MissingLoopCondition { phase_id: String },

    #[error("iterative phase '{phase_id}' has max_iterations of zero")]
    ZeroMaxIterations { phase_id: String },

    #[error("no executor registered for agent '{agent_id}' (phase '{phase_id}')")]
    UnknownAgent { phase_id: String, agent_id: String },
}
