//! Dependency-aware workflow orchestration over opaque agents.
//!
//! A workflow definition (phases, their agents, and declared predecessors)
//! expands into a DAG of task nodes. The scheduler walks the DAG, running
//! each node through a registered [`workflow_engine_sdk::TaskExecutor`],
//! resolving conflicting outputs from concurrently-run agents, looping
//! iterative phases until their condition holds, and recovering from
//! partial failures. The run's only output is a structured
//! [`report::RunReport`].

// Workflow definition model and builder
pub mod definition;

// Error taxonomy
pub mod error;

// Dependency graph construction and validation
pub mod graph;

// Iteration control for repeat-until-condition phases
pub mod iteration;

// Run reports
pub mod report;

// Conflict resolution for parallel groups
pub mod resolver;

// Top-level run API
pub mod runner;

// The scheduling control loop
pub mod scheduler;

// Run-scoped node state
pub mod state;

pub use definition::{
    default_priority_order, ExecutionMode, LoopCondition, PhaseSpec, WorkflowBuilder,
    WorkflowDefinition, DEFAULT_MAX_ITERATIONS,
};
pub use error::{EngineError, Result, ValidationError};
pub use graph::TaskGraph;
pub use iteration::{IterationRecord, IterationVerdict};
pub use report::{NodeReport, PhaseReport, RunOutcome, RunReport};
pub use resolver::{ConflictRecord, GroupResolution, ResolutionPolicy};
pub use runner::{run_workflow, WorkflowRunner};
pub use scheduler::{FailurePolicy, RetryPolicy, RunOptions};
pub use state::{NodeState, SkipReason};

// Re-export the executor-facing surface so engine consumers need a single
// dependency.
pub use workflow_engine_sdk as sdk;
