//! Executor-facing surface of the workflow engine.
//!
//! A workflow is a set of phases, each phase a set of agent invocations. The
//! engine knows nothing about what an agent *does*; it only needs something
//! that implements [`TaskExecutor`]. This crate holds that capability trait,
//! the structured result types an executor produces, the error taxonomy it
//! reports through, and the [`RunEvent`] stream the engine emits while a run
//! is in flight.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// Re-export async trait for convenience
pub use async_trait::async_trait;

/// How strongly a result asserts itself over the resources it claims.
///
/// Ordering matters: `Blocking` always overrides `Advisory` and
/// `Informational` during conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Informational,
    Advisory,
    Blocking,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Informational => "informational",
            Self::Advisory => "advisory",
            Self::Blocking => "blocking",
        };
        f.write_str(label)
    }
}

/// Structured output of one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Resource identifiers this result asserts authority over,
    /// e.g. `"security-policy:auth.ts"`.
    #[serde(default)]
    pub claims: BTreeSet<String>,
    /// Weight of the result during conflict resolution.
    pub severity: Severity,
    /// Opaque content produced by the agent.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Node ids this result conflicted with. Populated by the engine's
    /// conflict resolver, never by the agent itself.
    #[serde(default)]
    pub conflicts_with: Vec<String>,
}

impl TaskResult {
    pub fn new(severity: Severity) -> Self {
        Self {
            claims: BTreeSet::new(),
            severity,
            payload: serde_json::Value::Null,
            conflicts_with: Vec::new(),
        }
    }

    pub fn with_claim(mut self, resource: impl Into<String>) -> Self {
        self.claims.insert(resource.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Errors an executor may surface to the engine.
///
/// The split drives the retry policy: `Transient` failures are retried with
/// backoff up to the configured budget, `Fatal` failures mark the node
/// Failed immediately.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// Recoverable failure (timeout, executor temporarily unavailable).
    #[error("transient execution failure: {0}")]
    Transient(String),

    /// Unrecoverable failure (malformed input, executor cannot perform).
    #[error("fatal execution failure: {0}")]
    Fatal(String),

    /// The executor observed cancellation and stopped cooperatively.
    #[error("execution cancelled")]
    Cancelled,
}

/// Read-only snapshot handed to an executor for one node attempt.
///
/// Everything in here is owned by the invocation; executors never see or
/// mutate the engine's run state directly.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    /// Identifier of the run this invocation belongs to.
    pub run_id: Uuid,
    /// Phase the node belongs to.
    pub phase_id: String,
    /// Agent being invoked.
    pub agent_id: String,
    /// Node id (`phase/agent`), stable across retries.
    pub node_id: String,
    /// 1-based attempt number. Greater than 1 on retries.
    pub attempt: u32,
    /// 1-based iteration number for nodes inside an iterative phase.
    pub iteration: Option<u32>,
    /// Free-form workflow parameters, passed through from the definition.
    pub params: HashMap<String, String>,
    /// Results of every succeeded predecessor node, keyed by node id.
    pub upstream: HashMap<String, TaskResult>,
    /// Run-scoped cancellation signal. Long-running executors should
    /// observe this and return [`ExecutionError::Cancelled`].
    pub cancel: CancellationToken,
}

/// Capability consumed by the engine: one opaque agent invocation.
///
/// Implementations must be idempotent-safe: the engine may call `execute`
/// more than once for the same node id after a transient failure.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the agent against the given context.
    async fn execute(&self, ctx: PhaseContext) -> Result<TaskResult, ExecutionError>;

    /// Category used by the conflict resolver's priority ordering
    /// (e.g. `"security"`, `"performance"`).
    fn category(&self) -> &str {
        "general"
    }
}

/// Registry mapping agent ids to executors.
///
/// Pure interface polymorphism over a closed operation set: no inheritance
/// hierarchy, just dynamic dispatch through [`TaskExecutor`].
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under an agent id. Replaces any previous
    /// registration for the same id.
    pub fn register(&mut self, agent_id: impl Into<String>, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(agent_id.into(), executor);
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.executors.contains_key(agent_id)
    }

    /// Registered agent ids, sorted for deterministic output.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.executors.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("agents", &self.agent_ids())
            .finish()
    }
}

/// Structured events emitted by the engine while a run is in flight.
///
/// Broadcast over `tokio::sync::broadcast`; intended for a reporting layer
/// (UI/CLI) that subscribes through the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Run accepted and scheduling started
    RunStarted {
        run_id: Uuid,
        workflow: String,
    },
    /// All nodes of a phase became schedulable
    PhaseStarted {
        phase_id: String,
    },
    /// Phase reached a terminal, resolved state
    PhaseCompleted {
        phase_id: String,
    },
    /// Node dispatched (first attempt only)
    NodeStarted {
        node_id: String,
    },
    /// Node attempt failed transiently; another attempt is scheduled
    NodeRetrying {
        node_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// Node reached Succeeded
    NodeSucceeded {
        node_id: String,
    },
    /// Node reached Failed
    NodeFailed {
        node_id: String,
        error: String,
    },
    /// Node reached Skipped
    NodeSkipped {
        node_id: String,
        reason: String,
    },
    /// A parallel group finished and its results were resolved
    GroupResolved {
        phase_id: String,
        conflicts: usize,
    },
    /// An iterative phase started iteration `iteration`
    IterationStarted {
        phase_id: String,
        iteration: u32,
    },
    /// An iterative phase finished iteration `iteration`
    IterationCompleted {
        phase_id: String,
        iteration: u32,
        condition_met: bool,
    },
    /// Run reached a terminal outcome
    RunCompleted {
        run_id: Uuid,
        outcome: String,
    },
}

/// Receiver half of the engine's structured event stream.
pub type RunEventReceiver = tokio::sync::broadcast::Receiver<RunEvent>;
