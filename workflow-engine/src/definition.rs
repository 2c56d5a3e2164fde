//! Declarative workflow definitions.
//!
//! A [`WorkflowDefinition`] is pure data: an ordered list of phases, each
//! naming the agents it invokes and the phases it depends on. Definitions
//! are built either programmatically through [`WorkflowDefinition::builder`]
//! or loaded from a YAML/JSON document, validated once by the graph builder,
//! and immutable afterwards. Customizing a workflow means constructing a new
//! definition value, never editing engine code.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default bound on iterative phases. Mandatory so that infinite loops are
/// structurally impossible.
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Default conflict-resolution priority over agent categories, highest
/// first. Overridable per workflow via `priority_order`.
pub fn default_priority_order() -> Vec<String> {
    ["security", "correctness", "performance", "style"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// How the agents of a phase are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Agents run one at a time, in listed order.
    Sequential,
    /// Agents run concurrently; results are conflict-resolved as a group.
    ParallelGroup,
    /// The phase repeats until its loop condition holds or the iteration
    /// bound is reached.
    Iterative,
}

/// Loop termination predicate for iterative phases.
///
/// Kept declarative so definitions stay serializable data. Evaluated only
/// after an iteration's nodes all reach a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopCondition {
    /// Every node of the iteration succeeded.
    AllNodesSucceeded,
    /// No succeeded result carries blocking severity.
    NoBlockingResults,
    /// The iteration's conflict resolution produced no conflicts.
    NoConflicts,
}

/// One named step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// Unique phase identifier.
    pub phase_id: String,
    /// Phases that must fully resolve before this phase may start.
    #[serde(default)]
    pub predecessor_ids: Vec<String>,
    pub execution_mode: ExecutionMode,
    /// Agents invoked within this phase; one task node per agent.
    pub agent_ids: Vec<String>,
    /// Only meaningful for iterative phases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_condition: Option<LoopCondition>,
    /// Iteration bound; defaults to [`DEFAULT_MAX_ITERATIONS`] when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

impl PhaseSpec {
    /// A phase whose agents run one after another.
    pub fn sequential(
        phase_id: impl Into<String>,
        agent_ids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::with_mode(phase_id, agent_ids, ExecutionMode::Sequential)
    }

    /// A phase whose agents run concurrently as one conflict-resolved group.
    pub fn parallel(
        phase_id: impl Into<String>,
        agent_ids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::with_mode(phase_id, agent_ids, ExecutionMode::ParallelGroup)
    }

    /// A phase that repeats until `condition` holds, at most `max_iterations`
    /// times.
    pub fn iterative(
        phase_id: impl Into<String>,
        agent_ids: impl IntoIterator<Item = impl Into<String>>,
        condition: LoopCondition,
        max_iterations: u32,
    ) -> Self {
        let mut spec = Self::with_mode(phase_id, agent_ids, ExecutionMode::Iterative);
        spec.loop_condition = Some(condition);
        spec.max_iterations = Some(max_iterations);
        spec
    }

    fn with_mode(
        phase_id: impl Into<String>,
        agent_ids: impl IntoIterator<Item = impl Into<String>>,
        execution_mode: ExecutionMode,
    ) -> Self {
        Self {
            phase_id: phase_id.into(),
            predecessor_ids: Vec::new(),
            execution_mode,
            agent_ids: agent_ids.into_iter().map(Into::into).collect(),
            loop_condition: None,
            max_iterations: None,
        }
    }

    /// Declare the phases that must resolve before this one starts.
    pub fn depends_on(mut self, predecessors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.predecessor_ids = predecessors.into_iter().map(Into::into).collect();
        self
    }

    /// Effective iteration bound for this phase.
    pub fn iteration_bound(&self) -> u32 {
        self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS)
    }
}

/// Immutable, user-supplied description of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub phases: Vec<PhaseSpec>,
    /// Conflict-resolution priority over agent categories, highest first.
    #[serde(default = "default_priority_order")]
    pub priority_order: Vec<String>,
    /// Free-form parameters passed through to every executor invocation.
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl WorkflowDefinition {
    /// Start building a definition programmatically.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            definition: WorkflowDefinition {
                name: name.into(),
                description: String::new(),
                phases: Vec::new(),
                priority_order: default_priority_order(),
                params: HashMap::new(),
            },
        }
    }

    /// Parse a definition from a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Parse a definition from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Render the definition as YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn phase(&self, phase_id: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.phase_id == phase_id)
    }
}

/// Fluent builder over [`WorkflowDefinition`].
///
/// Validation is deferred to graph construction so the builder itself is
/// infallible.
#[derive(Debug)]
pub struct WorkflowBuilder {
    definition: WorkflowDefinition,
}

impl WorkflowBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = description.into();
        self
    }

    pub fn phase(mut self, spec: PhaseSpec) -> Self {
        self.definition.phases.push(spec);
        self
    }

    /// Override the default conflict-resolution priority ordering.
    pub fn priority_order(mut self, order: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.definition.priority_order = order.into_iter().map(Into::into).collect();
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.definition
            .params
            .insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> WorkflowDefinition {
        self.definition
    }
}
