//! Run reports.
//!
//! The report is the engine's only durable output: the true terminal state
//! of every node, every group's conflict records, and the full iteration
//! history of every iterative phase, regardless of how the run ended.
//! Partial reports from cancelled or deadline-exceeded runs are first-class,
//! not degraded error states. Rendering (UI/CLI) is a consumer concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use workflow_engine_sdk::TaskResult;

use crate::definition::ExecutionMode;
use crate::iteration::IterationRecord;
use crate::resolver::GroupResolution;
use crate::state::{NodeState, SkipReason, TaskNode};

/// How the run as a whole ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every phase resolved. Individual nodes may still have failed under
    /// the fail-forward policy.
    Completed,
    /// A node failure aborted the run under the fail-fast policy.
    Failed,
    /// The run-scoped cancellation signal fired.
    Cancelled,
    /// The overall run deadline passed.
    DeadlineExceeded,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
        };
        f.write_str(label)
    }
}

/// Final record of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: String,
    pub phase_id: String,
    pub agent_id: String,
    pub state: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeReport {
    pub(crate) fn from_node(node: &TaskNode) -> Self {
        Self {
            node_id: node.node_id.clone(),
            phase_id: node.phase_id.clone(),
            agent_id: node.agent_id.clone(),
            state: node.state,
            skip_reason: node.skip_reason,
            attempts: node.attempt_count,
            started_at: node.started_at,
            finished_at: node.finished_at,
            result: node.result.clone(),
            error: node.error.clone(),
        }
    }
}

/// Final record of one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase_id: String,
    pub mode: ExecutionMode,
    /// Conflict resolution for parallel groups; `None` for sequential
    /// phases and for groups the run never finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<GroupResolution>,
    /// Per-iteration history for iterative phases, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iterations: Vec<IterationRecord>,
    /// Why an iterative phase stopped looping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<String>,
}

/// Structured output of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub nodes: Vec<NodeReport>,
    pub phases: Vec<PhaseReport>,
}

impl RunReport {
    pub fn node(&self, node_id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn phase(&self, phase_id: &str) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase_id == phase_id)
    }

    /// Count of nodes in the given terminal (or intermediate) state.
    pub fn count_in_state(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|n| n.state == state).count()
    }

    /// Render the report as YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Render the report as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
