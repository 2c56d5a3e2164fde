//! Run-scoped node state.
//!
//! [`RunState`] is owned exclusively by the scheduler's control loop for the
//! duration of one run; no other component writes to it, so no locking
//! discipline is needed. Each run gets its own isolated state, which is what
//! allows independent runs to execute concurrently in one process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use workflow_engine_sdk::TaskResult;

use crate::graph::{GraphNode, TaskGraph};

/// Lifecycle of one task node.
///
/// `Succeeded`, `Failed` and `Skipped` are terminal: no further transitions
/// are possible for that attempt. Retries increment the attempt counter on
/// the same node id instead of minting a new node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Why a node was skipped instead of executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A transitive predecessor failed.
    UpstreamFailed,
    /// A transitive predecessor was itself skipped.
    UpstreamSkipped,
    /// The run-scoped cancellation signal fired before dispatch.
    RunCancelled,
    /// The overall run deadline passed before dispatch.
    DeadlineExceeded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UpstreamFailed => "upstream_failed",
            Self::UpstreamSkipped => "upstream_skipped",
            Self::RunCancelled => "run_cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
        };
        f.write_str(label)
    }
}

/// Mutable record of one (phase, agent) node across a run.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub node_id: String,
    pub phase_id: String,
    pub agent_id: String,
    /// Resolver category of the executor behind this node; captured when
    /// the registry is validated at run start.
    pub category: String,
    pub state: NodeState,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub attempt_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    fn from_graph(node: &GraphNode) -> Self {
        Self {
            node_id: node.node_id.clone(),
            phase_id: node.phase_id.clone(),
            agent_id: node.agent_id.clone(),
            category: "general".to_string(),
            state: NodeState::Pending,
            result: None,
            error: None,
            skip_reason: None,
            attempt_count: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Node-id-keyed state for one run. BTreeMap keeps iteration order (and
/// therefore reports) deterministic.
#[derive(Debug)]
pub struct RunState {
    nodes: BTreeMap<String, TaskNode>,
}

impl RunState {
    pub fn new(graph: &TaskGraph) -> Self {
        let nodes = graph
            .nodes()
            .iter()
            .map(|n| (n.node_id.clone(), TaskNode::from_graph(n)))
            .collect();
        Self { nodes }
    }

    pub fn node(&self, node_id: &str) -> Option<&TaskNode> {
        self.nodes.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut TaskNode> {
        self.nodes.get_mut(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    pub fn mark_ready(&mut self, node_id: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            debug_assert_eq!(node.state, NodeState::Pending);
            node.state = NodeState::Ready;
        }
    }

    /// Record the start of an attempt. The first attempt stamps
    /// `started_at`; retries only bump the counter.
    pub fn mark_running(&mut self, node_id: &str, attempt: u32) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.state = NodeState::Running;
            node.attempt_count = attempt;
            if attempt == 1 {
                node.started_at = Some(Utc::now());
            }
        }
    }

    pub fn mark_succeeded(&mut self, node_id: &str, result: TaskResult) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            debug_assert_eq!(node.state, NodeState::Running);
            node.state = NodeState::Succeeded;
            node.result = Some(result);
            node.error = None;
            node.finished_at = Some(Utc::now());
        }
    }

    pub fn mark_failed(&mut self, node_id: &str, error: impl Into<String>) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.state = NodeState::Failed;
            node.error = Some(error.into());
            node.finished_at = Some(Utc::now());
        }
    }

    pub fn mark_skipped(&mut self, node_id: &str, reason: SkipReason) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            debug_assert!(!node.state.is_terminal());
            node.state = NodeState::Skipped;
            node.skip_reason = Some(reason);
            node.finished_at = Some(Utc::now());
        }
    }

    /// Reset a node to Pending for the next iteration of an iterative
    /// phase. History is the iteration record's concern; the node itself
    /// starts fresh.
    pub fn reset_for_iteration(&mut self, node_id: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.state = NodeState::Pending;
            node.result = None;
            node.error = None;
            node.skip_reason = None;
            node.attempt_count = 0;
            node.started_at = None;
            node.finished_at = None;
        }
    }

    /// Ids of every node not yet in a terminal state, sorted.
    pub fn unfinished_node_ids(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| !n.is_terminal())
            .map(|n| n.node_id.clone())
            .collect()
    }
}
