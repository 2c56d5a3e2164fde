//! Iteration control for repeat-until-condition phases.
//!
//! An iterative phase runs its sub-DAG, waits for every node to reach a
//! terminal state, and only then evaluates its loop condition against the
//! iteration's resolved results. Node states reset to Pending between
//! iterations while the full history of past iterations is preserved for
//! the final report. `max_iterations` is mandatory, so an iterative phase
//! can never loop forever.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use workflow_engine_sdk::{Severity, TaskResult};

use crate::definition::LoopCondition;
use crate::graph::GraphPhase;
use crate::resolver::GroupResolution;
use crate::state::NodeState;

/// What the controller decided after observing a finished iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationVerdict {
    /// The loop condition held; the phase is done.
    ConditionMet,
    /// The condition did not hold and budget remains; run another iteration.
    RunAgain,
    /// The condition never held within `max_iterations`; the phase is done
    /// with a warning.
    MaxIterationsReached,
}

/// Snapshot of one finished iteration, kept for the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based iteration number.
    pub iteration: u32,
    pub condition_met: bool,
    /// Terminal state of every phase node in this iteration.
    pub node_states: BTreeMap<String, NodeState>,
    /// Results of the nodes that succeeded, post conflict resolution.
    pub results: BTreeMap<String, TaskResult>,
    pub resolution: GroupResolution,
}

/// Drives one iterative phase through its repeat-until-condition loop.
#[derive(Debug)]
pub struct IterationTracker {
    phase_id: String,
    condition: LoopCondition,
    max_iterations: u32,
    current: u32,
    history: Vec<IterationRecord>,
}

impl IterationTracker {
    pub fn new(phase: &GraphPhase) -> Self {
        Self {
            phase_id: phase.phase_id.clone(),
            // Validation guarantees iterative phases carry a condition; the
            // fallback only matters for defensive completeness.
            condition: phase.loop_condition.unwrap_or(LoopCondition::AllNodesSucceeded),
            max_iterations: phase.max_iterations,
            current: 1,
            history: Vec::new(),
        }
    }

    pub fn phase_id(&self) -> &str {
        &self.phase_id
    }

    /// 1-based number of the iteration currently running.
    pub fn current_iteration(&self) -> u32 {
        self.current
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    pub fn into_history(self) -> Vec<IterationRecord> {
        self.history
    }

    /// Record a finished iteration and decide what happens next.
    ///
    /// Must only be called once every node of the iteration is terminal and
    /// the group's conflict resolution has run.
    pub fn observe(
        &mut self,
        node_states: BTreeMap<String, NodeState>,
        results: BTreeMap<String, TaskResult>,
        resolution: GroupResolution,
    ) -> IterationVerdict {
        let condition_met = evaluate(self.condition, &node_states, &results, &resolution);

        self.history.push(IterationRecord {
            iteration: self.current,
            condition_met,
            node_states,
            results,
            resolution,
        });

        if condition_met {
            IterationVerdict::ConditionMet
        } else if self.current >= self.max_iterations {
            IterationVerdict::MaxIterationsReached
        } else {
            self.current += 1;
            IterationVerdict::RunAgain
        }
    }
}

fn evaluate(
    condition: LoopCondition,
    node_states: &BTreeMap<String, NodeState>,
    results: &BTreeMap<String, TaskResult>,
    resolution: &GroupResolution,
) -> bool {
    match condition {
        LoopCondition::AllNodesSucceeded => node_states
            .values()
            .all(|state| *state == NodeState::Succeeded),
        LoopCondition::NoBlockingResults => results
            .values()
            .all(|result| result.severity != Severity::Blocking),
        LoopCondition::NoConflicts => resolution.is_clean(),
    }
}
