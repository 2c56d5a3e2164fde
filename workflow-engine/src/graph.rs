//! Dependency graph construction.
//!
//! Expands a [`WorkflowDefinition`] into one task node per (phase, agent)
//! pair, wires phase-level predecessor edges, and rejects invalid
//! definitions before anything executes. Building is a pure function over
//! the definition: the same input always yields the same graph, node for
//! node, in the same order.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::definition::{ExecutionMode, LoopCondition, WorkflowDefinition};
use crate::error::{EngineError, Result, ValidationError};

/// Stable node identifier for one (phase, agent) pair.
pub fn node_id(phase_id: &str, agent_id: &str) -> String {
    format!("{}/{}", phase_id, agent_id)
}

/// One schedulable (phase, agent) execution unit.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub node_id: String,
    pub phase_id: String,
    pub agent_id: String,
    /// Node ids that must reach a successful terminal state before this
    /// node becomes ready. Phase-wide for cross-phase edges, plus the
    /// previous sibling inside a sequential phase.
    pub predecessors: BTreeSet<String>,
}

/// One phase of the expanded graph.
#[derive(Debug, Clone)]
pub struct GraphPhase {
    pub phase_id: String,
    pub mode: ExecutionMode,
    /// Direct predecessor phases, deduplicated, in declaration order.
    pub predecessor_phases: Vec<String>,
    /// Node ids belonging to this phase, in agent declaration order.
    pub node_ids: Vec<String>,
    pub loop_condition: Option<LoopCondition>,
    pub max_iterations: u32,
}

/// Validated, acyclic task graph for one workflow definition.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    phases: Vec<GraphPhase>,
    nodes: Vec<GraphNode>,
    phase_index: HashMap<String, usize>,
    node_index: HashMap<String, usize>,
    /// Phase ids of every phase that depends on the keyed phase.
    dependents: HashMap<String, Vec<String>>,
}

impl TaskGraph {
    /// Build and validate the graph.
    ///
    /// All schema violations are collected into one
    /// [`EngineError::Validation`]; a cyclic definition fails with
    /// [`EngineError::CyclicDependency`] before any task executes.
    pub fn build(def: &WorkflowDefinition) -> Result<Self> {
        let errors = validate(def);
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        check_acyclic(def)?;

        let mut phases = Vec::with_capacity(def.phases.len());
        let mut nodes = Vec::new();
        let mut phase_index = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for spec in &def.phases {
            let predecessor_phases = dedup_preserving_order(&spec.predecessor_ids);
            for pred in &predecessor_phases {
                dependents
                    .entry(pred.clone())
                    .or_default()
                    .push(spec.phase_id.clone());
            }

            // Every node inherits the full node set of each predecessor
            // phase.
            let inherited: BTreeSet<String> = predecessor_phases
                .iter()
                .flat_map(|pred| {
                    def.phase(pred)
                        .map(|p| {
                            p.agent_ids
                                .iter()
                                .map(|a| node_id(pred, a))
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default()
                })
                .collect();

            let mut node_ids = Vec::with_capacity(spec.agent_ids.len());
            for (idx, agent_id) in spec.agent_ids.iter().enumerate() {
                let id = node_id(&spec.phase_id, agent_id);
                let mut predecessors = inherited.clone();

                // Sequential phases chain their agents in listed order;
                // parallel groups have no edges among themselves.
                if spec.execution_mode == ExecutionMode::Sequential && idx > 0 {
                    predecessors.insert(node_id(&spec.phase_id, &spec.agent_ids[idx - 1]));
                }

                nodes.push(GraphNode {
                    node_id: id.clone(),
                    phase_id: spec.phase_id.clone(),
                    agent_id: agent_id.clone(),
                    predecessors,
                });
                node_ids.push(id);
            }

            phase_index.insert(spec.phase_id.clone(), phases.len());
            phases.push(GraphPhase {
                phase_id: spec.phase_id.clone(),
                mode: spec.execution_mode,
                predecessor_phases,
                node_ids,
                loop_condition: spec.loop_condition,
                max_iterations: spec.iteration_bound(),
            });
        }

        let node_index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.node_id.clone(), i))
            .collect();

        Ok(Self {
            phases,
            nodes,
            phase_index,
            node_index,
            dependents,
        })
    }

    pub fn phases(&self) -> &[GraphPhase] {
        &self.phases
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn phase(&self, phase_id: &str) -> Option<&GraphPhase> {
        self.phase_index.get(phase_id).map(|&i| &self.phases[i])
    }

    pub fn node(&self, node_id: &str) -> Option<&GraphNode> {
        self.node_index.get(node_id).map(|&i| &self.nodes[i])
    }

    /// Phases that directly depend on `phase_id`.
    pub fn dependents_of(&self, phase_id: &str) -> &[String] {
        self.dependents
            .get(phase_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Phase ids in a topological order consistent with declared
    /// predecessors. Deterministic across rebuilds.
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = self
            .phases
            .iter()
            .map(|p| (p.phase_id.as_str(), p.predecessor_phases.len()))
            .collect();

        let mut queue: VecDeque<&str> = self
            .phases
            .iter()
            .filter(|p| p.predecessor_phases.is_empty())
            .map(|p| p.phase_id.as_str())
            .collect();

        let mut order = Vec::with_capacity(self.phases.len());
        while let Some(phase_id) = queue.pop_front() {
            order.push(phase_id.to_string());
            for dependent in self.dependents_of(phase_id) {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }

        order
    }
}

fn dedup_preserving_order(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// Collect every schema violation in one pass.
fn validate(def: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if def.phases.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
        return errors;
    }

    let mut seen_phases = HashSet::new();
    for spec in &def.phases {
        if !seen_phases.insert(spec.phase_id.as_str()) {
            errors.push(ValidationError::DuplicatePhase {
                phase_id: spec.phase_id.clone(),
            });
        }
    }
    let known: HashSet<&str> = def.phases.iter().map(|p| p.phase_id.as_str()).collect();

    for spec in &def.phases {
        if spec.agent_ids.is_empty() {
            errors.push(ValidationError::EmptyPhase {
                phase_id: spec.phase_id.clone(),
            });
        }

        let mut seen_agents = HashSet::new();
        for agent_id in &spec.agent_ids {
            if !seen_agents.insert(agent_id.as_str()) {
                errors.push(ValidationError::DuplicateAgent {
                    phase_id: spec.phase_id.clone(),
                    agent_id: agent_id.clone(),
                });
            }
        }

        for pred in &spec.predecessor_ids {
            if !known.contains(pred.as_str()) {
                errors.push(ValidationError::UnknownPredecessor {
                    phase_id: spec.phase_id.clone(),
                    predecessor_id: pred.clone(),
                });
            }
        }

        match spec.execution_mode {
            ExecutionMode::Iterative => {
                if spec.loop_condition.is_none() {
                    errors.push(ValidationError::MissingLoopCondition {
                        phase_id: spec.phase_id.clone(),
                    });
                }
                if spec.max_iterations == Some(0) {
                    errors.push(ValidationError::ZeroMaxIterations {
                        phase_id: spec.phase_id.clone(),
                    });
                }
            }
            _ => {
                if spec.loop_condition.is_some() {
                    errors.push(ValidationError::LoopConditionOnNonIterativePhase {
                        phase_id: spec.phase_id.clone(),
                    });
                }
            }
        }
    }

    errors
}

/// Kahn's algorithm over the phase graph. Any phase left unprocessed sits on
/// a cycle.
fn check_acyclic(def: &WorkflowDefinition) -> Result<()> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();

    for spec in &def.phases {
        in_degree.entry(spec.phase_id.as_str()).or_insert(0);
        let mut seen = HashSet::new();
        for pred in &spec.predecessor_ids {
            if seen.insert(pred.as_str()) {
                *in_degree.entry(spec.phase_id.as_str()).or_insert(0) += 1;
                edges
                    .entry(pred.as_str())
                    .or_default()
                    .push(spec.phase_id.as_str());
            }
        }
    }

    let mut queue: VecDeque<&str> = def
        .phases
        .iter()
        .filter(|p| in_degree.get(p.phase_id.as_str()) == Some(&0))
        .map(|p| p.phase_id.as_str())
        .collect();

    let mut processed = 0;
    while let Some(phase_id) = queue.pop_front() {
        processed += 1;
        for &dependent in edges.get(phase_id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if processed < def.phases.len() {
        // Name the lexicographically smallest cyclic phase so the error is
        // stable across runs.
        let mut cyclic: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree > 0)
            .map(|(&id, _)| id)
            .collect();
        cyclic.sort_unstable();
        return Err(EngineError::CyclicDependency(
            cyclic.first().unwrap_or(&"<unknown>").to_string(),
        ));
    }

    Ok(())
}
