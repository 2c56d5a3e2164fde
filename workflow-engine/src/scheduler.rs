//! The scheduling control loop.
//!
//! Every task node runs as its own spawned tokio task; the scheduler itself
//! is single-threaded in its decision logic. All state transitions happen
//! inside one serialized loop reading from a completion channel, so
//! [`RunState`] needs no locks: executors communicate results back only
//! through the channel and never touch engine state.
//!
//! Ordering guarantees enforced here:
//! - a phase's nodes are never dispatched until every node of all its
//!   predecessor phases is terminal and the predecessor groups resolved;
//! - a parallel group's results are buffered and handed to the conflict
//!   resolver in one batch, after the whole group is terminal, so conflict
//!   detection is deterministic regardless of completion order;
//! - iteration boundaries are full barriers.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use workflow_engine_sdk::{
    ExecutionError, ExecutorRegistry, PhaseContext, RunEvent, TaskResult,
};

use crate::definition::{ExecutionMode, WorkflowDefinition};
use crate::error::{EngineError, Result, ValidationError};
use crate::graph::TaskGraph;
use crate::iteration::{IterationTracker, IterationVerdict};
use crate::report::{NodeReport, PhaseReport, RunOutcome, RunReport};
use crate::resolver::{resolve_group, GroupMember, GroupResolution};
use crate::state::{NodeState, RunState, SkipReason};

/// What happens to the rest of the run when a node fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Contain the failure: dependents skip, independent work continues.
    FailForward,
    /// Abort the whole run on the first node failure.
    FailFast,
}

/// Retry policy for transient node failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a node is attempted at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            factor: 2,
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `completed_attempt` (1-based).
    pub fn delay_for(&self, completed_attempt: u32) -> Duration {
        let exponent = completed_attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(self.factor.saturating_pow(exponent));
        delay.min(self.max_delay)
    }
}

/// Per-run configuration.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Upper bound on concurrently running nodes. `None` means unlimited
    /// within whatever the graph allows.
    pub max_concurrency: Option<usize>,
    /// Per-node execution timeout; exceeding it counts as a transient
    /// failure subject to the retry policy.
    pub node_timeout: Duration,
    /// Overall run deadline. `None` means the run may take as long as its
    /// nodes do.
    pub run_timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
    pub retry: RetryPolicy,
    /// Run-scoped cancellation signal. Cancelling it asks running nodes to
    /// cooperatively abort and skips everything not yet dispatched.
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            node_timeout: Duration::from_secs(120),
            run_timeout: None,
            failure_policy: FailurePolicy::FailForward,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// One node attempt's outcome, sent from the spawned task back to the loop.
pub(crate) struct NodeCompletion {
    node_id: String,
    attempt: u32,
    outcome: std::result::Result<TaskResult, ExecutionError>,
}

/// Runtime bookkeeping for one phase.
struct PhaseRun {
    /// Nodes of the current iteration not yet terminal or buffered.
    outstanding: usize,
    resolved: bool,
    resolution: Option<GroupResolution>,
    termination: Option<String>,
    tracker: Option<IterationTracker>,
}

pub(crate) struct Scheduler {
    run_id: Uuid,
    workflow: String,
    graph: TaskGraph,
    registry: Arc<ExecutorRegistry>,
    opts: RunOptions,
    events: broadcast::Sender<RunEvent>,
    params: HashMap<String, String>,
    priority_order: Vec<String>,
    state: RunState,
    phase_runs: BTreeMap<String, PhaseRun>,
    /// Successful parallel-group results buffered until the group resolves.
    pending_results: HashMap<String, TaskResult>,
    ready: VecDeque<String>,
    in_flight: usize,
    unresolved_phases: usize,
    /// Set once the run is tearing down (cancel, deadline, fail-fast);
    /// holds the outcome the report will carry.
    draining: Option<RunOutcome>,
    warnings: Vec<String>,
    tx: mpsc::UnboundedSender<NodeCompletion>,
}

impl Scheduler {
    /// Validate the registry against the graph and set up run state.
    pub(crate) fn new(
        graph: TaskGraph,
        def: &WorkflowDefinition,
        registry: Arc<ExecutorRegistry>,
        opts: RunOptions,
        events: broadcast::Sender<RunEvent>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NodeCompletion>)> {
        let mut errors = Vec::new();
        let mut state = RunState::new(&graph);

        for node in graph.nodes() {
            match registry.get(&node.agent_id) {
                Some(executor) => {
                    if let Some(task) = state.node_mut(&node.node_id) {
                        task.category = executor.category().to_string();
                    }
                }
                None => errors.push(ValidationError::UnknownAgent {
                    phase_id: node.phase_id.clone(),
                    agent_id: node.agent_id.clone(),
                }),
            }
        }
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        let phase_runs = graph
            .phases()
            .iter()
            .map(|phase| {
                let tracker = (phase.mode == ExecutionMode::Iterative)
                    .then(|| IterationTracker::new(phase));
                (
                    phase.phase_id.clone(),
                    PhaseRun {
                        outstanding: phase.node_ids.len(),
                        resolved: false,
                        resolution: None,
                        termination: None,
                        tracker,
                    },
                )
            })
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let unresolved_phases = graph.phases().len();

        Ok((
            Self {
                run_id: Uuid::new_v4(),
                workflow: def.name.clone(),
                graph,
                registry,
                opts,
                events,
                params: def.params.clone(),
                priority_order: def.priority_order.clone(),
                state,
                phase_runs,
                pending_results: HashMap::new(),
                ready: VecDeque::new(),
                in_flight: 0,
                unresolved_phases,
                draining: None,
                warnings: Vec::new(),
                tx,
            },
            rx,
        ))
    }

    /// Drive every node to a terminal state and assemble the report.
    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<NodeCompletion>,
    ) -> RunReport {
        let started_at = Utc::now();
        self.emit(RunEvent::RunStarted {
            run_id: self.run_id,
            workflow: self.workflow.clone(),
        });
        debug!(run_id = %self.run_id, workflow = %self.workflow, "run started");

        let roots: Vec<String> = self
            .graph
            .phases()
            .iter()
            .filter(|p| p.predecessor_phases.is_empty())
            .map(|p| p.phase_id.clone())
            .collect();
        for phase_id in roots {
            self.activate_phase(&phase_id);
        }

        let cancel = self.opts.cancel.clone();
        let deadline = self
            .opts
            .run_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            if self.draining.is_none() {
                self.dispatch_ready();
            }

            if self.in_flight == 0 {
                if self.draining.is_some() || self.unresolved_phases == 0 {
                    break;
                }
                if self.ready.is_empty() {
                    // Nothing running, nothing schedulable, phases open:
                    // the graph invariants should make this unreachable.
                    warn!(run_id = %self.run_id, "scheduler stalled with unresolved phases");
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled(), if self.draining.is_none() => {
                    debug!(run_id = %self.run_id, "cancellation signal received");
                    self.begin_drain(RunOutcome::Cancelled, SkipReason::RunCancelled);
                }
                _ = sleep_until_opt(deadline), if self.draining.is_none() && deadline.is_some() => {
                    warn!(run_id = %self.run_id, "run deadline exceeded");
                    self.begin_drain(RunOutcome::DeadlineExceeded, SkipReason::DeadlineExceeded);
                }
                completion = rx.recv() => {
                    if let Some(completion) = completion {
                        self.handle_completion(completion);
                    }
                }
            }
        }

        self.finalize(started_at)
    }

    fn emit(&self, event: RunEvent) {
        // Subscribers are optional; a lagging or absent receiver must not
        // stall the run.
        let _ = self.events.send(event);
    }

    fn phase_mode(&self, phase_id: &str) -> ExecutionMode {
        self.graph
            .phase(phase_id)
            .map(|p| p.mode)
            .unwrap_or(ExecutionMode::Sequential)
    }

    fn phase_node_ids(&self, phase_id: &str) -> Vec<String> {
        self.graph
            .phase(phase_id)
            .map(|p| p.node_ids.clone())
            .unwrap_or_default()
    }

    // ---- dispatch ---------------------------------------------------------

    fn dispatch_ready(&mut self) {
        let cap = self.opts.max_concurrency.unwrap_or(usize::MAX).max(1);
        while self.in_flight < cap {
            let Some(node_id) = self.ready.pop_front() else {
                break;
            };
            self.dispatch_node(&node_id, 1, Duration::ZERO);
        }
    }

    fn dispatch_node(&mut self, node_id: &str, attempt: u32, delay: Duration) {
        let (phase_id, agent_id) = match self.state.node(node_id) {
            Some(node) => (node.phase_id.clone(), node.agent_id.clone()),
            None => return,
        };

        self.state.mark_running(node_id, attempt);
        if attempt == 1 {
            self.emit(RunEvent::NodeStarted {
                node_id: node_id.to_string(),
            });
            debug!(node_id, "node dispatched");
        }

        let Some(executor) = self.registry.get(&agent_id) else {
            // Registry was validated up front; losing an executor mid-run is
            // a fatal node error, not a crash.
            self.in_flight += 1;
            let _ = self.tx.send(NodeCompletion {
                node_id: node_id.to_string(),
                attempt,
                outcome: Err(ExecutionError::Fatal(format!(
                    "no executor registered for agent '{}'",
                    agent_id
                ))),
            });
            return;
        };

        let iteration = self
            .phase_runs
            .get(&phase_id)
            .and_then(|run| run.tracker.as_ref())
            .map(|tracker| tracker.current_iteration());

        let ctx = PhaseContext {
            run_id: self.run_id,
            phase_id,
            agent_id,
            node_id: node_id.to_string(),
            attempt,
            iteration,
            params: self.params.clone(),
            upstream: self.upstream_results(node_id),
            cancel: self.opts.cancel.child_token(),
        };

        let tx = self.tx.clone();
        let cancel = self.opts.cancel.clone();
        let node_timeout = self.opts.node_timeout;
        let id = node_id.to_string();
        self.in_flight += 1;

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = if cancel.is_cancelled() {
                Err(ExecutionError::Cancelled)
            } else {
                match tokio::time::timeout(node_timeout, executor.execute(ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(ExecutionError::Transient(format!(
                        "node timed out after {:?}",
                        node_timeout
                    ))),
                }
            };
            let _ = tx.send(NodeCompletion {
                node_id: id,
                attempt,
                outcome,
            });
        });
    }

    /// Results of every succeeded direct predecessor, for the executor's
    /// read-only context.
    fn upstream_results(&self, node_id: &str) -> HashMap<String, TaskResult> {
        let Some(graph_node) = self.graph.node(node_id) else {
            return HashMap::new();
        };
        graph_node
            .predecessors
            .iter()
            .filter_map(|pred| {
                self.state.node(pred).and_then(|node| {
                    (node.state == NodeState::Succeeded)
                        .then(|| (pred.clone(), node.result.clone()))
                        .and_then(|(id, result)| result.map(|r| (id, r)))
                })
            })
            .collect()
    }

    // ---- phase activation and skipping ------------------------------------

    fn activate_phase(&mut self, phase_id: &str) {
        let mode = self.phase_mode(phase_id);
        let node_ids = self.phase_node_ids(phase_id);
        if node_ids.is_empty() {
            return;
        }

        self.emit(RunEvent::PhaseStarted {
            phase_id: phase_id.to_string(),
        });

        match mode {
            ExecutionMode::Sequential => {
                self.state.mark_ready(&node_ids[0]);
                self.ready.push_back(node_ids[0].clone());
            }
            ExecutionMode::ParallelGroup | ExecutionMode::Iterative => {
                for id in &node_ids {
                    self.state.mark_ready(id);
                    self.ready.push_back(id.clone());
                }
                if mode == ExecutionMode::Iterative {
                    self.emit(RunEvent::IterationStarted {
                        phase_id: phase_id.to_string(),
                        iteration: 1,
                    });
                }
            }
        }
    }

    /// Skip every unfinished node of a phase and resolve it.
    fn skip_phase(&mut self, phase_id: &str, reason: SkipReason) {
        for id in self.phase_node_ids(phase_id) {
            let unfinished = self
                .state
                .node(&id)
                .map(|n| !n.is_terminal())
                .unwrap_or(false);
            if unfinished {
                self.state.mark_skipped(&id, reason);
                self.emit(RunEvent::NodeSkipped {
                    node_id: id.clone(),
                    reason: reason.to_string(),
                });
                self.decrement_outstanding(phase_id);
            }
        }

        let termination = (self.phase_mode(phase_id) == ExecutionMode::Iterative)
            .then(|| format!("skipped ({})", reason));
        self.resolve_phase(phase_id, termination);
        self.check_dependents(phase_id);
    }

    /// Once a phase resolves, decide what its dependents do: activate,
    /// cascade a skip, or wait for their other predecessors.
    fn check_dependents(&mut self, phase_id: &str) {
        if self.draining.is_some() {
            return;
        }

        let dependents: Vec<String> = self.graph.dependents_of(phase_id).to_vec();
        for dependent in dependents {
            let already_resolved = self
                .phase_runs
                .get(&dependent)
                .map(|run| run.resolved)
                .unwrap_or(true);
            if already_resolved {
                continue;
            }

            let predecessors = self
                .graph
                .phase(&dependent)
                .map(|p| p.predecessor_phases.clone())
                .unwrap_or_default();
            let all_resolved = predecessors.iter().all(|pred| {
                self.phase_runs
                    .get(pred)
                    .map(|run| run.resolved)
                    .unwrap_or(false)
            });
            if !all_resolved {
                continue;
            }

            let mut upstream_failed = false;
            let mut upstream_skipped = false;
            for pred in &predecessors {
                let (failed, skipped) = self.phase_flags(pred);
                upstream_failed |= failed;
                upstream_skipped |= skipped;
            }

            if upstream_failed {
                self.skip_phase(&dependent, SkipReason::UpstreamFailed);
            } else if upstream_skipped {
                self.skip_phase(&dependent, SkipReason::UpstreamSkipped);
            } else {
                self.activate_phase(&dependent);
            }
        }
    }

    /// Whether a resolved phase left failed or skipped nodes behind.
    fn phase_flags(&self, phase_id: &str) -> (bool, bool) {
        let mut failed = false;
        let mut skipped = false;
        for id in self.phase_node_ids(phase_id) {
            match self.state.node(&id).map(|n| n.state) {
                Some(NodeState::Failed) => failed = true,
                Some(NodeState::Skipped) => skipped = true,
                _ => {}
            }
        }
        (failed, skipped)
    }

    fn resolve_phase(&mut self, phase_id: &str, termination: Option<String>) {
        let Some(run) = self.phase_runs.get_mut(phase_id) else {
            return;
        };
        if run.resolved {
            return;
        }
        run.resolved = true;
        if termination.is_some() {
            run.termination = termination;
        }
        self.unresolved_phases -= 1;
        self.emit(RunEvent::PhaseCompleted {
            phase_id: phase_id.to_string(),
        });
        debug!(phase_id, "phase resolved");
    }

    fn decrement_outstanding(&mut self, phase_id: &str) {
        if let Some(run) = self.phase_runs.get_mut(phase_id) {
            run.outstanding = run.outstanding.saturating_sub(1);
        }
    }

    // ---- completion handling ----------------------------------------------

    fn handle_completion(&mut self, completion: NodeCompletion) {
        self.in_flight -= 1;

        let current_state = self.state.node(&completion.node_id).map(|n| n.state);
        if current_state != Some(NodeState::Running) {
            // The node was force-skipped while its attempt was in flight.
            return;
        }

        match completion.outcome {
            Ok(result) => self.handle_success(completion.node_id, result),
            Err(error) => self.handle_error(completion.node_id, completion.attempt, error),
        }
    }

    fn handle_success(&mut self, node_id: String, result: TaskResult) {
        let Some(node) = self.state.node(&node_id) else {
            return;
        };
        let phase_id = node.phase_id.clone();

        match self.phase_mode(&phase_id) {
            ExecutionMode::Sequential => {
                self.state.mark_succeeded(&node_id, result);
                self.emit(RunEvent::NodeSucceeded {
                    node_id: node_id.clone(),
                });
                self.decrement_outstanding(&phase_id);

                if self.draining.is_none() {
                    if let Some(next) = self.next_in_chain(&phase_id, &node_id) {
                        if self.state.node(&next).map(|n| n.state) == Some(NodeState::Pending) {
                            self.state.mark_ready(&next);
                            self.ready.push_back(next);
                        }
                    }
                }
                self.maybe_finish_phase(&phase_id);
            }
            ExecutionMode::ParallelGroup | ExecutionMode::Iterative => {
                // Buffer until the whole group is terminal; the node is only
                // marked Succeeded once the group's conflicts are resolved.
                self.pending_results.insert(node_id, result);
                self.decrement_outstanding(&phase_id);
                self.maybe_finish_phase(&phase_id);
            }
        }
    }

    fn handle_error(&mut self, node_id: String, attempt: u32, error: ExecutionError) {
        match error {
            ExecutionError::Transient(message) => {
                if self.draining.is_some() {
                    self.fail_node(&node_id, message);
                } else if attempt <= self.opts.retry.max_retries {
                    let delay = self.opts.retry.delay_for(attempt);
                    debug!(node_id = %node_id, attempt, delay_ms = delay.as_millis() as u64,
                        "transient failure, scheduling retry");
                    self.emit(RunEvent::NodeRetrying {
                        node_id: node_id.clone(),
                        attempt: attempt + 1,
                        delay_ms: delay.as_millis() as u64,
                        error: message,
                    });
                    self.dispatch_node(&node_id, attempt + 1, delay);
                } else {
                    let exhausted = EngineError::RetriesExhausted {
                        node_id: node_id.clone(),
                        attempts: attempt,
                        last_error: message,
                    };
                    warn!(node_id = %node_id, attempts = attempt, "retry budget exhausted");
                    self.fail_node(&node_id, exhausted.to_string());
                }
            }
            ExecutionError::Fatal(_) | ExecutionError::Cancelled => {
                self.fail_node(&node_id, error.to_string());
            }
        }
    }

    fn fail_node(&mut self, node_id: &str, error: String) {
        let phase_id = match self.state.node(node_id) {
            Some(node) => node.phase_id.clone(),
            None => return,
        };

        self.state.mark_failed(node_id, error.clone());
        self.emit(RunEvent::NodeFailed {
            node_id: node_id.to_string(),
            error,
        });
        self.decrement_outstanding(&phase_id);

        if self.opts.failure_policy == FailurePolicy::FailFast && self.draining.is_none() {
            warn!(node_id, "node failed under fail-fast policy, aborting run");
            self.begin_drain(RunOutcome::Failed, SkipReason::RunCancelled);
            return;
        }

        // Inside a sequential phase the rest of the chain can never become
        // ready; skip it now so the phase reaches a terminal state.
        if self.phase_mode(&phase_id) == ExecutionMode::Sequential && self.draining.is_none() {
            for id in self.phase_node_ids(&phase_id) {
                if self.state.node(&id).map(|n| n.state) == Some(NodeState::Pending) {
                    self.state.mark_skipped(&id, SkipReason::UpstreamFailed);
                    self.emit(RunEvent::NodeSkipped {
                        node_id: id.clone(),
                        reason: SkipReason::UpstreamFailed.to_string(),
                    });
                    self.decrement_outstanding(&phase_id);
                }
            }
        }

        self.maybe_finish_phase(&phase_id);
    }

    fn next_in_chain(&self, phase_id: &str, node_id: &str) -> Option<String> {
        let node_ids = self.phase_node_ids(phase_id);
        let position = node_ids.iter().position(|id| id == node_id)?;
        node_ids.get(position + 1).cloned()
    }

    // ---- phase completion -------------------------------------------------

    fn maybe_finish_phase(&mut self, phase_id: &str) {
        let finished = self
            .phase_runs
            .get(phase_id)
            .map(|run| !run.resolved && run.outstanding == 0)
            .unwrap_or(false);
        if !finished {
            return;
        }

        match self.phase_mode(phase_id) {
            ExecutionMode::Sequential => {
                self.resolve_phase(phase_id, None);
                self.check_dependents(phase_id);
            }
            ExecutionMode::ParallelGroup | ExecutionMode::Iterative => {
                self.finish_group(phase_id);
            }
        }
    }

    /// The whole group is terminal-or-buffered: resolve conflicts in one
    /// batch, then mark the buffered members Succeeded.
    fn finish_group(&mut self, phase_id: &str) {
        let mode = self.phase_mode(phase_id);
        let node_ids = self.phase_node_ids(phase_id);
        let iteration = self
            .phase_runs
            .get(phase_id)
            .and_then(|run| run.tracker.as_ref())
            .map(|tracker| tracker.current_iteration());

        let mut members = Vec::new();
        for id in &node_ids {
            if let Some(result) = self.pending_results.remove(id) {
                let (category, started_at) = self
                    .state
                    .node(id)
                    .map(|n| (n.category.clone(), n.started_at))
                    .unwrap_or_else(|| ("general".to_string(), None));
                members.push(GroupMember {
                    node_id: id.clone(),
                    category,
                    started_at,
                    result,
                });
            }
        }

        let resolution = resolve_group(phase_id, iteration, &mut members, &self.priority_order);
        for member in members {
            self.state.mark_succeeded(&member.node_id, member.result);
            self.emit(RunEvent::NodeSucceeded {
                node_id: member.node_id,
            });
        }
        self.emit(RunEvent::GroupResolved {
            phase_id: phase_id.to_string(),
            conflicts: resolution.conflicts.len(),
        });

        match mode {
            ExecutionMode::ParallelGroup => {
                if let Some(run) = self.phase_runs.get_mut(phase_id) {
                    run.resolution = Some(resolution);
                }
                self.resolve_phase(phase_id, None);
                self.check_dependents(phase_id);
            }
            ExecutionMode::Iterative => self.finish_iteration(phase_id, &node_ids, resolution),
            ExecutionMode::Sequential => {
                debug_assert!(false, "sequential phases never resolve as groups");
            }
        }
    }

    fn finish_iteration(
        &mut self,
        phase_id: &str,
        node_ids: &[String],
        resolution: GroupResolution,
    ) {
        let node_states: BTreeMap<String, NodeState> = node_ids
            .iter()
            .map(|id| {
                let state = self
                    .state
                    .node(id)
                    .map(|n| n.state)
                    .unwrap_or(NodeState::Pending);
                (id.clone(), state)
            })
            .collect();
        let results: BTreeMap<String, TaskResult> = node_ids
            .iter()
            .filter_map(|id| {
                self.state
                    .node(id)
                    .and_then(|n| n.result.clone())
                    .map(|result| (id.clone(), result))
            })
            .collect();

        let (iteration, verdict) = {
            let Some(run) = self.phase_runs.get_mut(phase_id) else {
                return;
            };
            let Some(tracker) = run.tracker.as_mut() else {
                return;
            };
            let iteration = tracker.current_iteration();
            (iteration, tracker.observe(node_states, results, resolution))
        };

        self.emit(RunEvent::IterationCompleted {
            phase_id: phase_id.to_string(),
            iteration,
            condition_met: verdict == IterationVerdict::ConditionMet,
        });

        match verdict {
            IterationVerdict::ConditionMet => {
                self.resolve_phase(
                    phase_id,
                    Some(format!("condition met after {} iteration(s)", iteration)),
                );
                self.check_dependents(phase_id);
            }
            IterationVerdict::MaxIterationsReached => {
                let warning = format!(
                    "phase '{}' reached max iterations ({}) without meeting its loop condition",
                    phase_id, iteration
                );
                warn!(phase_id, iterations = iteration, "max iterations reached");
                self.warnings.push(warning);
                self.resolve_phase(phase_id, Some("max iterations reached".to_string()));
                self.check_dependents(phase_id);
            }
            IterationVerdict::RunAgain => {
                if self.draining.is_some() {
                    self.resolve_phase(
                        phase_id,
                        Some("aborted before next iteration".to_string()),
                    );
                    return;
                }
                for id in node_ids {
                    self.state.reset_for_iteration(id);
                    self.state.mark_ready(id);
                    self.ready.push_back(id.clone());
                }
                if let Some(run) = self.phase_runs.get_mut(phase_id) {
                    run.outstanding = node_ids.len();
                }
                self.emit(RunEvent::IterationStarted {
                    phase_id: phase_id.to_string(),
                    iteration: iteration + 1,
                });
            }
        }
    }

    // ---- teardown ---------------------------------------------------------

    /// Stop scheduling new work: skip everything not yet dispatched, ask
    /// running nodes to abort, and let in-flight completions drain.
    fn begin_drain(&mut self, outcome: RunOutcome, reason: SkipReason) {
        if self.draining.is_some() {
            return;
        }
        self.draining = Some(outcome);
        self.ready.clear();
        self.opts.cancel.cancel();

        let to_skip: Vec<(String, String)> = self
            .state
            .nodes()
            .filter(|n| matches!(n.state, NodeState::Pending | NodeState::Ready))
            .map(|n| (n.node_id.clone(), n.phase_id.clone()))
            .collect();
        for (node_id, phase_id) in to_skip {
            self.state.mark_skipped(&node_id, reason);
            self.emit(RunEvent::NodeSkipped {
                node_id,
                reason: reason.to_string(),
            });
            self.decrement_outstanding(&phase_id);
        }

        // Phases with no in-flight nodes left can resolve immediately;
        // those with running nodes resolve as their completions arrive.
        let phase_ids: Vec<String> = self
            .graph
            .phases()
            .iter()
            .map(|p| p.phase_id.clone())
            .collect();
        for phase_id in phase_ids {
            let open = self
                .phase_runs
                .get(&phase_id)
                .map(|run| !run.resolved && run.outstanding == 0)
                .unwrap_or(false);
            if !open {
                continue;
            }
            let has_buffered = self
                .phase_node_ids(&phase_id)
                .iter()
                .any(|id| self.pending_results.contains_key(id));
            if has_buffered {
                self.finish_group(&phase_id);
            } else {
                let termination = (self.phase_mode(&phase_id) == ExecutionMode::Iterative)
                    .then(|| format!("aborted ({})", reason));
                self.resolve_phase(&phase_id, termination);
            }
        }
    }

    fn finalize(mut self, started_at: chrono::DateTime<Utc>) -> RunReport {
        // Defensive sweep: anything still non-terminal at this point is
        // recorded as skipped so the report always reflects a true terminal
        // state for every node.
        let leftover_reason = match self.draining {
            Some(RunOutcome::DeadlineExceeded) => SkipReason::DeadlineExceeded,
            _ => SkipReason::RunCancelled,
        };
        for node_id in self.state.unfinished_node_ids() {
            if let Some(result) = self.pending_results.remove(&node_id) {
                self.state.mark_succeeded(&node_id, result);
            } else {
                self.state.mark_skipped(&node_id, leftover_reason);
            }
        }

        let outcome = self.draining.unwrap_or(RunOutcome::Completed);
        self.emit(RunEvent::RunCompleted {
            run_id: self.run_id,
            outcome: outcome.to_string(),
        });
        debug!(run_id = %self.run_id, outcome = %outcome, "run finished");

        let Scheduler {
            run_id,
            workflow,
            graph,
            state,
            mut phase_runs,
            warnings,
            ..
        } = self;

        let nodes: Vec<NodeReport> = state.nodes().map(NodeReport::from_node).collect();
        let phases: Vec<PhaseReport> = graph
            .phases()
            .iter()
            .map(|phase| {
                let run = phase_runs.get_mut(&phase.phase_id);
                let (resolution, termination, iterations) = match run {
                    Some(run) => (
                        run.resolution.take(),
                        run.termination.take(),
                        run.tracker
                            .take()
                            .map(|t| t.into_history())
                            .unwrap_or_default(),
                    ),
                    None => (None, None, Vec::new()),
                };
                PhaseReport {
                    phase_id: phase.phase_id.clone(),
                    mode: phase.mode,
                    resolution,
                    iterations,
                    termination,
                }
            })
            .collect();

        RunReport {
            run_id,
            workflow,
            outcome,
            started_at,
            finished_at: Utc::now(),
            warnings,
            nodes,
            phases,
        }
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => futures::future::pending::<()>().await,
    }
}
