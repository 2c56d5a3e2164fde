//! Top-level run API.
//!
//! [`WorkflowRunner`] owns an executor registry and an event channel and
//! drives one workflow definition to a [`RunReport`] per call. There is no
//! process-wide current-workflow state: every run gets its own isolated
//! [`crate::state::RunState`], so independent runs may execute concurrently
//! on the same runner.

use std::sync::Arc;
use tokio::sync::broadcast;
use workflow_engine_sdk::{ExecutorRegistry, RunEvent, RunEventReceiver};

use crate::definition::WorkflowDefinition;
use crate::error::Result;
use crate::graph::TaskGraph;
use crate::report::RunReport;
use crate::scheduler::{RunOptions, Scheduler};

/// Capacity of the event broadcast channel. Sized generously so slow
/// subscribers do not lag on bursty phases.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct WorkflowRunner {
    registry: Arc<ExecutorRegistry>,
    events: broadcast::Sender<RunEvent>,
}

impl WorkflowRunner {
    pub fn new(registry: ExecutorRegistry) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry: Arc::new(registry),
            events,
        }
    }

    /// Subscribe to structured progress events for every run driven by
    /// this runner.
    pub fn subscribe(&self) -> RunEventReceiver {
        self.events.subscribe()
    }

    /// Execute one workflow to completion (or terminal failure) and return
    /// its report.
    ///
    /// Build-time errors (cyclic dependencies, validation failures,
    /// unregistered agents) return `Err` before any node executes.
    /// Execution outcomes, including cancellation and deadline expiry,
    /// return `Ok` with a report reflecting the true terminal state of
    /// every node.
    pub async fn run(&self, def: &WorkflowDefinition, opts: RunOptions) -> Result<RunReport> {
        let graph = TaskGraph::build(def)?;
        let (scheduler, rx) =
            Scheduler::new(graph, def, self.registry.clone(), opts, self.events.clone())?;
        Ok(scheduler.run(rx).await)
    }
}

/// One-shot convenience over [`WorkflowRunner`].
pub async fn run_workflow(
    def: &WorkflowDefinition,
    registry: ExecutorRegistry,
    opts: RunOptions,
) -> Result<RunReport> {
    WorkflowRunner::new(registry).run(def, opts).await
}
