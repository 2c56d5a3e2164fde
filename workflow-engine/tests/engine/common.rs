//! Common executors and helpers for engine integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use workflow_engine::scheduler::{RetryPolicy, RunOptions};
use workflow_engine::sdk::{
    async_trait, ExecutionError, ExecutorRegistry, PhaseContext, Severity, TaskExecutor,
    TaskResult,
};

/// Succeeds immediately with fixed claims, severity, and category.
pub struct StaticExecutor {
    pub severity: Severity,
    pub claims: Vec<String>,
    pub category: String,
    pub delay: Duration,
}

impl StaticExecutor {
    pub fn ok() -> Self {
        Self {
            severity: Severity::Informational,
            claims: Vec::new(),
            category: "general".to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_claims(severity: Severity, category: &str, claims: &[&str]) -> Self {
        Self {
            severity,
            claims: claims.iter().map(|c| c.to_string()).collect(),
            category: category.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::ok()
        }
    }
}

#[async_trait]
impl TaskExecutor for StaticExecutor {
    async fn execute(&self, ctx: PhaseContext) -> Result<TaskResult, ExecutionError> {
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.cancel.cancelled() => return Err(ExecutionError::Cancelled),
            }
        }
        let mut result = TaskResult::new(self.severity);
        for claim in &self.claims {
            result = result.with_claim(claim.clone());
        }
        Ok(result)
    }

    fn category(&self) -> &str {
        &self.category
    }
}

/// Always fails, either fatally or transiently, counting invocations.
pub struct FailingExecutor {
    pub fatal: bool,
    pub message: String,
    pub calls: Arc<AtomicU32>,
}

impl FailingExecutor {
    pub fn fatal(message: &str) -> Self {
        Self {
            fatal: true,
            message: message.to_string(),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn transient(message: &str) -> Self {
        Self {
            fatal: false,
            message: message.to_string(),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl TaskExecutor for FailingExecutor {
    async fn execute(&self, _ctx: PhaseContext) -> Result<TaskResult, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            Err(ExecutionError::Fatal(self.message.clone()))
        } else {
            Err(ExecutionError::Transient(self.message.clone()))
        }
    }
}

/// Fails transiently `failures_before_success` times, then succeeds.
pub struct FlakyExecutor {
    pub failures_before_success: u32,
    pub calls: Arc<AtomicU32>,
}

impl FlakyExecutor {
    pub fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl TaskExecutor for FlakyExecutor {
    async fn execute(&self, _ctx: PhaseContext) -> Result<TaskResult, ExecutionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures_before_success {
            Err(ExecutionError::Transient(format!(
                "flaky failure on call {}",
                call
            )))
        } else {
            Ok(TaskResult::new(Severity::Informational))
        }
    }
}

/// Tracks the peak number of concurrently running invocations.
pub struct ConcurrencyProbe {
    pub current: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
    pub hold: Duration,
}

impl ConcurrencyProbe {
    pub fn new(hold: Duration) -> Self {
        Self {
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            hold,
        }
    }
}

#[async_trait]
impl TaskExecutor for ConcurrencyProbe {
    async fn execute(&self, _ctx: PhaseContext) -> Result<TaskResult, ExecutionError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(TaskResult::new(Severity::Informational))
    }
}

/// Records the contexts it was invoked with.
#[derive(Default)]
pub struct RecordingExecutor {
    pub contexts: Arc<Mutex<Vec<PhaseContext>>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn execute(&self, ctx: PhaseContext) -> Result<TaskResult, ExecutionError> {
        self.contexts.lock().unwrap().push(ctx);
        Ok(TaskResult::new(Severity::Informational))
    }
}

/// Returns blocking severity until the given iteration, then advisory.
pub struct SettlingExecutor {
    pub settles_at_iteration: u32,
}

#[async_trait]
impl TaskExecutor for SettlingExecutor {
    async fn execute(&self, ctx: PhaseContext) -> Result<TaskResult, ExecutionError> {
        let iteration = ctx.iteration.unwrap_or(1);
        let severity = if iteration >= self.settles_at_iteration {
            Severity::Advisory
        } else {
            Severity::Blocking
        };
        Ok(TaskResult::new(severity))
    }
}

/// Build a registry from (agent id, executor) pairs.
pub fn registry(pairs: Vec<(&str, Arc<dyn TaskExecutor>)>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    for (agent_id, executor) in pairs {
        registry.register(agent_id, executor);
    }
    registry
}

/// Run options with millisecond-scale retry backoff so tests stay fast.
pub fn fast_opts() -> RunOptions {
    RunOptions {
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            factor: 2,
            max_delay: Duration::from_millis(8),
        },
        node_timeout: Duration::from_secs(5),
        ..RunOptions::default()
    }
}
