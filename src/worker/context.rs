//! Process-wide worker state.
//!
//! A worker process installs its [`WorkerContext`] exactly once, while bootstrapping. Every
//! other process never installs one, which is how [`is_worker`] tells them apart.

use crate::error::{Error, Result};
use crate::protocol::Bootstrap;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

static CONTEXT: OnceLock<WorkerContext> = OnceLock::new();

/// Set once a pooled worker has fetched its model and sized its thread pools.
static MODEL_BOUND: AtomicBool = AtomicBool::new(false);

/// What a worker process was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// One-shot task run by [`run_isolated`](crate::run_isolated).
    Isolated,
    /// Long-lived member of an invoker's pool.
    Pooled,
}

/// Facts about the current worker process, fixed at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    pub kind: WorkerKind,
    /// Nesting level; 1 for workers started by a top-level process.
    pub level: usize,
    /// Numeric thread budget (pooled workers only).
    pub child_jobs: Option<usize>,
    /// Registered name of the bound operation or task.
    pub operation: String,
    pub pid: u32,
    /// Whether logs are relayed through the parent.
    pub relay_logs: bool,
}

impl WorkerContext {
    /// Context described by a bootstrap message.
    pub fn from_bootstrap(boot: &Bootstrap) -> Self {
        Self {
            kind: boot.kind(),
            level: boot.level,
            child_jobs: boot.binding.as_ref().map(|b| b.child_jobs),
            operation: boot.operation.clone(),
            pid: std::process::id(),
            relay_logs: boot.relay_logs,
        }
    }
}

/// Install the context for this process. Fails if one is already installed.
pub(crate) fn install(context: WorkerContext) -> Result<&'static WorkerContext> {
    let mut installed = false;
    let stored = CONTEXT.get_or_init(|| {
        installed = true;
        context
    });
    if installed {
        Ok(stored)
    } else {
        Err(Error::Worker(
            "worker context is already installed in this process".into(),
        ))
    }
}

/// The current worker's context, if this process is a worker.
pub fn context() -> Option<&'static WorkerContext> {
    CONTEXT.get()
}

/// Whether this process is a worker of any kind.
pub fn is_worker() -> bool {
    CONTEXT.get().is_some()
}

/// Record that this pooled worker's model is loaded and bound to its operation.
pub(crate) fn mark_model_bound() {
    MODEL_BOUND.store(true, Ordering::Release);
}

/// Whether this process is a pooled worker with a bound model.
///
/// False while a pooled worker is still fetching its model.
pub fn is_pooled_worker() -> bool {
    pooled_with_model(CONTEXT.get(), MODEL_BOUND.load(Ordering::Acquire))
}

fn pooled_with_model(context: Option<&WorkerContext>, bound: bool) -> bool {
    bound && context.is_some_and(|c| c.kind == WorkerKind::Pooled)
}

/// Nesting level of this process (0 outside workers).
pub fn current_level() -> usize {
    CONTEXT.get().map_or(0, |c| c.level)
}
