//! Worker subprocesses.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │  Parent Process │
//!                     │    (Invoker)    │
//!                     └────────┬────────┘
//!          stdin: requests     │     stdout: results, stderr: logs
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 0  │  │ Worker 1  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         │   model   │  │   model   │  │   model   │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Each worker is a fresh run of the worker executable with `MODELOPS_WORKER` set. Its
//! `main` calls [`run_if_worker`], which reads a bootstrap frame, installs the
//! [`WorkerContext`], fetches the model once (pooled workers) and then serves requests until
//! its stdin closes.

pub mod context;
pub(crate) mod proc;
pub(crate) mod signals;
pub(crate) mod spawn;
pub(crate) mod worker_main;

pub use context::{
    WorkerContext, WorkerKind, context, current_level, is_pooled_worker, is_worker,
};
pub use signals::TerminationReason;

use crate::op::Registry;

/// Environment variable marking a worker process.
pub const WORKER_ENV: &str = "MODELOPS_WORKER";

/// Thread-count variables set on pooled workers, covering the common numeric runtimes.
pub const THREAD_ENV_VARS: [&str; 4] = [
    "RAYON_NUM_THREADS",
    "OMP_NUM_THREADS",
    "MKL_NUM_THREADS",
    "OPENBLAS_NUM_THREADS",
];

/// Become a worker if this process was started as one.
///
/// Call this first thing in `main` of any binary used as a worker executable. In a normal
/// process it returns immediately. In a worker it never returns: the process serves its
/// parent and exits with status 0 on success or 1 on a bootstrap or channel failure.
pub fn run_if_worker(registry: &Registry) {
    if std::env::var_os(WORKER_ENV).is_none() {
        return;
    }
    // Safety: still single-threaded at this point. Programs the worker itself launches must
    // not mistake themselves for workers.
    unsafe {
        std::env::remove_var(WORKER_ENV);
    }

    match worker_main::worker_main(registry) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "worker failed");
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}
