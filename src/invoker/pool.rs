//! Worker pool shared by the pooled invoker strategies.
//!
//! Spawns worker processes, bootstraps each one with the model handle and operation name,
//! and waits until all of them are ready. Work is sent one input at a time; the strategies
//! decide which worker gets which input.

use crate::config::LaunchConfig;
use crate::error::{Error, Result};
use crate::protocol::{Bootstrap, WorkRequest, WorkResponse};
use crate::sharing::SharedModel;
use crate::worker::proc::Proc;
use crate::worker::signals::WorkerFailure;
use crate::worker::{self, spawn::spawn_worker};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// How long to wait for a dead worker's exit status.
const DEATH_GRACE: Duration = Duration::from_secs(1);

/// A single worker in the pool.
#[derive(Debug)]
pub(crate) struct PoolWorker {
    /// Worker ID for logging.
    id: usize,
    /// Process ID reported in the worker's Ready message.
    pid: u32,
    proc: Mutex<Proc>,
    /// Number of inputs completed by this worker.
    completed: AtomicUsize,
}

impl PoolWorker {
    fn lock(&self) -> MutexGuard<'_, Proc> {
        self.proc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Worker index.
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Apply the bound operation to `args` in this worker.
    pub(crate) fn call<A, R>(&self, seq: u64, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let request_start = Instant::now();
        let mut proc = self.lock();

        if let Err(e) = proc.send(&WorkRequest::Invoke { seq, args }) {
            // A broken pipe usually means the worker is gone; report why if so.
            return Err(match proc.try_wait() {
                Ok(Some(_)) => self.died(&mut proc, seq),
                _ => e,
            });
        }

        let response = proc.recv::<WorkResponse<R>>()?;
        trace!(
            worker_id = self.id,
            seq,
            total_ipc_time_ms = request_start.elapsed().as_millis(),
            "Worker IPC request/response"
        );

        match response {
            Some(WorkResponse::Output { seq: got, value }) if got == seq => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Some(WorkResponse::Failed { seq: got, error }) if got == seq => {
                Err(Error::OperationFailed {
                    worker: self.id,
                    source: error,
                })
            }
            Some(other) => Err(Error::Worker(format!(
                "Worker {} sent unexpected {} response for input {}",
                self.id,
                response_name(&other),
                seq
            ))),
            None => Err(self.died(&mut proc, seq)),
        }
    }

    fn died(&self, proc: &mut Proc, seq: u64) -> Error {
        let reason = proc.termination_reason(DEATH_GRACE);
        tracing::warn!(worker_id = self.id, pid = self.pid, reason = %reason, seq, "Worker died unexpectedly");
        WorkerFailure::new(self.id, reason)
            .with_context(format!("processing input {}", seq))
            .into()
    }
}

fn response_name<R>(response: &WorkResponse<R>) -> &'static str {
    match response {
        WorkResponse::Ready { .. } => "ready",
        WorkResponse::InitFailed { .. } => "init_failed",
        WorkResponse::Output { .. } => "output",
        WorkResponse::Failed { .. } => "failed",
    }
}

/// A pool of bootstrapped worker processes bound to one operation and model.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    workers: Vec<Arc<PoolWorker>>,
    operation: &'static str,
    shutdown_timeout: Duration,
    /// Released after the workers stop.
    model: Option<SharedModel>,
}

impl WorkerPool {
    /// Spawn `jobs` workers and wait until every one of them is ready.
    pub(crate) fn start(
        operation: &'static str,
        model: SharedModel,
        jobs: usize,
        child_jobs: usize,
        launch: &LaunchConfig,
    ) -> Result<Self> {
        info!(
            workers = jobs,
            child_jobs,
            operation,
            codec = %launch.codec,
            "Initializing worker pool"
        );

        let boot = Bootstrap::pooled(
            operation,
            worker::current_level() + 1,
            launch.relay_logs,
            model.handle().clone(),
            child_jobs,
        );

        let mut procs = Vec::with_capacity(jobs);
        for id in 0..jobs {
            let proc = spawn_worker(id, launch, Some(child_jobs))?;
            proc.send(&boot).map_err(|e| {
                Error::Worker(format!("Worker {} failed to receive bootstrap: {}", id, e))
            })?;
            procs.push(proc);
        }

        // Wait for all workers to be ready
        let mut workers = Vec::with_capacity(jobs);
        for (id, mut proc) in procs.into_iter().enumerate() {
            let pid = match proc.recv::<WorkResponse<()>>()? {
                Some(WorkResponse::Ready { pid }) => pid,
                Some(WorkResponse::InitFailed { error }) => {
                    return Err(Error::Worker(format!(
                        "Worker {} failed to initialize: {}",
                        id, error
                    )));
                }
                Some(other) => {
                    return Err(Error::Worker(format!(
                        "Worker {} sent {} instead of ready",
                        id,
                        response_name(&other)
                    )));
                }
                None => {
                    let reason = proc.termination_reason(DEATH_GRACE);
                    return Err(WorkerFailure::new(id, reason)
                        .with_context("starting up")
                        .into());
                }
            };
            debug!(worker_id = id, pid, "Worker ready");
            workers.push(Arc::new(PoolWorker {
                id,
                pid,
                proc: Mutex::new(proc),
                completed: AtomicUsize::new(0),
            }));
        }

        info!(workers = jobs, "All workers ready");

        Ok(Self {
            workers,
            operation,
            shutdown_timeout: launch.shutdown_timeout,
            model: Some(model),
        })
    }

    /// Get the number of workers in the pool.
    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The pool's workers, if it is still running.
    pub(crate) fn workers(&self) -> Result<&[Arc<PoolWorker>]> {
        if self.model.is_none() {
            return Err(Error::Worker("invoker has been shut down".into()));
        }
        Ok(&self.workers)
    }

    /// Stop every worker and release the persisted model. Safe to call more than once.
    pub(crate) fn shutdown(&mut self) -> Result<()> {
        let Some(model) = self.model.take() else {
            return Ok(());
        };

        let mut first_error = None;
        let mut total_jobs = 0;
        for worker in &self.workers {
            total_jobs += worker.completed.load(Ordering::Relaxed);
            let mut proc = worker.lock();
            match proc.stop(self.shutdown_timeout) {
                Ok(reason) if !reason.is_success() => {
                    debug!(worker_id = worker.id, reason = %reason, "Worker exited abnormally");
                }
                Ok(_) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        drop(model);

        info!(
            operation = self.operation,
            workers = self.workers.len(),
            total_jobs_completed = total_jobs,
            "Worker pool shut down"
        );
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
