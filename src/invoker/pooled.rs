//! Pooled-executor strategy.
//!
//! Every input goes onto one shared job queue. Each worker has a dispatcher thread that takes
//! the next input whenever its worker is idle, so fast workers pick up more of the load.
//! Results stream back as they complete and are handed to the caller in input order.

use super::pool::{PoolWorker, WorkerPool};
use super::{MapResults, ModelOpInvoker};
use crate::config::LaunchConfig;
use crate::error::{Error, Result};
use crate::op::ModelOp;
use crate::sharing::SharedModel;
use crossbeam_channel::{Receiver, Sender};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, instrument};

/// Invoker backed by a worker pool with dynamic dispatch.
pub struct PoolInvoker<Op: ModelOp> {
    pool: WorkerPool,
    _op: PhantomData<fn() -> Op>,
}

impl<Op: ModelOp> PoolInvoker<Op> {
    pub(crate) fn start(
        model: SharedModel,
        jobs: usize,
        child_jobs: usize,
        launch: &LaunchConfig,
    ) -> Result<Self> {
        Ok(Self {
            pool: WorkerPool::start(Op::NAME, model, jobs, child_jobs, launch)?,
            _op: PhantomData,
        })
    }

    /// Number of worker processes.
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }
}

impl<Op: ModelOp> fmt::Debug for PoolInvoker<Op> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolInvoker")
            .field("operation", &Op::NAME)
            .field("pool", &self.pool)
            .finish()
    }
}

impl<Op: ModelOp> ModelOpInvoker<Op> for PoolInvoker<Op> {
    #[instrument(level = "debug", skip_all, fields(operation = Op::NAME, inputs = inputs.len()))]
    fn map_iter(&mut self, inputs: Vec<Op::Args>) -> Result<MapResults<'_, Op::Output>> {
        let workers = self.pool.workers()?;
        let total = inputs.len();

        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        for job in inputs.into_iter().enumerate() {
            // The receiver is alive in this scope, so sending cannot fail.
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let abort = Arc::new(AtomicBool::new(false));
        let dispatchers = workers
            .iter()
            .map(|worker| {
                spawn_dispatcher::<Op>(
                    Arc::clone(worker),
                    job_rx.clone(),
                    result_tx.clone(),
                    Arc::clone(&abort),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        drop(result_tx);

        Ok(MapResults::new(ResultStream {
            results: result_rx,
            pending: BTreeMap::new(),
            next: 0,
            total,
            abort,
            dispatchers,
            finished: total == 0,
        }))
    }

    fn shutdown(&mut self) -> Result<()> {
        self.pool.shutdown()
    }
}

fn spawn_dispatcher<Op: ModelOp>(
    worker: Arc<PoolWorker>,
    jobs: Receiver<(usize, Op::Args)>,
    results: Sender<(usize, Result<Op::Output>)>,
    abort: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("modelops-dispatch-{}", worker.id()))
        .spawn(move || {
            while !abort.load(Ordering::Acquire) {
                let Ok((idx, args)) = jobs.recv() else { break };
                let result = worker.call::<Op::Args, Op::Output>(idx as u64, args);
                let failed = result.is_err();
                if results.send((idx, result)).is_err() || failed {
                    break;
                }
            }
        })?;
    Ok(handle)
}

/// Results of one pooled `map`, reordered into input order.
struct ResultStream<T> {
    results: Receiver<(usize, Result<T>)>,
    /// Completed results waiting for earlier inputs.
    pending: BTreeMap<usize, Result<T>>,
    next: usize,
    total: usize,
    abort: Arc<AtomicBool>,
    dispatchers: Vec<JoinHandle<()>>,
    finished: bool,
}

impl<T> ResultStream<T> {
    fn fail(&mut self, err: Error) -> Option<Result<T>> {
        self.abort.store(true, Ordering::Release);
        self.finished = true;
        Some(Err(err))
    }
}

impl<T> Iterator for ResultStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            if let Some(result) = self.pending.remove(&self.next) {
                self.next += 1;
                if self.next == self.total {
                    self.finished = true;
                }
                return Some(result);
            }
            match self.results.recv() {
                // The first failure ends the map, whatever its position.
                Ok((idx, Err(e))) => {
                    debug!(input = idx, error = %e, "aborting map after failure");
                    return self.fail(e);
                }
                Ok((idx, Ok(value))) => {
                    self.pending.insert(idx, Ok(value));
                }
                Err(_) => {
                    return self.fail(Error::Worker(format!(
                        "dispatchers stopped with {} of {} results delivered",
                        self.next, self.total
                    )));
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            (0, Some(0))
        } else {
            (0, Some(self.total - self.next))
        }
    }
}

impl<T> Drop for ResultStream<T> {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::Release);
        for handle in self.dispatchers.drain(..) {
            let _ = handle.join();
        }
    }
}
