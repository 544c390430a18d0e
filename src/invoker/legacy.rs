//! Legacy-pool strategy.
//!
//! A blocking star-map: inputs are assigned to workers round-robin up front (`i % workers`)
//! and `map_iter` returns only after every assigned input has been processed.

use super::pool::WorkerPool;
use super::{MapResults, ModelOpInvoker};
use crate::config::LaunchConfig;
use crate::error::{Error, Result};
use crate::op::ModelOp;
use crate::sharing::SharedModel;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{instrument, trace};

/// Invoker backed by a worker pool with static assignment.
pub struct LegacyPoolInvoker<Op: ModelOp> {
    pool: WorkerPool,
    _op: PhantomData<fn() -> Op>,
}

impl<Op: ModelOp> LegacyPoolInvoker<Op> {
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

impl<Op: ModelOp> fmt::Debug for LegacyPoolInvoker<Op> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyPoolInvoker")
            .field("operation", &Op::NAME)
            .field("pool", &self.pool)
            .finish()
    }
}

impl<Op: ModelOp> ModelOpInvoker<Op> for LegacyPoolInvoker<Op> {
    #[instrument(level = "debug", skip_all, fields(operation = Op::NAME, inputs = inputs.len()))]
    fn map_iter(&mut self, inputs: Vec<Op::Args>) -> Result<MapResults<'_, Op::Output>> {
        let workers = self.pool.workers()?;
        let parallel_start = Instant::now();
        let total = inputs.len();
        let n = workers.len();

        let mut buckets: Vec<Vec<(usize, Op::Args)>> = (0..n).map(|_| Vec::new()).collect();
        for (i, args) in inputs.into_iter().enumerate() {
            buckets[i % n].push((i, args));
        }

        let abort = AtomicBool::new(false);
        let mut slots: Vec<Option<Result<Op::Output>>> = (0..total).map(|_| None).collect();

        thread::scope(|s| {
            let handles: Vec<_> = buckets
                .into_iter()
                .zip(workers)
                .map(|(bucket, worker)| {
                    let abort = &abort;
                    s.spawn(move || {
                        let mut done = Vec::with_capacity(bucket.len());
                        for (i, args) in bucket {
                            if abort.load(Ordering::Acquire) {
                                break;
                            }
                            let result = worker.call::<Op::Args, Op::Output>(i as u64, args);
                            if result.is_err() {
                                abort.store(true, Ordering::Release);
                            }
                            done.push((i, result));
                        }
                        done
                    })
                })
                .collect();

            for handle in handles {
                match handle.join() {
                    Ok(done) => {
                        for (i, result) in done {
                            slots[i] = Some(result);
                        }
                    }
                    Err(_) => abort.store(true, Ordering::Release),
                }
            }
        });

        let success_count = slots.iter().filter(|s| matches!(s, Some(Ok(_)))).count();
        trace!(
            inputs = total,
            success_count,
            parallel_time_ms = parallel_start.elapsed().as_millis(),
            "Legacy star-map completed"
        );

        Ok(MapResults::new(ordered(slots).into_iter()))
    }

    fn shutdown(&mut self) -> Result<()> {
        self.pool.shutdown()
    }
}

/// Results in input order, ending at the first failure or unprocessed input.
fn ordered<T>(mut slots: Vec<Option<Result<T>>>) -> Vec<Result<T>> {
    let first_error = slots.iter().position(|s| matches!(s, Some(Err(_))));
    let mut out = Vec::with_capacity(slots.len());
    for i in 0..slots.len() {
        match slots[i].take() {
            Some(Ok(value)) => out.push(Ok(value)),
            Some(Err(e)) => {
                out.push(Err(e));
                break;
            }
            None => {
                let err = first_error
                    .and_then(|j| slots[j].take())
                    .and_then(|r| r.err())
                    .unwrap_or_else(|| {
                        Error::Worker(format!("input {} was not processed by the pool", i))
                    });
                out.push(Err(err));
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;

    fn failed(worker: usize) -> Error {
        Error::OperationFailed {
            worker,
            source: RemoteError::new("Bad", "bad input"),
        }
    }

    #[test]
    fn test_ordered_all_success() {
        let slots = vec![Some(Ok(1)), Some(Ok(2)), Some(Ok(3))];
        let out: Vec<i32> = ordered(slots).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn test_ordered_stops_at_first_error() {
        let slots = vec![Some(Ok(1)), Some(Err(failed(1))), Some(Ok(3))];
        let out = ordered(slots);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Err(Error::OperationFailed { worker: 1, .. })));
    }

    #[test]
    fn test_ordered_reports_cause_for_skipped_input() {
        // Input 1 was skipped because input 2 failed on another worker.
        let slots = vec![Some(Ok(1)), None, Some(Err(failed(0)))];
        let out = ordered(slots);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Err(Error::OperationFailed { worker: 0, .. })));
    }

    #[test]
    fn test_ordered_skipped_without_cause() {
        let slots: Vec<Option<Result<i32>>> = vec![None];
        let out = ordered(slots);
        assert!(matches!(out[0], Err(Error::Worker(_))));
    }
}
