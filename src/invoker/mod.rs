//! Model operation invokers.
//!
//! An invoker binds a model to a [`ModelOp`] and applies the operation to many inputs,
//! returning results aligned with the inputs. [`get_invoker`] picks the strategy:
//!
//! - one job: [`InProcessInvoker`], no processes are spawned;
//! - otherwise [`PoolInvoker`] (the default executor), or [`LegacyPoolInvoker`] when the
//!   legacy pool primitive is selected.
//!
//! Pooled strategies persist a raw model once, start their workers, and tear everything down
//! on [`shutdown`](ModelOpInvoker::shutdown) or drop.
//!
//! ```no_run
//! use modelops::{ModelSource, ModelOpInvoker, get_invoker};
//! # use modelops::{ModelOp, OpError};
//! # struct Scale;
//! # impl ModelOp for Scale {
//! #     const NAME: &'static str = "scale";
//! #     type Model = f64;
//! #     type Args = f64;
//! #     type Output = f64;
//! #     fn apply(model: &f64, x: f64) -> Result<f64, OpError> { Ok(model * x) }
//! # }
//!
//! let mut invoker = get_invoker::<Scale>(ModelSource::Raw(2.0), Some(4), None)?;
//! let doubled = invoker.map(vec![1.0, 2.0, 3.0])?;
//! assert_eq!(doubled, vec![2.0, 4.0, 6.0]);
//! invoker.shutdown()?;
//! # Ok::<(), modelops::Error>(())
//! ```

mod in_process;
mod legacy;
mod pool;
mod pooled;

pub use in_process::InProcessInvoker;
pub use legacy::LegacyPoolInvoker;
pub use pooled::PoolInvoker;

use crate::config::{InvokerConfig, PoolPrimitive};
use crate::error::Result;
use crate::op::ModelOp;
use crate::sharing::{ModelSource, PersistMethod};
use crate::sizing::resolve_job_counts;
use std::fmt;
use std::sync::Once;
use tracing::{instrument, warn};

static LEGACY_NOTICE: Once = Once::new();

/// Results of a `map`, one per input, in input order.
pub struct MapResults<'a, T> {
    inner: Box<dyn Iterator<Item = Result<T>> + 'a>,
}

impl<'a, T> MapResults<'a, T> {
    pub(crate) fn new(inner: impl Iterator<Item = Result<T>> + 'a) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl<T> Iterator for MapResults<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T> fmt::Debug for MapResults<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapResults").finish_non_exhaustive()
    }
}

/// Applies a bound model operation to many inputs.
pub trait ModelOpInvoker<Op: ModelOp> {
    /// Apply the operation to every input, yielding results in input order.
    ///
    /// Depending on the strategy, results are computed lazily, streamed, or all computed
    /// before this returns. After the first failure no further results are produced.
    fn map_iter(&mut self, inputs: Vec<Op::Args>) -> Result<MapResults<'_, Op::Output>>;

    /// Apply the operation to every input and collect the results, failing on the first error.
    fn map(&mut self, inputs: Vec<Op::Args>) -> Result<Vec<Op::Output>> {
        self.map_iter(inputs)?.collect()
    }

    /// Apply the operation to two input sequences zipped together.
    ///
    /// Stops at the end of the shorter sequence.
    fn map_zip<A, B>(
        &mut self,
        first: impl IntoIterator<Item = A>,
        second: impl IntoIterator<Item = B>,
    ) -> Result<Vec<Op::Output>>
    where
        Op::Args: From<(A, B)>,
    {
        let inputs = first
            .into_iter()
            .zip(second)
            .map(<Op::Args as From<(A, B)>>::from)
            .collect();
        self.map(inputs)
    }

    /// Release workers and the model. Calling it again does nothing.
    fn shutdown(&mut self) -> Result<()>;
}

/// Which strategy an [`Invoker`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    InProcess,
    Executor,
    Legacy,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProcess => write!(f, "in-process"),
            Self::Executor => write!(f, "executor"),
            Self::Legacy => write!(f, "legacy"),
        }
    }
}

/// An invoker built by [`get_invoker`].
pub enum Invoker<Op: ModelOp> {
    InProcess(InProcessInvoker<Op>),
    Pooled(PoolInvoker<Op>),
    Legacy(LegacyPoolInvoker<Op>),
}

impl<Op: ModelOp> Invoker<Op> {
    /// The strategy behind this invoker.
    pub fn strategy(&self) -> Strategy {
        match self {
            Self::InProcess(_) => Strategy::InProcess,
            Self::Pooled(_) => Strategy::Executor,
            Self::Legacy(_) => Strategy::Legacy,
        }
    }

    /// Number of worker processes (0 for in-process).
    pub fn worker_count(&self) -> usize {
        match self {
            Self::InProcess(_) => 0,
            Self::Pooled(inv) => inv.worker_count(),
            Self::Legacy(inv) => inv.worker_count(),
        }
    }
}

impl<Op: ModelOp> fmt::Debug for Invoker<Op> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProcess(inv) => f.debug_tuple("InProcess").field(inv).finish(),
            Self::Pooled(inv) => f.debug_tuple("Pooled").field(inv).finish(),
            Self::Legacy(inv) => f.debug_tuple("Legacy").field(inv).finish(),
        }
    }
}

impl<Op: ModelOp> ModelOpInvoker<Op> for Invoker<Op> {
    fn map_iter(&mut self, inputs: Vec<Op::Args>) -> Result<MapResults<'_, Op::Output>> {
        match self {
            Self::InProcess(inv) => inv.map_iter(inputs),
            Self::Pooled(inv) => inv.map_iter(inputs),
            Self::Legacy(inv) => inv.map_iter(inputs),
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        match self {
            Self::InProcess(inv) => inv.shutdown(),
            Self::Pooled(inv) => inv.shutdown(),
            Self::Legacy(inv) => inv.shutdown(),
        }
    }
}

/// Build an invoker for `Op` over `model`.
///
/// `job_count` defaults to the sizing policy (at most 4 at the top level); `persist_method`
/// defaults to [`PersistMethod::File`]. The pool primitive, codec and worker executable come
/// from the environment (see [`InvokerConfig::with_env_overrides`]).
pub fn get_invoker<Op: ModelOp>(
    model: ModelSource<Op::Model>,
    job_count: Option<usize>,
    persist_method: Option<PersistMethod>,
) -> Result<Invoker<Op>> {
    let config = InvokerConfig {
        job_count,
        persist_method,
        ..InvokerConfig::default()
    }
    .with_env_overrides()?;
    get_invoker_with(model, &config)
}

/// Build an invoker for `Op` over `model` with explicit configuration.
#[instrument(level = "debug", skip_all, fields(operation = Op::NAME))]
pub fn get_invoker_with<Op: ModelOp>(
    model: ModelSource<Op::Model>,
    config: &InvokerConfig,
) -> Result<Invoker<Op>> {
    let (jobs, child_jobs) = resolve_job_counts(config.job_count)?;
    if jobs == 1 {
        return Ok(Invoker::InProcess(InProcessInvoker::new(model)?));
    }

    let shared = model.share(config.persist_method.unwrap_or_default())?;
    match config.pool {
        PoolPrimitive::Executor => Ok(Invoker::Pooled(PoolInvoker::start(
            shared,
            jobs,
            child_jobs,
            &config.launch,
        )?)),
        PoolPrimitive::Legacy => {
            LEGACY_NOTICE.call_once(|| {
                warn!("using the legacy worker pool; results are returned only after every input completes");
            });
            Ok(Invoker::Legacy(LegacyPoolInvoker::start(
                shared,
                jobs,
                child_jobs,
                &config.launch,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, OpError};

    struct Square;

    impl ModelOp for Square {
        const NAME: &'static str = "square";
        type Model = ();
        type Args = i32;
        type Output = i32;

        fn apply(_: &(), x: i32) -> std::result::Result<i32, OpError> {
            Ok(x * x)
        }
    }

    struct Mul;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Pair(i32, i32);

    impl From<(i32, i32)> for Pair {
        fn from((a, b): (i32, i32)) -> Self {
            Pair(a, b)
        }
    }

    impl ModelOp for Mul {
        const NAME: &'static str = "mul";
        type Model = ();
        type Args = Pair;
        type Output = i32;

        fn apply(_: &(), Pair(a, b): Pair) -> std::result::Result<i32, OpError> {
            Ok(a * b)
        }
    }

    #[test]
    fn test_single_job_is_in_process() {
        let config = InvokerConfig::new().with_job_count(1);
        let mut invoker = get_invoker_with::<Square>(ModelSource::Raw(()), &config).unwrap();
        assert_eq!(invoker.strategy(), Strategy::InProcess);
        assert_eq!(invoker.worker_count(), 0);
        assert_eq!(invoker.map(vec![1, 2, 3]).unwrap(), vec![1, 4, 9]);
        assert!(!crate::is_worker());
    }

    #[test]
    fn test_map_zip_uses_shorter_sequence() {
        let config = InvokerConfig::new().with_job_count(1);
        let mut invoker = get_invoker_with::<Mul>(ModelSource::Raw(()), &config).unwrap();
        let out = invoker.map_zip(vec![1, 2, 3], vec![10, 20]).unwrap();
        assert_eq!(out, vec![10, 40]);
    }

    #[test]
    fn test_zero_jobs_rejected() {
        let config = InvokerConfig::new().with_job_count(0);
        let result = get_invoker_with::<Square>(ModelSource::Raw(()), &config);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_map_results_size_hint() {
        let results: MapResults<'_, i32> = MapResults::new(vec![Ok(1), Ok(2)].into_iter());
        assert_eq!(results.size_hint(), (2, Some(2)));
        assert_eq!(results.collect::<Result<Vec<_>>>().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_strategy_display() {
        assert_eq!(Strategy::InProcess.to_string(), "in-process");
        assert_eq!(Strategy::Executor.to_string(), "executor");
        assert_eq!(Strategy::Legacy.to_string(), "legacy");
    }
}
