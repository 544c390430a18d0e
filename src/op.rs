//! Operations and the registry that lets a worker process find them.
//!
//! A worker is a fresh process, so it cannot receive a closure from its parent. Instead,
//! every operation is a type with a stable [`NAME`](ModelOp::NAME); the host binary registers
//! the types it supports in a [`Registry`] and passes it to
//! [`run_if_worker`](crate::run_if_worker). The parent sends only the name.
//!
//! ```no_run
//! use modelops::{ModelOp, OpError, Registry};
//!
//! struct Scale;
//!
//! impl ModelOp for Scale {
//!     const NAME: &'static str = "scale";
//!     type Model = f64;
//!     type Args = f64;
//!     type Output = f64;
//!
//!     fn apply(model: &f64, x: f64) -> Result<f64, OpError> {
//!         Ok(model * x)
//!     }
//! }
//!
//! fn main() {
//!     modelops::run_if_worker(&Registry::new().register_op::<Scale>());
//!     // ... normal program ...
//! }
//! ```

use crate::error::{Error, OpError, RemoteError, Result};
use crate::worker::worker_main::{self, Channels};
use crate::protocol::Bootstrap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// An operation applied to a shared model, once per input.
pub trait ModelOp: 'static {
    /// Name the operation is registered under.
    const NAME: &'static str;

    type Model: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Args: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn apply(model: &Self::Model, args: Self::Args) -> std::result::Result<Self::Output, OpError>;
}

/// A standalone function run in its own process by [`run_isolated`](crate::run_isolated).
pub trait Task: 'static {
    /// Name the task is registered under.
    const NAME: &'static str;

    type Args: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn run(args: Self::Args) -> std::result::Result<Self::Output, OpError>;
}

/// Worker entry point for one registered name.
pub(crate) type Entry = fn(&Bootstrap, &mut Channels) -> Result<()>;

/// Operations and tasks a worker executable can run.
///
/// Registering a second type under an existing name replaces the first.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    ops: BTreeMap<&'static str, Entry>,
    tasks: BTreeMap<&'static str, Entry>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model operation.
    pub fn register_op<Op: ModelOp>(mut self) -> Self {
        self.ops.insert(Op::NAME, worker_main::serve_pooled::<Op>);
        self
    }

    /// Register an isolated task.
    pub fn register_task<T: Task>(mut self) -> Self {
        self.tasks.insert(T::NAME, worker_main::run_task::<T>);
        self
    }

    /// Whether a model operation is registered under `name`.
    pub fn has_op(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    /// Whether a task is registered under `name`.
    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered operation names, sorted.
    pub fn op_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.ops.keys().copied()
    }

    /// Registered task names, sorted.
    pub fn task_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tasks.keys().copied()
    }

    pub(crate) fn op_entry(&self, name: &str) -> Result<Entry> {
        self.ops
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownOperation(name.to_string()))
    }

    pub(crate) fn task_entry(&self, name: &str) -> Result<Entry> {
        self.tasks
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownOperation(name.to_string()))
    }
}

/// Run operation code, turning a panic into a [`RemoteError`].
pub(crate) fn catch<R>(
    f: impl FnOnce() -> std::result::Result<R, OpError>,
) -> std::result::Result<R, RemoteError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| Err(RemoteError::from_panic(panic)))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Double;

    impl ModelOp for Double {
        const NAME: &'static str = "double";
        type Model = i64;
        type Args = i64;
        type Output = i64;

        fn apply(model: &i64, args: i64) -> std::result::Result<i64, OpError> {
            Ok(model * args * 2)
        }
    }

    struct Shout;

    impl Task for Shout {
        const NAME: &'static str = "shout";
        type Args = String;
        type Output = String;

        fn run(args: String) -> std::result::Result<String, OpError> {
            Ok(args.to_uppercase())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = Registry::new()
            .register_op::<Double>()
            .register_task::<Shout>();

        assert!(registry.has_op("double"));
        assert!(!registry.has_task("double"));
        assert!(registry.has_task("shout"));
        assert_eq!(registry.op_names().collect::<Vec<_>>(), vec!["double"]);
        assert_eq!(registry.task_names().collect::<Vec<_>>(), vec!["shout"]);

        assert!(registry.op_entry("double").is_ok());
        assert!(matches!(
            registry.op_entry("missing"),
            Err(Error::UnknownOperation(name)) if name == "missing"
        ));
        assert!(matches!(
            registry.task_entry("double"),
            Err(Error::UnknownOperation(_))
        ));
    }

    #[test]
    fn test_catch_passes_results_through() {
        assert_eq!(catch(|| Double::apply(&3, 4)), Ok(24));
        assert_eq!(catch(|| Shout::run("hi".into())), Ok("HI".to_string()));

        let err = catch::<()>(|| Err(RemoteError::new("Bad", "no"))).unwrap_err();
        assert_eq!(err.kind, "Bad");
    }

    #[test]
    fn test_catch_converts_panics() {
        let err = catch::<()>(|| panic!("exploded on item {}", 7)).unwrap_err();
        assert_eq!(err.kind, "panic");
        assert_eq!(err.message, "exploded on item 7");
    }
}
