//! modelops - run model operations in-process, in a pool of worker processes, or in an
//! isolated subprocess.
//!
//! The pieces:
//!
//! - [`get_invoker`] binds a model to a [`ModelOp`] and picks a strategy from the job count:
//!   in-process for one job, a pool of worker processes otherwise.
//! - [`run_isolated`] runs one [`Task`] in a fresh subprocess and returns its result.
//! - [`fast_queue`] is a pipe-backed queue with a codec that moves [`NumericBuffer`]s
//!   out of band.
//! - [`desired_workers`] and [`resolve_job_counts`] size pools from the CPU count and the
//!   `MODELOPS_NUM_PROCS` variable, per nesting level.
//!
//! Worker processes are re-executions of a binary that calls [`run_if_worker`] with a
//! [`Registry`] of its operations before doing anything else.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod demo;
pub mod error;
pub mod invoker;
pub mod ipc;
pub mod isolate;
pub mod logging;
pub mod op;
pub mod protocol;
pub mod queue;
pub mod sharing;
pub mod sizing;
pub mod worker;

pub use buffer::NumericBuffer;
pub use codec::{BufferCodec, Codec, CodecKind, JsonCodec};
pub use config::{InvokerConfig, LaunchConfig, PoolPrimitive};
pub use error::{Error, OpError, RemoteError, Result};
pub use invoker::{
    InProcessInvoker, Invoker, LegacyPoolInvoker, MapResults, ModelOpInvoker, PoolInvoker,
    Strategy, get_invoker, get_invoker_with,
};
pub use isolate::{run_isolated, run_isolated_with};
pub use op::{ModelOp, Registry, Task};
pub use queue::{FastReceiver, FastSender, fast_queue, fast_queue_with};
pub use sharing::{ModelHandle, ModelSource, PersistMethod, PersistedModel, fetch_count, persist};
pub use sizing::{desired_workers, resolve_job_counts};
pub use worker::{is_pooled_worker, is_worker, run_if_worker};
