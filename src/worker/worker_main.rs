//! Worker subprocess main entry point.
//!
//! Runs when the host binary calls [`run_if_worker`](super::run_if_worker) in a process
//! started by [`spawn_worker`](super::spawn::spawn_worker). Requests arrive on stdin, results
//! leave on the original stdout, and stderr carries logs.

use super::context::{self, WorkerContext, WorkerKind};
use crate::codec::CodecKind;
use crate::config::CODEC_ENV;
use crate::error::{Error, RemoteError, Result};
use crate::ipc::PipeFd;
use crate::logging::{self, LogConfig};
use crate::op::{self, ModelOp, Registry, Task};
use crate::protocol::{Bootstrap, ResultSlot, WorkRequest, WorkResponse};
use crate::queue::{FastReceiver, FastSender};
use std::io;
use std::os::unix::io::RawFd;
use tracing::{debug, info, trace};

/// A worker's two queues.
#[derive(Debug)]
pub(crate) struct Channels {
    pub requests: FastReceiver<CodecKind>,
    pub results: FastSender<CodecKind>,
}

/// Move the real stdout to a private descriptor and point fd 1 at stderr.
///
/// Anything the operation prints then lands in the log stream instead of corrupting result
/// frames.
fn detach_stdout() -> io::Result<RawFd> {
    // Safety: plain descriptor syscalls on fds 1 and 2, which are open in every worker.
    let private = unsafe { libc::fcntl(libc::STDOUT_FILENO, libc::F_DUPFD_CLOEXEC, 3) };
    if private < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(private)
}

/// Size the numeric thread pool for this worker.
fn configure_threads(child_jobs: usize) {
    match rayon::ThreadPoolBuilder::new()
        .num_threads(child_jobs)
        .build_global()
    {
        Ok(()) => debug!(threads = child_jobs, "configured worker thread pool"),
        Err(e) => debug!(error = %e, "worker thread pool already initialized"),
    }
}

/// Serve loop for a pooled worker bound to `Op`.
pub(crate) fn serve_pooled<Op: ModelOp>(boot: &Bootstrap, chan: &mut Channels) -> Result<()> {
    let binding = boot
        .binding
        .as_ref()
        .ok_or_else(|| Error::Worker("pooled bootstrap without a model binding".into()))?;

    let model: Op::Model = match binding.model.get() {
        Ok(model) => model,
        Err(e) => {
            let error = RemoteError::from(e);
            chan.results
                .put(&WorkResponse::<Op::Output>::InitFailed { error: error.clone() })?;
            return Err(Error::RemoteExecution(error));
        }
    };
    debug!(operation = Op::NAME, method = %binding.model.method(), "model loaded");

    configure_threads(binding.child_jobs);
    context::mark_model_bound();

    chan.results.put(&WorkResponse::<Op::Output>::Ready {
        pid: std::process::id(),
    })?;

    let mut served = 0u64;
    loop {
        match chan.requests.get::<WorkRequest<Op::Args>>()? {
            None | Some(WorkRequest::Exit) => break,
            Some(WorkRequest::Invoke { seq, args }) => {
                trace!(seq, "invoking operation");
                let response = match op::catch(|| Op::apply(&model, args)) {
                    Ok(value) => WorkResponse::Output { seq, value },
                    Err(error) => {
                        debug!(seq, error = %error, "operation failed");
                        WorkResponse::Failed { seq, error }
                    }
                };
                chan.results.put(&response)?;
                served += 1;
            }
        }
    }

    debug!(operation = Op::NAME, served, "worker finished");
    Ok(())
}

/// Run an isolated task once and report its result slot.
pub(crate) fn run_task<T: Task>(_boot: &Bootstrap, chan: &mut Channels) -> Result<()> {
    let args: T::Args = chan
        .requests
        .get()?
        .ok_or_else(|| Error::Worker("parent closed stdin before sending task arguments".into()))?;

    let slot: ResultSlot<T::Output> = op::catch(|| T::run(args)).into();
    if let ResultSlot::Failure(error) = &slot {
        debug!(task = T::NAME, error = %error, "task failed");
    }
    chan.results.put(&slot)?;
    Ok(())
}

/// Bootstrap this process as a worker and run until its work is done.
pub(crate) fn worker_main(registry: &Registry) -> Result<()> {
    // Ignore SIGPIPE - we handle pipe errors via io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let codec: CodecKind = match std::env::var(CODEC_ENV) {
        Ok(value) => value.parse().map_err(Error::Config)?,
        Err(_) => CodecKind::default(),
    };

    let results_fd = detach_stdout()?;
    // Safety: fd 0 is the request pipe from the parent; `results_fd` was just duplicated.
    let mut chan = Channels {
        requests: FastReceiver::new(unsafe { PipeFd::from_raw(libc::STDIN_FILENO) }, codec),
        results: FastSender::new(unsafe { PipeFd::from_raw(results_fd) }, codec),
    };

    let boot: Bootstrap = chan
        .requests
        .get()?
        .ok_or_else(|| Error::Worker("parent closed stdin before bootstrap".into()))?;

    if boot.relay_logs {
        logging::init_worker_relay();
    } else {
        logging::init(LogConfig::default().with_env_overrides());
    }

    let ctx: &WorkerContext = context::install(WorkerContext::from_bootstrap(&boot))?;
    info!(
        operation = %ctx.operation,
        kind = ?ctx.kind,
        level = ctx.level,
        child_jobs = ?ctx.child_jobs,
        codec = %codec,
        "worker started"
    );

    match ctx.kind {
        WorkerKind::Pooled => match registry.op_entry(&boot.operation) {
            Ok(entry) => entry(&boot, &mut chan),
            Err(e) => {
                let error = RemoteError::from(e);
                chan.results
                    .put(&WorkResponse::<()>::InitFailed { error: error.clone() })?;
                Err(Error::RemoteExecution(error))
            }
        },
        WorkerKind::Isolated => match registry.task_entry(&boot.operation) {
            Ok(entry) => entry(&boot, &mut chan),
            // Reported through the slot, so the parent sees a remote failure naming the task.
            Err(e) => chan.results.put(&ResultSlot::<()>::Failure(e.into())),
        },
    }
}
