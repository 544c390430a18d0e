//! Run a single task in a fresh process.
//!
//! The task's process exits as soon as the task returns, so anything it allocates or leaks
//! is reclaimed by the OS, and a crash cannot take the caller down with it.

use crate::config::LaunchConfig;
use crate::error::{Error, Result};
use crate::op::Task;
use crate::protocol::{Bootstrap, ResultSlot};
use crate::worker::{self, spawn::spawn_worker};
use tracing::{debug, instrument};

/// Run `T` with `args` in a new worker process and return its output.
///
/// Launch settings come from [`LaunchConfig::default`] plus environment overrides.
///
/// # Errors
///
/// - [`Error::ProcessFailure`] if the process exits non-zero or is killed (signals are
///   reported as the negated signal number). This wins over any result the task sent.
/// - [`Error::RemoteExecution`] if the task returned an error or panicked.
/// - [`Error::Worker`] if the process could not be started or exited without a result.
pub fn run_isolated<T: Task>(args: T::Args) -> Result<T::Output> {
    let launch = LaunchConfig::default().with_env_overrides()?;
    run_isolated_with::<T>(args, &launch)
}

/// Run `T` with `args` in a new worker process started with `launch`.
#[instrument(level = "debug", skip(args, launch), fields(task = T::NAME))]
pub fn run_isolated_with<T: Task>(args: T::Args, launch: &LaunchConfig) -> Result<T::Output> {
    let mut proc = spawn_worker(0, launch, None)?;
    let boot = Bootstrap::isolated(T::NAME, worker::current_level() + 1, launch.relay_logs);

    // A child that dies early breaks the pipe; its exit status explains why, so keep going
    // and read whatever it managed to report.
    let sent = proc.send(&boot).and_then(|()| proc.send(&args));
    proc.close_stdin();
    let received = proc.recv::<ResultSlot<T::Output>>();

    let reason = proc.finish()?;
    debug!(pid = %proc.pid(), reason = %reason, "isolated task finished");
    match reason.exit_code() {
        Some(0) => {}
        Some(code) => return Err(Error::ProcessFailure { code }),
        None => {
            return Err(Error::Worker(format!(
                "isolated worker ended abnormally: {}",
                reason
            )));
        }
    }

    match received? {
        Some(ResultSlot::Success(value)) => Ok(value),
        Some(ResultSlot::Failure(error)) => Err(Error::RemoteExecution(error)),
        None => {
            let mut message = format!(
                "isolated task '{}' exited without reporting a result",
                T::NAME
            );
            if let Err(e) = sent {
                message.push_str(&format!(" (after: {})", e));
            }
            Err(Error::Worker(message))
        }
    }
}
