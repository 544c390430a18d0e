//! Termination analysis for worker subprocesses.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Exit code as reported to callers: the status for a normal exit, the negated signal
    /// number for a signal.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(sig) => Some(-(*sig as i32)),
            Self::StillAlive | Self::Unknown => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            // SIGKILL we did not send ourselves is usually the OOM killer.
            Self::Signaled(Signal::SIGKILL) => {
                "killed by signal SIGKILL (possibly out of memory)".to_string()
            }
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// Information about a worker that died while the parent still needed it.
#[derive(Debug)]
pub struct WorkerFailure {
    /// Index of the worker in its pool.
    pub worker: usize,
    /// Why the worker terminated.
    pub reason: TerminationReason,
    /// What the worker was doing when it failed.
    pub context: Option<String>,
}

impl WorkerFailure {
    /// Create a new worker failure.
    pub fn new(worker: usize, reason: TerminationReason) -> Self {
        Self {
            worker,
            reason,
            context: None,
        }
    }

    /// Add context about what the worker was doing.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker {} {}", self.worker, self.reason)?;
        if let Some(ctx) = &self.context {
            write!(f, " while {}", ctx)?;
        }
        Ok(())
    }
}

impl From<WorkerFailure> for crate::error::Error {
    fn from(failure: WorkerFailure) -> Self {
        Self::Worker(failure.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_termination_reason_success() {
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Exited(1).is_success());
        assert!(!TerminationReason::Signaled(Signal::SIGKILL).is_success());
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(TerminationReason::Exited(3).exit_code(), Some(3));
        assert_eq!(
            TerminationReason::Signaled(Signal::SIGABRT).exit_code(),
            Some(-6)
        );
        assert_eq!(TerminationReason::Signaled(Signal::SIGKILL).exit_code(), Some(-9));
        assert_eq!(TerminationReason::StillAlive.exit_code(), None);
    }

    #[test]
    fn test_analyze_wait_status() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 0);
        assert_eq!(analyze_wait_status(status), TerminationReason::Exited(0));

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGSEGV, false);
        assert_eq!(
            analyze_wait_status(status),
            TerminationReason::Signaled(Signal::SIGSEGV)
        );

        let status = WaitStatus::StillAlive;
        assert_eq!(analyze_wait_status(status), TerminationReason::StillAlive);
    }

    #[test]
    fn test_worker_failure_display() {
        let failure = WorkerFailure::new(2, TerminationReason::Signaled(Signal::SIGKILL))
            .with_context("processing input 17");

        let display = failure.to_string();
        assert!(display.contains("worker 2"));
        assert!(display.contains("out of memory"));
        assert!(display.contains("processing input 17"));
    }
}
