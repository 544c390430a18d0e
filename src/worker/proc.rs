//! Process handle for worker subprocesses.
//!
//! Wraps a child process with its request and result queues and, when enabled, the log
//! relay reading its stderr.

use super::signals::{TerminationReason, analyze_wait_status};
use crate::codec::CodecKind;
use crate::error::{Error, Result};
use crate::logging::LogRelay;
use crate::queue::{FastReceiver, FastSender};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Handle to a worker subprocess with IPC channels.
#[derive(Debug)]
pub struct Proc {
    /// Index of the worker in its pool (0 for isolated runs).
    id: usize,
    pid: Pid,
    /// Request queue on the worker's stdin; `None` once closed.
    requests: Option<FastSender<CodecKind>>,
    /// Result queue on the worker's stdout.
    results: FastReceiver<CodecKind>,
    relay: Option<LogRelay>,
    /// Wait status once the process has been reaped.
    status: Option<WaitStatus>,
}

impl Proc {
    /// Create from a spawned `std::process::Child`.
    ///
    /// Takes ownership of the child's stdin and stdout, and of its stderr if it was piped
    /// (which starts a [`LogRelay`]).
    pub fn from_child(mut child: std::process::Child, id: usize, codec: CodecKind) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Worker("Child stdout not captured".into()))?;
        let relay = match child.stderr.take() {
            Some(stderr) => Some(LogRelay::spawn(id, stderr)?),
            None => None,
        };

        Ok(Self {
            id,
            pid,
            requests: Some(FastSender::new(stdin, codec)),
            results: FastReceiver::new(stdout, codec),
            relay,
            status: None,
        })
    }

    /// Get the process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send one frame to the worker.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| Error::Worker(format!("Worker {} stdin already closed", self.id)))?;
        requests.put(message).map_err(|e| {
            Error::Worker(format!("Failed to send to worker {}: {}", self.id, e))
        })
    }

    /// Receive one frame from the worker.
    ///
    /// Returns `None` if the worker closed its result channel (EOF).
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        self.results.get().map_err(|e| {
            Error::Worker(format!("Failed to receive from worker {}: {}", self.id, e))
        })
    }

    /// Close the worker's stdin, signalling end of input.
    pub fn close_stdin(&mut self) {
        self.requests = None;
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    self.status = Some(status);
                    return Ok(status);
                }
                Ok(_) | Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(Error::Worker(format!("waitpid failed: {}", e))),
            }
        }
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                self.status = Some(status);
                Ok(Some(status))
            }
            Ok(_) => Ok(None),
            Err(e) => Err(Error::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Why the process ended, giving it up to `grace` to finish exiting.
    ///
    /// Used after the result channel hit EOF, when the child is usually already gone.
    pub fn termination_reason(&mut self, grace: Duration) -> TerminationReason {
        let start = Instant::now();
        loop {
            match self.try_wait() {
                Ok(Some(status)) => return analyze_wait_status(status),
                Ok(None) if start.elapsed() < grace => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(None) => return TerminationReason::StillAlive,
                Err(_) => return TerminationReason::Unknown,
            }
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| Error::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| Error::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        self.wait()?;
        Ok(())
    }

    /// Close stdin, wait for the process to exit on its own and drain its log relay.
    pub fn finish(&mut self) -> Result<TerminationReason> {
        self.close_stdin();
        let status = self.wait()?;
        if let Some(relay) = self.relay.take() {
            relay.join();
        }
        Ok(analyze_wait_status(status))
    }

    /// Gracefully stop the worker: close its stdin, wait up to `timeout`, then escalate to
    /// SIGTERM and SIGKILL. Joins the log relay once the process is gone.
    pub fn stop(&mut self, timeout: Duration) -> Result<TerminationReason> {
        self.close_stdin();

        let start = Instant::now();
        let mut stopped = false;
        while start.elapsed() < timeout {
            if let Ok(Some(_)) = self.try_wait() {
                stopped = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        if !stopped {
            debug!(worker = self.id, pid = %self.pid, "worker did not exit in time, sending SIGTERM");
            let _ = self.terminate();
            std::thread::sleep(Duration::from_millis(100));
            if !matches!(self.try_wait(), Ok(Some(_))) {
                debug!(worker = self.id, pid = %self.pid, "sending SIGKILL");
                self.kill()?;
            }
        }

        if let Some(relay) = self.relay.take() {
            relay.join();
        }
        let reason = analyze_wait_status(self.wait()?);
        trace!(worker = self.id, reason = %reason, "worker stopped");
        Ok(reason)
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.status.is_none() {
            self.close_stdin();
            let _ = self.terminate();
            std::thread::sleep(Duration::from_millis(10));

            if let Ok(Some(_)) = self.try_wait() {
                return;
            }

            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn(program: &str, args: &[&str], codec: CodecKind) -> Proc {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn test process");
        Proc::from_child(child, 0, codec).expect("Failed to create Proc")
    }

    #[test]
    fn test_proc_frames_roundtrip_through_cat() {
        for codec in [CodecKind::Json, CodecKind::Buffer] {
            let mut proc = spawn("cat", &[], codec);
            assert!(proc.try_wait().unwrap().is_none());

            proc.send(&(1u32, "one".to_string())).unwrap();
            let echoed: (u32, String) = proc.recv().unwrap().unwrap();
            assert_eq!(echoed, (1, "one".to_string()));

            proc.close_stdin();
            assert!(proc.recv::<(u32, String)>().unwrap().is_none());
            let reason = proc.stop(Duration::from_secs(1)).unwrap();
            assert!(reason.is_success());
            assert!(proc.try_wait().unwrap().is_some());
        }
    }

    #[test]
    fn test_send_after_close_fails() {
        let mut proc = spawn("cat", &[], CodecKind::Json);
        proc.close_stdin();
        assert!(matches!(proc.send(&1u32), Err(Error::Worker(_))));
        proc.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_stop_escalates_to_signals() {
        let mut proc = spawn("sleep", &["60"], CodecKind::Json);
        assert!(proc.try_wait().unwrap().is_none());

        let reason = proc.stop(Duration::from_millis(50)).unwrap();
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGTERM));
        assert!(proc.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_termination_reason_reports_exit_code() {
        let mut proc = spawn("sh", &["-c", "exit 3"], CodecKind::Json);
        assert!(proc.recv::<u32>().unwrap().is_none());
        assert_eq!(
            proc.termination_reason(Duration::from_secs(5)),
            TerminationReason::Exited(3)
        );
    }

    #[test]
    fn test_stderr_is_relayed() {
        let child = Command::new("sh")
            .args(["-c", "echo relayed >&2"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let mut proc = Proc::from_child(child, 4, CodecKind::Json).unwrap();
        assert!(proc.relay.is_some());
        proc.stop(Duration::from_secs(1)).unwrap();
        assert!(proc.relay.is_none());
    }
}
