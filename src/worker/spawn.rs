//! Worker subprocess spawning.
//!
//! Workers are always fresh executions of the worker executable (by default the current
//! one), never forks of a running parent. `std::process::Command` uses `posix_spawn` or
//! fork+exec, so no parent state survives into the worker except what is passed explicitly.

use super::proc::Proc;
use super::{THREAD_ENV_VARS, WORKER_ENV};
use crate::config::{CODEC_ENV, LaunchConfig};
use crate::error::{Error, Result};
use std::process::{Command, Stdio};
use tracing::debug;

/// Build the command that starts a worker.
pub(crate) fn worker_command(launch: &LaunchConfig, child_jobs: Option<usize>) -> Result<Command> {
    let exe_path = launch.resolve_exe()?;
    let mut cmd = Command::new(&exe_path);

    cmd.env(WORKER_ENV, "1");
    cmd.env(CODEC_ENV, launch.codec.to_string());

    // Numeric libraries size their pools from these before any of our code runs.
    if let Some(jobs) = child_jobs {
        for var in THREAD_ENV_VARS {
            cmd.env(var, jobs.to_string());
        }
    }

    for (key, value) in &launch.env {
        cmd.env(key, value);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    if launch.relay_logs {
        cmd.stderr(Stdio::piped());
    } else {
        cmd.stderr(Stdio::inherit());
    }

    Ok(cmd)
}

/// Spawn worker `id`.
///
/// `child_jobs` is set for pooled workers and caps the numeric thread pools inside them.
pub fn spawn_worker(id: usize, launch: &LaunchConfig, child_jobs: Option<usize>) -> Result<Proc> {
    let mut cmd = worker_command(launch, child_jobs)?;
    let child = cmd
        .spawn()
        .map_err(|e| Error::Worker(format!("Failed to spawn worker {}: {}", id, e)))?;

    debug!(
        worker = id,
        pid = child.id(),
        exe = %cmd.get_program().to_string_lossy(),
        codec = %launch.codec,
        "spawned worker"
    );

    Proc::from_child(child, id, launch.codec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecKind;
    use std::ffi::OsStr;

    fn env_of<'a>(cmd: &'a Command, key: &str) -> Option<&'a OsStr> {
        cmd.get_envs()
            .find(|(k, _)| *k == OsStr::new(key))
            .and_then(|(_, v)| v)
    }

    #[test]
    fn test_worker_command_environment() {
        let launch = LaunchConfig::new()
            .with_worker_exe("/bin/worker")
            .with_codec(CodecKind::Json)
            .with_env("EXTRA", "yes");
        let cmd = worker_command(&launch, Some(3)).unwrap();

        assert_eq!(cmd.get_program(), OsStr::new("/bin/worker"));
        assert_eq!(env_of(&cmd, WORKER_ENV), Some(OsStr::new("1")));
        assert_eq!(env_of(&cmd, CODEC_ENV), Some(OsStr::new("json")));
        assert_eq!(env_of(&cmd, "EXTRA"), Some(OsStr::new("yes")));
        for var in THREAD_ENV_VARS {
            assert_eq!(env_of(&cmd, var), Some(OsStr::new("3")));
        }
    }

    #[test]
    fn test_isolated_command_leaves_thread_env_alone() {
        let launch = LaunchConfig::new().with_worker_exe("/bin/worker");
        let cmd = worker_command(&launch, None).unwrap();
        assert!(env_of(&cmd, "RAYON_NUM_THREADS").is_none());
        assert_eq!(env_of(&cmd, CODEC_ENV), Some(OsStr::new("buffer")));
    }

    #[test]
    fn test_spawn_missing_executable_fails() {
        let launch = LaunchConfig::new().with_worker_exe("/nonexistent/modelops-worker");
        let err = spawn_worker(0, &launch, None).unwrap_err();
        assert!(err.to_string().contains("Failed to spawn worker 0"));
    }
}
