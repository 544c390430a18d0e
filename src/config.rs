//! Configuration for worker launches and invokers.
//!
//! # Environment Variables
//!
//! - `MODELOPS_POOL` - Pool primitive: executor, legacy
//! - `MODELOPS_CODEC` - Wire codec for worker channels: buffer, json
//! - `MODELOPS_WORKER_EXE` - Executable to start workers from (default: current executable)

use crate::codec::CodecKind;
use crate::error::{Error, Result};
use crate::sharing::PersistMethod;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable selecting the pool primitive.
pub const POOL_ENV: &str = "MODELOPS_POOL";
/// Environment variable selecting the worker codec.
pub const CODEC_ENV: &str = "MODELOPS_CODEC";
/// Environment variable naming the worker executable.
pub const WORKER_EXE_ENV: &str = "MODELOPS_WORKER_EXE";

/// Which pooling primitive backs a multi-worker invoker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PoolPrimitive {
    /// Dispatcher threads feeding idle workers, results streamed in input order.
    #[default]
    Executor,
    /// Blocking star-map with static round-robin assignment.
    Legacy,
}

impl FromStr for PoolPrimitive {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "executor" => Ok(Self::Executor),
            "legacy" => Ok(Self::Legacy),
            _ => Err(format!(
                "Unknown pool primitive: '{}'. Valid options: executor, legacy",
                s
            )),
        }
    }
}

impl fmt::Display for PoolPrimitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executor => write!(f, "executor"),
            Self::Legacy => write!(f, "legacy"),
        }
    }
}

/// How worker processes are started.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Executable to run as the worker (None = current executable).
    pub worker_exe: Option<PathBuf>,
    /// Codec for the worker's request and result channels.
    pub codec: CodecKind,
    /// Relay worker logs through this process's subscriber (default: true).
    pub relay_logs: bool,
    /// Extra environment variables for the worker.
    pub env: Vec<(OsString, OsString)>,
    /// How long shutdown waits for a worker before signalling it (default: 5s).
    pub shutdown_timeout: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            worker_exe: None,
            codec: CodecKind::default(),
            relay_logs: true,
            env: Vec::new(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl LaunchConfig {
    /// Create a new LaunchConfig with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker executable.
    pub fn with_worker_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.worker_exe = Some(exe.into());
        self
    }

    /// Set the channel codec.
    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    /// Enable or disable log relaying.
    pub fn with_relay_logs(mut self, enabled: bool) -> Self {
        self.relay_logs = enabled;
        self
    }

    /// Add an environment variable for workers.
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Malformed values are rejected rather than ignored.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(codec) = std::env::var(CODEC_ENV) {
            self.codec = codec.parse().map_err(Error::Config)?;
        }
        if let Some(exe) = std::env::var_os(WORKER_EXE_ENV) {
            if exe.is_empty() {
                return Err(Error::Config(format!("{} is empty", WORKER_EXE_ENV)));
            }
            self.worker_exe = Some(PathBuf::from(exe));
        }
        Ok(self)
    }

    /// Executable workers are started from.
    pub fn resolve_exe(&self) -> Result<PathBuf> {
        match &self.worker_exe {
            Some(exe) => Ok(exe.clone()),
            None => std::env::current_exe()
                .map_err(|e| Error::Worker(format!("Failed to get current executable: {}", e))),
        }
    }
}

/// How [`get_invoker_with`](crate::get_invoker_with) builds an invoker.
#[derive(Debug, Clone, Default)]
pub struct InvokerConfig {
    /// Number of workers (None = sizing policy).
    pub job_count: Option<usize>,
    /// How a raw model is persisted for workers (None = file).
    pub persist_method: Option<PersistMethod>,
    /// Pool primitive for multi-worker invokers.
    pub pool: PoolPrimitive,
    /// Worker launch settings.
    pub launch: LaunchConfig,
}

impl InvokerConfig {
    /// Create a new InvokerConfig with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the job count.
    pub fn with_job_count(mut self, jobs: usize) -> Self {
        self.job_count = Some(jobs);
        self
    }

    /// Set the persistence method.
    pub fn with_persist_method(mut self, method: PersistMethod) -> Self {
        self.persist_method = Some(method);
        self
    }

    /// Set the pool primitive.
    pub fn with_pool(mut self, pool: PoolPrimitive) -> Self {
        self.pool = pool;
        self
    }

    /// Set the launch settings.
    pub fn with_launch(mut self, launch: LaunchConfig) -> Self {
        self.launch = launch;
        self
    }

    /// Apply environment variable overrides, including the launch settings.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(pool) = std::env::var(POOL_ENV) {
            self.pool = pool.parse().map_err(Error::Config)?;
        }
        self.launch = self.launch.with_env_overrides()?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        unsafe {
            std::env::remove_var(POOL_ENV);
            std::env::remove_var(CODEC_ENV);
            std::env::remove_var(WORKER_EXE_ENV);
        }
    }

    #[test]
    fn test_pool_primitive_from_str() {
        assert_eq!("executor".parse::<PoolPrimitive>().unwrap(), PoolPrimitive::Executor);
        assert_eq!("LEGACY".parse::<PoolPrimitive>().unwrap(), PoolPrimitive::Legacy);
        assert!("threads".parse::<PoolPrimitive>().is_err());
    }

    #[test]
    fn test_launch_config_defaults() {
        let config = LaunchConfig::default();
        assert!(config.worker_exe.is_none());
        assert_eq!(config.codec, CodecKind::Buffer);
        assert!(config.relay_logs);
        assert!(config.env.is_empty());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_launch_config_builder() {
        let config = LaunchConfig::new()
            .with_worker_exe("/usr/bin/true")
            .with_codec(CodecKind::Json)
            .with_relay_logs(false)
            .with_env("MODELOPS_NUM_PROCS", "2,1")
            .with_shutdown_timeout(Duration::from_millis(250));

        assert_eq!(config.resolve_exe().unwrap(), PathBuf::from("/usr/bin/true"));
        assert_eq!(config.codec, CodecKind::Json);
        assert!(!config.relay_logs);
        assert_eq!(config.env.len(), 1);
        assert_eq!(config.shutdown_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_resolve_exe_defaults_to_current() {
        let exe = LaunchConfig::default().resolve_exe().unwrap();
        assert_eq!(exe, std::env::current_exe().unwrap());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        unsafe {
            std::env::set_var(POOL_ENV, "legacy");
            std::env::set_var(CODEC_ENV, "json");
            std::env::set_var(WORKER_EXE_ENV, "/opt/worker");
        }
        let config = InvokerConfig::new().with_env_overrides().unwrap();
        clear_env();

        assert_eq!(config.pool, PoolPrimitive::Legacy);
        assert_eq!(config.launch.codec, CodecKind::Json);
        assert_eq!(config.launch.worker_exe, Some(PathBuf::from("/opt/worker")));
    }

    #[test]
    #[serial]
    fn test_malformed_env_fails_fast() {
        clear_env();
        unsafe {
            std::env::set_var(POOL_ENV, "fork");
        }
        let result = InvokerConfig::new().with_env_overrides();
        clear_env();
        assert!(matches!(result, Err(Error::Config(_))));

        unsafe {
            std::env::set_var(CODEC_ENV, "pickle");
        }
        let result = LaunchConfig::new().with_env_overrides();
        clear_env();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    #[serial]
    fn test_no_env_keeps_builder_values() {
        clear_env();
        let config = InvokerConfig::new()
            .with_job_count(3)
            .with_persist_method(PersistMethod::Inline)
            .with_pool(PoolPrimitive::Legacy)
            .with_env_overrides()
            .unwrap();
        assert_eq!(config.job_count, Some(3));
        assert_eq!(config.persist_method, Some(PersistMethod::Inline));
        assert_eq!(config.pool, PoolPrimitive::Legacy);
    }
}
