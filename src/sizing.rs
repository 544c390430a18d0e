//! Worker sizing policy.
//!
//! Decides how many parallel workers to use at each nesting level. Level 0 is the outermost
//! parallelism; level 1 is whatever a worker runs inside itself (numeric thread pools or a
//! nested invoker), and so on.
//!
//! # Environment Variables
//!
//! - `MODELOPS_NUM_PROCS` - comma-separated worker counts, one per level (e.g. `4,2`)

use crate::error::{Error, Result};
use crate::worker;
use std::env;

/// Environment variable holding per-level worker counts.
pub const NUM_PROCS_ENV: &str = "MODELOPS_NUM_PROCS";

/// Default CPU divisor for the level-0 worker count.
pub const DEFAULT_CORE_DIVISOR: usize = 2;

/// Upper bound on the default invoker job count when nothing is configured.
pub const DEFAULT_MAX_JOBS: usize = 4;

/// Parse a `MODELOPS_NUM_PROCS` value.
///
/// Every entry must be a positive integer; anything else is a configuration error.
pub fn parse_proc_counts(value: &str) -> Result<Vec<usize>> {
    value
        .split(',')
        .map(|entry| {
            let entry = entry.trim();
            match entry.parse::<usize>() {
                Ok(0) => Err(Error::Config(format!(
                    "{} entries must be positive, got 0 in '{}'",
                    NUM_PROCS_ENV, value
                ))),
                Ok(n) => Ok(n),
                Err(_) => Err(Error::Config(format!(
                    "{} must be comma-separated integers, got '{}'",
                    NUM_PROCS_ENV, value
                ))),
            }
        })
        .collect()
}

/// Number of workers to use at `level`, given an explicit override and CPU count.
///
/// This is the pure form of [`desired_workers`]:
///
/// - With an override, entry `level` is used, or 1 past the end of the list.
/// - Otherwise, with a core divisor `d`, level 0 gets `max(cpus / d, 1)` (capped at
///   `max_default`), level 1 gets `d` and deeper levels get 1.
/// - With neither, every level gets 1.
pub fn desired_workers_with(
    override_value: Option<&str>,
    cpus: usize,
    core_divisor: Option<usize>,
    max_default: Option<usize>,
    level: usize,
) -> Result<usize> {
    let counts = if let Some(value) = override_value {
        parse_proc_counts(value)?
    } else if let Some(divisor) = core_divisor {
        if divisor == 0 {
            return Err(Error::Config("core divisor must be positive".into()));
        }
        let mut outer = (cpus / divisor).max(1);
        if let Some(max) = max_default {
            outer = outer.min(max);
        }
        vec![outer, divisor]
    } else {
        Vec::new()
    };

    Ok(counts.get(level).copied().unwrap_or(1))
}

/// Number of workers to use at `level`.
///
/// Reads `MODELOPS_NUM_PROCS` and the machine's CPU count; see [`desired_workers_with`].
pub fn desired_workers(
    core_divisor: Option<usize>,
    max_default: Option<usize>,
    level: usize,
) -> Result<usize> {
    let override_value = env::var(NUM_PROCS_ENV).ok();
    desired_workers_with(
        override_value.as_deref(),
        num_cpus::get(),
        core_divisor,
        max_default,
        level,
    )
}

/// Resolve `(jobs, child_jobs)` for an invoker created in this process.
///
/// Both counts are relative to this process's nesting level, so an invoker built inside a
/// pooled worker sizes itself with the level-1 policy.
pub fn resolve_job_counts(job_count: Option<usize>) -> Result<(usize, usize)> {
    let level = worker::current_level();
    let jobs = match job_count {
        Some(0) => return Err(Error::Config("job count must be at least 1".into())),
        Some(n) => n,
        None => desired_workers(
            Some(DEFAULT_CORE_DIVISOR),
            Some(DEFAULT_MAX_JOBS),
            level,
        )?,
    };
    let child_jobs = desired_workers(Some(DEFAULT_CORE_DIVISOR), None, level + 1)?;
    Ok((jobs, child_jobs))
}
