//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use modelops::logging::LogFormat;
use modelops::{CodecKind, PersistMethod, PoolPrimitive};
use std::path::PathBuf;

/// Run the demo item-mean recommender and worker diagnostics.
#[derive(Parser, Debug)]
#[command(name = "modelops")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,

    /// Log output format.
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train an item-mean model and score every user's items in parallel.
    Score(ScoreArgs),

    /// Run a small arithmetic task in an isolated subprocess.
    Isolate(IsolateArgs),

    /// Show the worker counts the sizing policy picks at each nesting level.
    Workers(WorkersArgs),

    /// Start a pool and report what each worker sees.
    Probe(ProbeArgs),
}

/// Options shared by commands that start worker pools.
#[derive(clap::Args, Debug, Clone)]
pub struct PoolArgs {
    /// Number of worker processes (default: sizing policy).
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// How the model is handed to workers: file or inline.
    #[arg(long)]
    pub persist: Option<PersistMethod>,

    /// Pool primitive: executor or legacy.
    #[arg(long)]
    pub pool: Option<PoolPrimitive>,

    /// Channel codec: buffer or json.
    #[arg(long)]
    pub codec: Option<CodecKind>,
}

/// Arguments for the score command.
#[derive(Parser, Debug)]
pub struct ScoreArgs {
    /// CSV file with a user,item,rating header (default: synthetic ratings).
    #[arg(long)]
    pub ratings: Option<PathBuf>,

    /// Number of synthetic users.
    #[arg(long, default_value_t = 100)]
    pub users: u64,

    /// Number of synthetic items.
    #[arg(long, default_value_t = 50)]
    pub items: u64,

    /// Seed for synthetic ratings.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Items to print per user.
    #[arg(short = 'n', long, default_value_t = 3)]
    pub top: usize,

    #[command(flatten)]
    pub pool: PoolArgs,
}

/// Task run by the isolate command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IsolateTask {
    Add,
    Divide,
}

/// Arguments for the isolate command.
#[derive(Parser, Debug)]
pub struct IsolateArgs {
    /// Task to run.
    #[arg(value_enum)]
    pub task: IsolateTask,

    /// First operand.
    #[arg(allow_negative_numbers = true)]
    pub a: i64,

    /// Second operand.
    #[arg(allow_negative_numbers = true)]
    pub b: i64,
}

/// Arguments for the workers command.
#[derive(Parser, Debug)]
pub struct WorkersArgs {
    /// Number of nesting levels to show.
    #[arg(long, default_value_t = 3)]
    pub levels: usize,
}

/// Arguments for the probe command.
#[derive(Parser, Debug)]
pub struct ProbeArgs {
    /// Number of probe calls to distribute.
    #[arg(long, default_value_t = 8)]
    pub calls: u32,

    #[command(flatten)]
    pub pool: PoolArgs,
}

/// Log format choices for the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Verbosity level for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// -q: errors only.
    Quiet,
    /// Default: warnings and results.
    Normal,
    /// -v: include pool lifecycle info.
    Info,
    /// -vv: include debug info (worker frames, dispatch).
    Debug,
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v and -q flags.
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::from(self.verbose)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        // Verify the CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_score_defaults() {
        let args = Cli::try_parse_from(["modelops", "score"]).unwrap();
        match args.command {
            Commands::Score(score) => {
                assert!(score.ratings.is_none());
                assert_eq!(score.users, 100);
                assert_eq!(score.items, 50);
                assert_eq!(score.top, 3);
                assert_eq!(score.pool.jobs, None);
            }
            _ => panic!("Expected Score command"),
        }
    }

    #[test]
    fn test_score_with_pool_options() {
        let args = Cli::try_parse_from([
            "modelops", "score", "--jobs", "3", "--persist", "inline", "--pool", "legacy",
            "--codec", "json",
        ])
        .unwrap();
        match args.command {
            Commands::Score(score) => {
                assert_eq!(score.pool.jobs, Some(3));
                assert_eq!(score.pool.persist, Some(PersistMethod::Inline));
                assert_eq!(score.pool.pool, Some(PoolPrimitive::Legacy));
                assert_eq!(score.pool.codec, Some(CodecKind::Json));
            }
            _ => panic!("Expected Score command"),
        }
    }

    #[test]
    fn test_score_rejects_bad_persist() {
        assert!(Cli::try_parse_from(["modelops", "score", "--persist", "shm"]).is_err());
    }

    #[test]
    fn test_isolate_negative_operands() {
        let args = Cli::try_parse_from(["modelops", "isolate", "divide", "-9", "3"]).unwrap();
        match args.command {
            Commands::Isolate(isolate) => {
                assert_eq!(isolate.task, IsolateTask::Divide);
                assert_eq!(isolate.a, -9);
                assert_eq!(isolate.b, 3);
            }
            _ => panic!("Expected Isolate command"),
        }
    }

    #[test]
    fn test_verbosity_levels() {
        let args = Cli::try_parse_from(["modelops", "workers"]).unwrap();
        assert_eq!(args.verbosity(), Verbosity::Normal);

        let args = Cli::try_parse_from(["modelops", "-vv", "workers"]).unwrap();
        assert_eq!(args.verbosity(), Verbosity::Debug);

        let args = Cli::try_parse_from(["modelops", "-q", "workers"]).unwrap();
        assert_eq!(args.verbosity(), Verbosity::Quiet);
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["modelops", "-q", "-v", "workers"]).is_err());
    }
}
