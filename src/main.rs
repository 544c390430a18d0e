//! modelops - parallel model operation runner

mod cli;

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::{Level, info};

use cli::{Cli, Commands, PoolArgs, Verbosity};
use modelops::demo::{self, Add, Divide, ItemMeans, ProbeWorker, ScoreItems, ScoreRequest};
use modelops::logging::{self, LogConfig};
use modelops::sizing::{DEFAULT_CORE_DIVISOR, DEFAULT_MAX_JOBS};
use modelops::{InvokerConfig, ModelOpInvoker, ModelSource};

/// Program entry point.
///
/// Worker processes are re-executions of this binary and never get past `run_if_worker`.
/// Otherwise the CLI is parsed, logging is set up, and the selected command runs; on error the
/// error and its cause chain are printed and the process exits with status 1.
fn main() {
    modelops::run_if_worker(&demo::registry());

    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Score(args) => cmd_score(args),
        Commands::Isolate(args) => cmd_isolate(args),
        Commands::Workers(args) => cmd_workers(args),
        Commands::Probe(args) => cmd_probe(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let level = match cli.verbosity() {
        Verbosity::Quiet => Level::ERROR,
        Verbosity::Normal => Level::WARN,
        Verbosity::Info => Level::INFO,
        Verbosity::Debug => Level::DEBUG,
    };
    let mut config = LogConfig::default().with_level(level).with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format.into());
    }
    logging::init(config);
}

/// Invoker configuration from the environment, then the command line.
fn invoker_config(args: &PoolArgs) -> Result<InvokerConfig> {
    let mut config = InvokerConfig::new()
        .with_env_overrides()
        .context("invalid worker pool settings in the environment")?;
    config.job_count = args.jobs;
    config.persist_method = args.persist;
    if let Some(pool) = args.pool {
        config.pool = pool;
    }
    if let Some(codec) = args.codec {
        config.launch.codec = codec;
    }
    Ok(config)
}

fn cmd_score(args: &cli::ScoreArgs) -> Result<()> {
    let ratings = match &args.ratings {
        Some(path) => demo::read_ratings(path)
            .with_context(|| format!("failed to read ratings from {}", path.display()))?,
        None => demo::synthetic_ratings(args.users, args.items, args.seed),
    };
    let model = ItemMeans::train(&ratings);

    // Every user is scored against the items they have not rated yet.
    let all_items: BTreeSet<u64> = ratings.iter().map(|r| r.item).collect();
    let mut seen: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
    for r in &ratings {
        seen.entry(r.user).or_default().insert(r.item);
    }
    let candidates: Vec<(u64, Vec<u64>)> = seen
        .into_iter()
        .map(|(user, rated)| (user, all_items.difference(&rated).copied().collect()))
        .collect();
    let requests: Vec<ScoreRequest> = candidates.iter().cloned().map(Into::into).collect();

    let config = invoker_config(&args.pool)?;
    let mut invoker = modelops::get_invoker_with::<ScoreItems>(ModelSource::Raw(model), &config)
        .context("failed to start the scoring invoker")?;
    info!(
        strategy = %invoker.strategy(),
        workers = invoker.worker_count(),
        users = requests.len(),
        "scoring users"
    );

    let start = Instant::now();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for (result, (user, items)) in invoker.map_iter(requests)?.zip(&candidates) {
        let scored = result?;
        let mut ranked: Vec<(u64, f64)> = items.iter().copied().zip(scored.scores).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        for (item, score) in ranked.into_iter().take(args.top) {
            writeln!(out, "{}\t{}\t{:.3}", user, item, score)?;
        }
    }
    info!(elapsed_ms = start.elapsed().as_millis(), "scoring finished");

    invoker.shutdown()?;
    Ok(())
}

fn cmd_isolate(args: &cli::IsolateArgs) -> Result<()> {
    let value = match args.task {
        cli::IsolateTask::Add => modelops::run_isolated::<Add>((args.a, args.b))?,
        cli::IsolateTask::Divide => modelops::run_isolated::<Divide>((args.a, args.b))?,
    };
    println!("{}", value);
    Ok(())
}

fn cmd_workers(args: &cli::WorkersArgs) -> Result<()> {
    for level in 0..args.levels {
        let workers =
            modelops::desired_workers(Some(DEFAULT_CORE_DIVISOR), Some(DEFAULT_MAX_JOBS), level)?;
        println!("level {}: {} workers", level, workers);
    }
    let (jobs, child_jobs) = modelops::resolve_job_counts(None)?;
    println!("invoker: {} jobs, {} threads per worker", jobs, child_jobs);
    Ok(())
}

fn cmd_probe(args: &cli::ProbeArgs) -> Result<()> {
    let config = invoker_config(&args.pool)?;
    let model = ItemMeans::train(&[]);
    let mut invoker = modelops::get_invoker_with::<ProbeWorker>(ModelSource::Raw(model), &config)
        .context("failed to start the probe invoker")?;

    let probes = invoker.map((0..args.calls).collect())?;
    invoker.shutdown()?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for probe in probes {
        writeln!(out, "{}", serde_json::to_string(&probe)?)?;
    }
    Ok(())
}
