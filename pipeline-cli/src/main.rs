mod manifest;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pipeline_core::runner::grid;
use pipeline_core::{dag, ConsoleReporter, Dep, RunContext, RunError, Runner, SkipStore, Trackable};

#[derive(Parser)]
#[command(name = "pipeline", about = "Runs a declared task graph", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a manifest's task graph.
    Run {
        manifest: PathBuf,
        #[arg(long, env = "PIPELINE_JOBS", default_value_t = 1)]
        jobs: usize,
        #[arg(long)]
        grid: bool,
        #[arg(long = "dry-run")]
        dry_run: bool,
        #[arg(long = "quit-early", default_value_t = true)]
        quit_early: bool,
        #[arg(long)]
        always: bool,
        #[arg(long = "fingerprint-dir", env = "PIPELINE_FINGERPRINT_DIR")]
        fingerprint_dir: Option<PathBuf>,
    },
    /// Builds the DAG for a manifest and prints it without running anything.
    Dag { manifest: PathBuf },
    /// Forgets recorded fingerprints for a manifest's targets, forcing a full re-run.
    Clean { manifest: PathBuf },
}

fn main() -> anyhow::Result<()> {
    // Hidden worker mode used internally by process-backed grid pools. Checked ahead of clap's
    // parser since it is never advertised in `--help` and needs no subcommand.
    if std::env::args().any(|a| a == "--worker") {
        return grid::worker_main(std::io::stdin().lock(), std::io::stdout().lock()).context("worker loop failed");
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))
            .context("installing SIGINT handler")?;
    }

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            manifest,
            jobs,
            grid,
            dry_run,
            quit_early,
            always,
            fingerprint_dir,
        } => run(manifest, jobs, grid, dry_run, quit_early, always, fingerprint_dir, interrupted),
        Command::Dag { manifest } => show_dag(manifest),
        Command::Clean { manifest } => clean(manifest),
    }
}

fn load_context(path: &PathBuf) -> anyhow::Result<RunContext> {
    load_context_with_fingerprint_dir(path, None)
}

fn load_context_with_fingerprint_dir(path: &PathBuf, fingerprint_dir: Option<PathBuf>) -> anyhow::Result<RunContext> {
    let manifest = manifest::load(path).with_context(|| format!("loading `{}'", path.display()))?;
    let declared = manifest::into_declared_tasks(manifest);
    let (tasks, graph, _registry) = dag::build(declared).context("building task graph")?;
    let fingerprint_path = fingerprint_dir.map(|dir| dir.join("fingerprints.json"));
    Ok(RunContext::new(
        tasks,
        graph,
        Arc::new(ConsoleReporter::new()),
        SkipStore::open(fingerprint_path),
    ))
}

fn run(
    manifest: PathBuf,
    jobs: usize,
    use_grid: bool,
    dry_run: bool,
    quit_early: bool,
    always: bool,
    fingerprint_dir: Option<PathBuf>,
    interrupted: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut ctx = load_context_with_fingerprint_dir(&manifest, fingerprint_dir)?;
    let order = ctx.dag().reverse_topological_order();
    let ready: VecDeque<usize> = order.into_iter().collect();
    // `--always` forces every task to run, bypassing the skip backend entirely (the `pipeline`
    // analogue of `anadama run --always`).
    let ready = if dry_run || always { ready } else { ctx.filter_stale(ready) };

    let mut runner: Box<dyn Runner> = if dry_run {
        Box::new(pipeline_core::DryRunner::new())
    } else if use_grid {
        let mut grid_runner = pipeline_core::GridRunner::with_quit_early(quit_early).with_interrupt_flag(interrupted);
        grid_runner
            .add_worker(
                grid::PoolConfig::thread("default", jobs.max(1)),
                ctx.reporter_handle(),
                true,
            )
            .context("starting default grid pool")?;
        Box::new(grid_runner)
    } else {
        let jobs = if jobs == 0 { num_cpus::get() } else { jobs };
        if jobs < 2 {
            Box::new(pipeline_core::SerialLocalRunner::with_quit_early(quit_early).with_interrupt_flag(interrupted))
        } else {
            Box::new(pipeline_core::ParallelLocalRunner::with_quit_early(jobs, quit_early).with_interrupt_flag(interrupted))
        }
    };

    match runner.run_tasks(&mut ctx, ready) {
        Ok(()) => Ok(()),
        Err(RunError::RunFailed) => {
            tracing::error!("one or more tasks failed");
            std::process::exit(1);
        },
        Err(RunError::Interrupted) => {
            tracing::warn!("interrupted, stopping");
            std::process::exit(130);
        },
        Err(e) => {
            tracing::error!(error = %e, "run aborted");
            bail!(e);
        },
    }
}

fn show_dag(manifest: PathBuf) -> anyhow::Result<()> {
    let mut ctx = load_context(&manifest)?;
    let ready: VecDeque<usize> = ctx.dag().reverse_topological_order().into_iter().collect();
    let mut runner = pipeline_core::DryRunner::new();
    runner.run_tasks(&mut ctx, ready)?;
    Ok(())
}

fn clean(manifest: PathBuf) -> anyhow::Result<()> {
    let ctx = load_context(&manifest)?;
    let names: Vec<String> = ctx
        .tasks()
        .iter()
        .flat_map(|t| t.targets.iter())
        .map(|d: &std::sync::Arc<Dep>| d.name().to_string())
        .collect();
    ctx.skip_store().forget(&names);
    ctx.skip_store().flush().context("flushing skip store")?;
    println!("forgot fingerprints for {} target(s)", names.len());
    Ok(())
}
