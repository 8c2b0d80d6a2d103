use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use taskweave::config::Config;
use taskweave::core::{GraphAnalyzer, TaskSet};
use taskweave::orchestration::{
    CapabilityRegistry, Consolidator, PathPlanner, RunPipeline, RunReport, WorkerSet,
};
use taskweave::state::{RunId, RunStatus, RunStore, RunSummary};
use taskweave::{twlog, Error, Result};

/// Taskweave - dependency-aware task graph runner
#[derive(Parser, Debug)]
#[command(name = "taskweave")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    TASKWEAVE_DEBUG=1     Enable debug logging (alternative to --debug)\n    TASKWEAVE_LOG=level   error, warn, info, debug or trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.taskweave/taskweave.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Analyze a task list and print groups, paths and canonical paths
    Analyze {
        /// JSON array of tasks
        tasks: PathBuf,
    },

    /// Print the execution units planned for a task list
    Plan {
        /// JSON array of tasks
        tasks: PathBuf,

        /// Agent catalog (defaults to registry_path from the config file)
        #[arg(long)]
        registry: Option<PathBuf>,
    },

    /// Execute a task list and record the run
    Run {
        /// JSON array of tasks
        tasks: PathBuf,

        /// Agent catalog (defaults to registry_path from the config file)
        #[arg(long)]
        registry: Option<PathBuf>,

        /// Request text stored with the run
        #[arg(long, default_value = "")]
        request: String,

        /// Print the report as JSON instead of text
        #[arg(long)]
        headless: bool,

        /// Use echo workers instead of the agents' commands
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the summary and failures of a run
    Summary {
        /// Run ID (uses latest if not specified)
        run_id: Option<String>,
    },

    /// Print the consolidated outputs of a run as JSON
    Outputs {
        /// Run ID (uses latest if not specified)
        run_id: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    taskweave::log::init(cli.debug);
    if cli.debug {
        twlog!("taskweave starting (debug mode enabled)");
    }

    let config = Config::load()?;

    match cli.command {
        Command::Analyze { tasks } => run_analyze(&tasks),
        Command::Plan { tasks, registry } => run_plan(&config, &tasks, registry),
        Command::Run {
            tasks,
            registry,
            request,
            headless,
            dry_run,
        } => run_tasks(&config, &tasks, registry, &request, headless, dry_run),
        Command::Summary { run_id } => run_summary(&config, run_id),
        Command::Outputs { run_id } => run_outputs(&config, run_id),
    }
}

fn read_tasks(path: &Path) -> Result<String> {
    twlog!("Reading tasks from {}", path.display());
    Ok(std::fs::read_to_string(path)?)
}

fn load_registry(config: &Config, explicit: Option<PathBuf>) -> Result<CapabilityRegistry> {
    match explicit.or_else(|| config.registry_path()) {
        Some(path) => CapabilityRegistry::load(&path),
        None => Err(Error::Validation(
            "No agent registry: pass --registry or set registry_path in ~/.taskweave/taskweave.toml"
                .to_string(),
        )),
    }
}

fn open_store(config: &Config) -> Result<RunStore> {
    RunStore::open(&config.store_path()?)
}

fn run_analyze(tasks: &Path) -> Result<()> {
    let set = TaskSet::from_json(&read_tasks(tasks)?)?;
    let analysis = GraphAnalyzer::analyze(&set)?;
    let output = serde_json::json!({
        "analysis": analysis,
        "exclusions": set.exclusions(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_plan(config: &Config, tasks: &Path, registry: Option<PathBuf>) -> Result<()> {
    let registry = load_registry(config, registry)?;
    let set = TaskSet::from_json_with(&read_tasks(tasks)?, |agent| registry.contains(agent))?;
    let analysis = GraphAnalyzer::analyze(&set)?;
    analysis.ensure_acyclic()?;
    let units = PathPlanner::new(&registry).plan_all(&analysis.dependency_paths, &set);
    let output = serde_json::json!({
        "units": units,
        "exclusions": set.exclusions(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_tasks(
    config: &Config,
    tasks: &Path,
    registry: Option<PathBuf>,
    request: &str,
    headless: bool,
    dry_run: bool,
) -> Result<()> {
    twlog!(
        "Run command: tasks={}, headless={}, dry_run={}",
        tasks.display(),
        headless,
        dry_run
    );

    let registry = Arc::new(load_registry(config, registry)?);
    let workers = if dry_run {
        WorkerSet::echo_all(&registry)
    } else {
        WorkerSet::from_registry(&registry)?
    };
    Config::ensure_dirs()?;
    let pipeline = RunPipeline::new(
        registry,
        Arc::new(open_store(config)?),
        Arc::new(workers),
        config.executor_config(),
    );

    let set = pipeline.admit_json(&read_tasks(tasks)?)?;
    let prepared = pipeline.prepare(set)?;

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(pipeline.execute(request, &prepared))?;

    if headless {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                        Run Complete                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    print_summary(&report.summary);

    if !report.results.is_empty() {
        println!("  Tasks:");
        for result in &report.results {
            println!(
                "    • {:<12} {:<8} {:>6}ms  {}",
                result.task_id,
                format_status(result.status),
                result.duration_ms,
                result.error.as_deref().unwrap_or("")
            );
        }
        println!();
    }

    if !report.exclusions.is_empty() {
        println!("⚠️  Excluded:");
        for exclusion in &report.exclusions {
            println!("    • {}: {}", exclusion.task_id, exclusion.reason);
        }
        println!();
    }

    println!("Next steps:");
    println!("  • Inspect failures: taskweave summary {}", report.run_id);
    println!("  • Read outputs:     taskweave outputs {}", report.run_id);
}

fn print_summary(summary: &RunSummary) {
    println!("  Run ID:      {}", summary.run_id);
    println!("  Tasks:       {}", summary.total);
    println!("  Succeeded:   {}", summary.success);
    println!("  Failed:      {}", summary.failed);
    if summary.running > 0 {
        println!("  Running:     {}", summary.running);
    }
    println!(
        "  Duration:    total {}ms, avg {:.1}ms, min {}ms, max {}ms",
        summary.total_duration_ms,
        summary.avg_duration_ms,
        summary.min_duration_ms,
        summary.max_duration_ms
    );
    println!();
}

/// Format a task status with color codes for terminal.
fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Success => format!("\x1b[32m{}\x1b[0m", status),
        RunStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),
        RunStatus::Running => format!("\x1b[33m{}\x1b[0m", status),
        RunStatus::Pending => format!("\x1b[90m{}\x1b[0m", status),
    }
}

/// Resolve an explicit run id, or the most recent run.
fn resolve_run(store: &RunStore, run_id: Option<String>) -> Result<RunId> {
    match run_id {
        Some(id) => {
            let id = RunId::new(id);
            store
                .get_run(&id)?
                .map(|r| r.run_id)
                .ok_or_else(|| Error::UnknownRun(id.to_string()))
        }
        None => store
            .list_runs()?
            .into_iter()
            .next()
            .map(|r| r.run_id)
            .ok_or_else(|| Error::Validation("No runs found".to_string())),
    }
}

fn run_summary(config: &Config, run_id: Option<String>) -> Result<()> {
    let store = open_store(config)?;
    let run_id = resolve_run(&store, run_id)?;
    let run = store
        .get_run(&run_id)?
        .ok_or_else(|| Error::UnknownRun(run_id.to_string()))?;

    println!();
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                        Run Summary                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    if !run.request.is_empty() {
        println!("  Request:     {}", run.request);
    }
    println!("  Created:     {}", run.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(finished) = run.finished_at {
        println!("  Finished:    {}", finished.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    print_summary(&store.get_run_summary(&run_id)?);

    let failed = store.get_failed_tasks(&run_id)?;
    if !failed.is_empty() {
        println!("  Failures:");
        for row in &failed {
            println!(
                "    • {} ({}): {}",
                row.task_id,
                row.agent,
                row.error.as_deref().unwrap_or("unknown error")
            );
        }
        println!();
    }
    Ok(())
}

fn run_outputs(config: &Config, run_id: Option<String>) -> Result<()> {
    let store = open_store(config)?;
    let run_id = resolve_run(&store, run_id)?;
    let result = Consolidator::consolidate(&store, &run_id)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
