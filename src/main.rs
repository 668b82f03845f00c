use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use wavefront::config::Config;
use wavefront::core::{DeclaredEffort, GraphBuilder, SubtaskStatus, TaskDecomposition};
use wavefront::orchestration::{
    FailureMode, ParallelExecutionResult, ParallelExecutor, ResolutionResult, Resolver,
    SimulatedExecutor,
};
use wavefront::{wlog, Result};

/// Wavefront - dependency-aware subtask scheduler
#[derive(Parser, Debug)]
#[command(name = "wavefront")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    WAVEFRONT_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.wavefront/wavefront.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file to use instead of ~/.wavefront/config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Analyse a decomposition: levels, critical path and statistics
    Plan {
        /// Decomposition file (.json or .toml)
        file: PathBuf,

        /// Print the dependency graph in Graphviz dot format
        #[arg(long)]
        dot: bool,

        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Dry-run a decomposition with simulated subtasks
    Simulate {
        /// Decomposition file (.json or .toml)
        file: PathBuf,

        /// Maximum subtasks running at once
        #[arg(long, short = 'j')]
        max_concurrency: Option<usize>,

        /// abort, skip_dependents or continue
        #[arg(long)]
        failure_mode: Option<FailureMode>,

        /// Make this subtask fail (repeatable)
        #[arg(long = "fail", value_name = "ID")]
        fail: Vec<String>,

        /// Wall-clock milliseconds per estimated minute
        #[arg(long, default_value_t = 10)]
        ms_per_minute: u64,

        /// Per-subtask timeout in milliseconds (0 disables)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Write the resulting statuses to this file
        #[arg(long)]
        save: Option<PathBuf>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    wavefront::log::init_with_debug(cli.debug || config.debug);

    match cli.command {
        Command::Plan { file, dot, json } => run_plan(&config, &file, dot, json),
        Command::Simulate {
            file,
            max_concurrency,
            failure_mode,
            fail,
            ms_per_minute,
            timeout_ms,
            save,
            json,
        } => {
            let mut executor_config = config.executor.clone();
            if let Some(n) = max_concurrency {
                executor_config.max_concurrency = n;
            }
            if let Some(mode) = failure_mode {
                executor_config.failure_mode = mode;
            }
            if let Some(ms) = timeout_ms {
                executor_config.subtask_timeout_ms = ms;
            }
            let mut config = config;
            config.executor = executor_config;

            let result = run_simulate(&config, &file, fail, ms_per_minute, save.as_deref(), json)?;
            if !result.success {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn graph_builder(config: &Config) -> GraphBuilder {
    GraphBuilder::new(Arc::new(DeclaredEffort::new(config.estimator.default_minutes)))
}

fn run_plan(config: &Config, file: &Path, dot: bool, json: bool) -> Result<()> {
    wlog!("Plan command: file={}", file.display());
    let decomposition = TaskDecomposition::load(file)?;
    let resolver = Resolver::with_builder(graph_builder(config), config.executor.failure_mode);

    if json {
        let stats = resolver.statistics(&decomposition);
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let resolution = resolver.resolve(&decomposition);
    if dot {
        println!("{}", resolution.graph.to_dot());
        return Ok(());
    }

    print_plan(&decomposition, &resolution);
    let stats = resolver.statistics(&decomposition);
    println!("  Subtasks:        {}", stats.total_subtasks);
    println!("  Dependencies:    {} ({} critical)", stats.edge_count, stats.critical_edge_count);
    println!("  Roots / leaves:  {} / {}", stats.root_count, stats.leaf_count);
    println!("  Max parallelism: {}", stats.max_parallelism);
    println!("  Estimated time:  {} min", stats.estimated_duration);
    println!();
    Ok(())
}

fn print_plan(decomposition: &TaskDecomposition, resolution: &ResolutionResult) {
    let title = |id: &str| {
        decomposition
            .get(id)
            .map(|s| s.title.clone())
            .unwrap_or_else(|| id.to_string())
    };

    println!();
    println!("Plan: {}", decomposition.description);
    println!("─────────────────────────────────────────────────────────────");

    for cycle in &resolution.cycles {
        let ids: Vec<&str> = cycle.iter().map(|id| id.as_str()).collect();
        println!("  \x1b[31mcycle\x1b[0m  {}", ids.join(" -> "));
    }
    for entry in &resolution.unresolvable {
        println!(
            "  \x1b[31mmissing\x1b[0m  {} depends on unknown {}",
            entry.subtask, entry.missing
        );
    }

    for (level, group) in resolution.parallel_groups.iter().enumerate() {
        println!("  Level {}:", level);
        for id in group {
            let marker = if resolution.critical_path.path.contains(id) {
                "*"
            } else {
                " "
            };
            println!(
                "    {} {:<20} {:>4} min  {}",
                marker,
                id,
                resolution.graph.weight(id.as_str()),
                title(id.as_str())
            );
        }
    }

    if !resolution.critical_path.path.is_empty() {
        let path: Vec<&str> = resolution
            .critical_path
            .path
            .iter()
            .map(|id| id.as_str())
            .collect();
        println!();
        println!(
            "  Critical path ({} min): {}",
            resolution.critical_path.duration,
            path.join(" -> ")
        );
    }
    println!("─────────────────────────────────────────────────────────────");
}

fn run_simulate(
    config: &Config,
    file: &Path,
    fail: Vec<String>,
    ms_per_minute: u64,
    save: Option<&Path>,
    json: bool,
) -> Result<ParallelExecutionResult> {
    wlog!(
        "Simulate command: file={}, fail={:?}, ms_per_minute={}",
        file.display(),
        fail,
        ms_per_minute
    );
    let mut decomposition = TaskDecomposition::load(file)?;
    let builder = graph_builder(config);
    let work = Arc::new(
        SimulatedExecutor::new(ms_per_minute)
            .with_failures(fail)
            .with_estimator(builder.estimator().clone()),
    );
    let executor = ParallelExecutor::with_builder(config.executor.clone(), builder)?;

    let progress = (!json).then(|| executor.subscribe(|progress| println!("  {}", progress)));

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(executor.execute(&mut decomposition, work))?;

    if let Some(subscription) = progress {
        subscription.unsubscribe();
    }
    if let Some(path) = save {
        decomposition.save(path)?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&decomposition, &result);
    }
    Ok(result)
}

fn print_result(decomposition: &TaskDecomposition, result: &ParallelExecutionResult) {
    println!();
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                      Run Complete                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();

    for subtask in decomposition.subtasks() {
        let status = match &subtask.status {
            SubtaskStatus::Completed => "\x1b[32mcompleted\x1b[0m".to_string(),
            SubtaskStatus::Failed { .. } => "\x1b[31mfailed\x1b[0m".to_string(),
            SubtaskStatus::Skipped { .. } => "\x1b[33mskipped\x1b[0m".to_string(),
            SubtaskStatus::Blocked { .. } => "\x1b[33mblocked\x1b[0m".to_string(),
            other => other.to_string(),
        };
        let detail = result
            .result(subtask.id.as_str())
            .and_then(|r| r.error.as_deref().or(r.output.as_deref()))
            .unwrap_or("");
        println!("  {:<20} {:<20} {}", subtask.id, status, detail);
    }

    println!();
    println!("  Run:       {}", result.run_id);
    println!("  Duration:  {}ms", result.duration_ms);
    if result.stalled {
        println!("  Stalled:   {} subtask(s) blocked", result.blocked.len());
    }
    if result.aborted {
        println!("  Aborted after first failure");
    }
    println!(
        "  Result:    {}",
        if result.success { "success" } else { "failed" }
    );
    println!();
}
