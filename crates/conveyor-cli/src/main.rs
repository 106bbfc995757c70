//! CLI binary for running, resuming and inspecting Conveyor pipelines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use conveyor_exec::{default_registry, DefaultProvisioner, EnvSecretResolver};
use conveyor_pipeline::{
    EngineConfig, EventEmitter, FsArtifactStore, FsRunStore, PipelineDefinition, PipelineEvent,
    PipelineExecutor, PipelineGraph, RetentionPolicy, RunContext, RunResult, RunStateStore,
};
use conveyor_types::duration_serde::{format_duration, parse_duration};
use conveyor_types::{ConveyorError, Run, RunId, RunStatus, StageResult, StageStatus};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

const EXIT_SUCCEEDED: u8 = 0;
const EXIT_BUILD_FAILURE: u8 = 1;
const EXIT_INFRASTRUCTURE: u8 = 2;
const EXIT_INVALID_PIPELINE: u8 = 3;
const EXIT_ABORTED: u8 = 4;

#[derive(Parser)]
#[command(name = "conveyor", version, about = "Stage-based build pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine config file (JSON). Defaults to ./conveyor.json when present.
    #[arg(long, global = true, env = "CONVEYOR_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum number of stages running at once
    #[arg(long, global = true, env = "CONVEYOR_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Directory holding run records
    #[arg(long, global = true, env = "CONVEYOR_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Directory holding the artifact store
    #[arg(long, global = true, env = "CONVEYOR_ARTIFACT_DIR")]
    artifact_dir: Option<PathBuf>,

    /// Directory under which stage workspaces are created
    #[arg(long, global = true, env = "CONVEYOR_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Container CLI used for stages that name an image (docker, podman)
    #[arg(long, global = true, env = "CONVEYOR_CONTAINER_RUNTIME")]
    container_runtime: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline definition (.json, .yaml or .yml)
    Run {
        /// Path to the pipeline definition
        pipeline: PathBuf,

        /// Extra template variable, NAME=VALUE. Repeatable.
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },

    /// Show the stored state of a run
    Status {
        run_id: RunId,

        /// Print the full record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Ask a running run to stop. Takes effect at its next step boundary.
    Cancel { run_id: RunId },

    /// Continue an interrupted run from its persisted state
    Resume {
        run_id: RunId,

        /// Extra template variable, NAME=VALUE. Repeatable.
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },

    /// Check a definition and print its stage order
    Validate {
        /// Path to the pipeline definition
        pipeline: PathBuf,
    },

    /// List stored runs
    List {
        /// Only runs that have not reached a terminal status
        #[arg(long)]
        incomplete: bool,
    },

    /// Delete old terminal runs and their artifacts
    Prune {
        /// Keep this many of the newest terminal runs
        #[arg(long)]
        keep_last: Option<usize>,

        /// Drop terminal runs finished longer ago than this (e.g. 30d)
        #[arg(long, value_parser = parse_duration)]
        max_age: Option<Duration>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag
    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code_for_error(&e))
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<u8> {
    let config = load_config(&cli).await?;
    match cli.command {
        Commands::Run { pipeline, vars } => cmd_run(config, &pipeline, vars).await,
        Commands::Resume { run_id, vars } => cmd_resume(config, run_id, vars).await,
        Commands::Status { run_id, json } => cmd_status(&config, run_id, json).await,
        Commands::Cancel { run_id } => cmd_cancel(&config, run_id).await,
        Commands::Validate { pipeline } => cmd_validate(&pipeline).await,
        Commands::List { incomplete } => cmd_list(&config, incomplete).await,
        Commands::Prune { keep_last, max_age } => cmd_prune(&config, keep_last, max_age).await,
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

async fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_path(path).await?,
        None => {
            let default = Path::new("conveyor.json");
            if default.exists() {
                EngineConfig::from_path(default).await?
            } else {
                EngineConfig::default()
            }
        }
    };

    if let Some(limit) = cli.concurrency {
        config.concurrency_limit = limit;
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(dir) = &cli.artifact_dir {
        config.artifact_dir = dir.clone();
    }
    if let Some(dir) = &cli.workspace_root {
        config.workspace_root = dir.clone();
    }
    if let Some(runtime) = &cli.container_runtime {
        config.container_runtime = runtime.clone();
    }
    config.validate()?;
    Ok(config)
}

fn build_executor(config: EngineConfig) -> PipelineExecutor {
    let provisioner = DefaultProvisioner::new(&config.workspace_root, config.container_runtime.as_str());
    let artifacts = FsArtifactStore::new(&config.artifact_dir);
    let store = FsRunStore::new(&config.state_dir);
    PipelineExecutor::new(
        config,
        Arc::new(provisioner),
        default_registry(),
        Arc::new(EnvSecretResolver::new()),
        Arc::new(artifacts),
        Arc::new(store),
    )
}

async fn load_graph(path: &Path) -> anyhow::Result<PipelineGraph> {
    let definition = PipelineDefinition::from_path(path).await?;
    Ok(PipelineGraph::build(definition)?)
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

fn exit_code_for_error(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<ConveyorError>() {
        Some(e) if e.is_validation() => EXIT_INVALID_PIPELINE,
        _ => EXIT_INFRASTRUCTURE,
    }
}

fn exit_code_for_run(result: &RunResult) -> u8 {
    match result.status() {
        RunStatus::Succeeded => EXIT_SUCCEEDED,
        RunStatus::Aborted => EXIT_ABORTED,
        _ if result.is_infrastructure_failure() => EXIT_INFRASTRUCTURE,
        _ => EXIT_BUILD_FAILURE,
    }
}

// ---------------------------------------------------------------------------
// run / resume
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: EngineConfig,
    path: &Path,
    vars: Vec<(String, String)>,
) -> anyhow::Result<u8> {
    let graph = load_graph(path).await?;
    let executor = build_executor(config);
    let run = executor.create_run(&graph).await?;

    println!("Running pipeline: {} (run #{})", graph.name(), run.id);
    execute_and_report(executor, &graph, run, vars).await
}

async fn cmd_resume(
    config: EngineConfig,
    run_id: RunId,
    vars: Vec<(String, String)>,
) -> anyhow::Result<u8> {
    let executor = build_executor(config);
    let (graph, run) = executor.prepare_resume(run_id).await?;

    let done = run.stages.iter().filter(|s| s.status.is_terminal()).count();
    println!(
        "Resuming pipeline: {} (run #{}, {}/{} stages already finished)",
        graph.name(),
        run.id,
        done,
        run.stages.len()
    );
    execute_and_report(executor, &graph, run, vars).await
}

async fn execute_and_report(
    executor: PipelineExecutor,
    graph: &PipelineGraph,
    run: Run,
    vars: Vec<(String, String)>,
) -> anyhow::Result<u8> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received, cancelling run (hooks still run)");
            on_interrupt.cancel();
        }
    });

    let printer = spawn_progress_printer(executor.events());
    let ctx = RunContext::new(run)
        .with_cancel(cancel)
        .with_variables(vars.into_iter().collect::<HashMap<_, _>>());
    let result = executor.execute(graph, ctx).await;

    // the printer stops once the last sender is gone
    drop(executor);
    let _ = printer.await;

    let result = result?;
    print_summary(&result);
    Ok(exit_code_for_run(&result))
}

fn spawn_progress_printer(events: &EventEmitter) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "progress output fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::StageStarted { stage, attempt, .. } if *attempt > 1 => {
            println!("[{}] started (attempt {})", stage, attempt)
        }
        PipelineEvent::StageStarted { stage, .. } => println!("[{}] started", stage),
        PipelineEvent::StepCompleted {
            stage,
            step,
            exit_code,
            duration_ms,
            ..
        } => println!(
            "[{}]   {} exited {} ({})",
            stage,
            step,
            exit_code,
            format_duration(Duration::from_millis(*duration_ms))
        ),
        PipelineEvent::StepSkipped {
            stage,
            step,
            idempotency_key,
            ..
        } => println!("[{}]   {} skipped, already done ({})", stage, step, idempotency_key),
        PipelineEvent::StageCompleted {
            stage,
            status,
            duration_ms,
            ..
        } => println!(
            "[{}] {} in {}",
            stage,
            status,
            format_duration(Duration::from_millis(*duration_ms))
        ),
        PipelineEvent::StageSkipped { stage, reason, .. } => {
            println!("[{}] skipped: {}", stage, reason)
        }
        PipelineEvent::HookFailed {
            stage, hook, error, ..
        } => println!(
            "[{}] hook '{}' failed: {}",
            stage.as_deref().unwrap_or("pipeline"),
            hook,
            error
        ),
        PipelineEvent::EnvironmentRetrying {
            stage,
            attempt,
            delay_ms,
            error,
            ..
        } => println!(
            "[{}] environment not ready ({}), retry {} in {}ms",
            stage, error, attempt, delay_ms
        ),
        PipelineEvent::CancellationRequested { run_id } => {
            println!("Run #{} cancelling, waiting for running stages", run_id)
        }
        PipelineEvent::RunStarted { .. } | PipelineEvent::RunCompleted { .. } => {}
    }
}

fn print_summary(result: &RunResult) {
    let run = &result.run;
    let elapsed = match (run.started_at, run.finished_at) {
        (Some(start), Some(end)) => (end - start).to_std().ok().map(format_duration),
        _ => None,
    };
    println!();
    match elapsed {
        Some(elapsed) => println!("Run #{} {} in {}", run.id, run.status, elapsed),
        None => println!("Run #{} {}", run.id, run.status),
    }

    for failure in &run.hook_failures {
        println!("  pipeline hook: {}", failure);
    }

    if let Some(stage) = result.first_failure() {
        if let Some(error) = &stage.error {
            println!("First failure: stage '{}' ({}): {}", stage.name, error.kind, error.message);
        }
        if !stage.output_tail.trim().is_empty() {
            println!("--- output tail ---");
            println!("{}", stage.output_tail.trim_end());
            println!("-------------------");
        }
    }
}

// ---------------------------------------------------------------------------
// Inspection commands
// ---------------------------------------------------------------------------

async fn cmd_status(config: &EngineConfig, run_id: RunId, json: bool) -> anyhow::Result<u8> {
    let store = FsRunStore::new(&config.state_dir);
    let run = store.load(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(EXIT_SUCCEEDED);
    }

    println!("Run #{}: {}", run.id, run.pipeline);
    println!("Status: {}", run.status);
    if let Some(started) = run.started_at {
        println!("Started: {}", started.to_rfc3339());
    }
    if let Some(finished) = run.finished_at {
        println!("Finished: {}", finished.to_rfc3339());
    }

    println!("\nStages:");
    for stage in &run.stages {
        println!("  {:<24} {:<10} {}", stage.name, stage.status.as_str(), stage_detail(stage));
    }
    if !run.artifacts.is_empty() {
        println!("\nArtifacts:");
        for (name, artifact) in &run.artifacts {
            println!("  {:<24} {} ({} bytes)", name, artifact.key, artifact.size);
        }
    }
    for failure in &run.hook_failures {
        println!("Pipeline hook failed: {}", failure);
    }
    Ok(EXIT_SUCCEEDED)
}

fn stage_detail(stage: &StageResult) -> String {
    match stage.status {
        StageStatus::Skipped => stage
            .skip_reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_default(),
        StageStatus::Failed => stage
            .error
            .as_ref()
            .map(|e| format!("{}: {}", e.kind, e.message))
            .unwrap_or_default(),
        StageStatus::Running | StageStatus::Succeeded if stage.attempt > 1 => {
            format!("attempt {}", stage.attempt)
        }
        _ => String::new(),
    }
}

async fn cmd_cancel(config: &EngineConfig, run_id: RunId) -> anyhow::Result<u8> {
    let store = FsRunStore::new(&config.state_dir);
    let run = store.load(run_id).await?;
    if run.is_terminal() {
        anyhow::bail!("run #{} already finished ({})", run_id, run.status);
    }
    store.request_cancel(run_id).await?;
    println!("Cancellation requested for run #{}", run_id);
    Ok(EXIT_SUCCEEDED)
}

async fn cmd_validate(path: &Path) -> anyhow::Result<u8> {
    let graph = load_graph(path).await?;
    graph.check_executors(&default_registry())?;

    println!("Pipeline '{}' is valid", graph.name());
    println!("Order: {}", graph.topological_order().join(" -> "));
    println!("\nLevels:");
    for (i, level) in graph.levels().iter().enumerate() {
        println!("  {}: {}", i, level.join(", "));
    }
    Ok(EXIT_SUCCEEDED)
}

async fn cmd_list(config: &EngineConfig, incomplete: bool) -> anyhow::Result<u8> {
    let store = FsRunStore::new(&config.state_dir);
    let mut runs = if incomplete {
        store.list_incomplete().await?
    } else {
        store.list().await?
    };
    runs.sort_by_key(|r| r.id);

    if runs.is_empty() {
        println!("No runs");
        return Ok(EXIT_SUCCEEDED);
    }
    for run in &runs {
        let started = run
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into());
        println!("#{:<6} {:<24} {:<10} {}", run.id.0, run.pipeline, run.status.as_str(), started);
    }
    Ok(EXIT_SUCCEEDED)
}

async fn cmd_prune(
    config: &EngineConfig,
    keep_last: Option<usize>,
    max_age: Option<Duration>,
) -> anyhow::Result<u8> {
    let policy = RetentionPolicy {
        keep_last: keep_last.or(config.retention.keep_last),
        max_age: max_age.or(config.retention.max_age),
    };
    if policy.keep_last.is_none() && policy.max_age.is_none() {
        println!("No retention policy configured, nothing to prune");
        return Ok(EXIT_SUCCEEDED);
    }

    let store = FsRunStore::new(&config.state_dir);
    let artifacts = FsArtifactStore::new(&config.artifact_dir);
    let pruned = conveyor_pipeline::prune(&store, &artifacts, &policy, chrono::Utc::now()).await?;
    println!("Pruned {} run(s)", pruned.len());
    for id in pruned {
        println!("  #{}", id);
    }
    Ok(EXIT_SUCCEEDED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_splits_on_first_equals() {
        assert_eq!(
            parse_var("image=registry/app:1.0=x").unwrap(),
            ("image".to_string(), "registry/app:1.0=x".to_string())
        );
        assert_eq!(parse_var("EMPTY=").unwrap(), ("EMPTY".to_string(), String::new()));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=value").is_err());
    }

    #[test]
    fn validation_errors_map_to_invalid_pipeline() {
        let cycle = anyhow::Error::new(ConveyorError::CyclicDependency {
            cycle: vec!["A".into(), "B".into(), "A".into()],
        });
        assert_eq!(exit_code_for_error(&cycle), EXIT_INVALID_PIPELINE);

        let io = anyhow::Error::new(ConveyorError::Persistence("disk full".into()));
        assert_eq!(exit_code_for_error(&io), EXIT_INFRASTRUCTURE);
    }

    #[test]
    fn cli_parses_run_with_vars() {
        let cli = Cli::try_parse_from([
            "conveyor", "--concurrency", "2", "run", "ci.yaml", "--var", "branch=main",
        ])
        .unwrap();
        assert_eq!(cli.concurrency, Some(2));
        match cli.command {
            Commands::Run { pipeline, vars } => {
                assert_eq!(pipeline, PathBuf::from("ci.yaml"));
                assert_eq!(vars, vec![("branch".to_string(), "main".to_string())]);
            }
            _ => panic!("expected run"),
        }
    }
}
