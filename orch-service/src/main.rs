//! Orchestrator command-line service
//!
//! Runs workflows and parallel batches over the built-in workers and prints
//! the outcome as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use orch_core::{ExecutionContext, OrchestratorConfig};
use orch_engine::{AgentSpec, JsonLinesRecorder, Orchestrator, WorkflowCatalog};

mod workers;

#[derive(Parser, Debug)]
#[command(name = "orchestrator")]
#[command(about = "Run agent workflows and parallel batches")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Workflow catalog (YAML); the built-in catalog is used when omitted
    #[arg(short, long, global = true)]
    catalog: Option<PathBuf>,

    /// Append task and workflow outcomes to this JSON-lines file
    #[arg(long, global = true)]
    record: Option<PathBuf>,

    /// Per-task deadline in seconds (overrides ORCH_TASK_TIMEOUT_SECS)
    #[arg(long, global = true)]
    task_timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a named workflow
    Run {
        workflow: String,

        /// Initial payload as JSON
        #[arg(short, long, default_value = "{}")]
        input: String,
    },
    /// Run workers concurrently, each with the same input
    Parallel {
        #[arg(required = true)]
        workers: Vec<String>,

        /// Payload as JSON
        #[arg(short, long, default_value = "{}")]
        input: String,
    },
    /// List built-in workers
    Workers,
    /// List workflows in the catalog
    Workflows,
}

fn parse_input(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--input is not valid JSON: {}", raw))
}

async fn load_catalog(path: Option<&PathBuf>) -> Result<WorkflowCatalog> {
    let catalog = match path {
        Some(path) => WorkflowCatalog::load(path)
            .await
            .with_context(|| format!("Failed to load catalog {}", path.display()))?,
        None => WorkflowCatalog::from_yaml_str(workers::BUILTIN_CATALOG)?,
    };
    Ok(catalog)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from /etc/orch/environment (if exists)
    orch_core::config::load_environment();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("orchestrator=info".parse()?)
                .add_directive("orch_engine=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = OrchestratorConfig::from_env()?;
    if let Some(secs) = args.task_timeout {
        config = config.with_task_timeout(Duration::from_secs(secs));
    }

    let workers = workers::builtin_workers()?;
    let catalog = load_catalog(args.catalog.as_ref()).await?;

    match args.command {
        Commands::Workers => return print_json(&workers.list()),
        Commands::Workflows => return print_json(&catalog.iter().collect::<Vec<_>>()),
        Commands::Run { .. } | Commands::Parallel { .. } => {}
    }

    let mut builder = Orchestrator::builder()
        .config(config)
        .workers(workers)
        .catalog(catalog);
    if let Some(path) = &args.record {
        info!(path = %path.display(), "Recording outcomes");
        builder = builder.recorder(Arc::new(JsonLinesRecorder::new(path)));
    }
    let orchestrator = builder.build()?;

    let succeeded = match args.command {
        Commands::Run { workflow, input } => {
            let context = ExecutionContext::new(parse_input(&input)?);
            let outcome = orchestrator.run_workflow(&workflow, context).await?;
            print_json(&outcome)?;
            outcome.success
        }
        Commands::Parallel { workers, input } => {
            let payload = parse_input(&input)?;
            let context = ExecutionContext::new(payload);
            let specs = workers
                .iter()
                .map(|name| AgentSpec::new(name, context.clone()).with_parent(&context.workflow_id))
                .collect();
            let outcomes = orchestrator.run_parallel(specs).await?;
            print_json(&outcomes)?;
            outcomes.iter().all(|o| o.succeeded())
        }
        Commands::Workers | Commands::Workflows => true,
    };

    orchestrator.shutdown().await;

    if !succeeded {
        warn!("One or more tasks failed");
        std::process::exit(1);
    }
    Ok(())
}
