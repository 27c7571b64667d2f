//! `agent-orchestrator` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check a workflow JSON file and print its execution batches.
//! - `run`: execute a workflow in-process on a pool of generic agents.
//! - `migrate`: run pending database migrations.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use db::{PoolOptions, Repository};
use engine::{AgentSpec, DependencyGraph, ExecutionStatus, Orchestrator, OrchestratorConfig, Workflow};
use handlers::HandlerRegistry;

#[derive(Parser)]
#[command(
    name = "agent-orchestrator",
    about = "Multi-agent task orchestration engine",
    version
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Execute a workflow with the built-in handlers and print the result.
    Run {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Number of generic agents to start.
        #[arg(long, default_value_t = 2)]
        agents: usize,
        /// Capabilities given to every agent.
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Persist state to Postgres instead of memory.
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Validate { path } => validate(&path),
        Command::Run {
            path,
            agents,
            capabilities,
            config,
            database_url,
        } => run(&path, agents, capabilities, config, database_url).await,
        Command::Migrate { database_url } => {
            info!("Running migrations");
            let options = PoolOptions {
                max_connections: 2,
                ..PoolOptions::default()
            };
            let pool = db::pool::connect(&database_url, &options)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("Migrations applied successfully");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid workflow JSON in {}", path.display()))
}

fn validate(path: &Path) -> anyhow::Result<ExitCode> {
    let workflow = load_workflow(path)?;
    let plan = DependencyGraph::from_workflow(&workflow).and_then(|graph| {
        let stats = graph.stats();
        graph.plan().map(|plan| (plan, stats))
    });

    match plan {
        Ok((plan, stats)) => {
            println!(
                "Workflow '{}' is valid: {} node(s), {} edge(s), {} batch(es)",
                workflow.name, stats.nodes, stats.edges, stats.depth
            );
            for (i, batch) in plan.batches.iter().enumerate() {
                println!("  batch {}: {}", i + 1, batch.join(", "));
            }
            for orphan in &plan.orphans {
                println!("  warning: node '{orphan}' is not reachable from a start node");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Validation failed: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(
    path: &Path,
    agents: usize,
    capabilities: Vec<String>,
    config: Option<PathBuf>,
    database_url: Option<String>,
) -> anyhow::Result<ExitCode> {
    let workflow = load_workflow(path)?;
    let config = match config {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => OrchestratorConfig::default(),
    };

    let registry = HandlerRegistry::new();
    handlers::builtin::register_builtins(&registry)?;

    let mut builder = Orchestrator::builder(config).handlers(Arc::new(registry));
    if let Some(url) = database_url {
        let repository = db::pool::open_repository(&url, &PoolOptions::default())
            .await
            .context("failed to open the Postgres repository")?;
        builder = builder.repository(Arc::new(repository) as Arc<dyn Repository>);
    }
    let orchestrator = builder.build()?;

    let report = orchestrator.recover().await;
    if report.interrupted_executions > 0 {
        warn!("{} execution(s) were interrupted by an earlier shutdown", report.interrupted_executions);
    }

    for i in 0..agents {
        let spec = AgentSpec::new(format!("agent-{}", i + 1), "generic")
            .with_capabilities(capabilities.iter().cloned());
        let agent = orchestrator.runtime().create_agent(spec).await?;
        orchestrator.runtime().start(agent.id).await?;
    }
    orchestrator.start();

    let outcome = match orchestrator.engine().execute(workflow).await {
        Ok(handle) => Ok(handle.wait().await),
        Err(e) => Err(e),
    };
    orchestrator.shutdown().await;
    let execution = outcome?;

    println!("{}", serde_json::to_string_pretty(&execution)?);
    let summary = execution.summary();
    info!(
        "execution {} {}: {} succeeded, {} failed, {} cancelled, {} skipped; {} retries, {}ms elapsed",
        summary.execution_id,
        summary.status,
        summary.succeeded,
        summary.failed,
        summary.cancelled,
        summary.skipped,
        summary.total_retries,
        summary.elapsed_ms.unwrap_or_default()
    );

    Ok(if execution.status == ExecutionStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
