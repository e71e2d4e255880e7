use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use nightshift::agent::{AgentCoordinator, CommandAgent};
use nightshift::cli::{Cli, Commands, Display, QueueAction};
use nightshift::config::{DecisionBackendKind, OrchestrationConfig, DEFAULT_CONFIG_TOML};
use nightshift::constraint::ConstraintGate;
use nightshift::decision::{CommandBackend, DecisionEngine, GenerativeEngine, HeuristicEngine};
use nightshift::error::{NightshiftError, Result};
use nightshift::orchestrator::Orchestrator;
use nightshift::queue::{TaskFilter, TaskQueue, TaskStatus};
use nightshift::scheduler::{load_status, SchedulerService, STATUS_FILE};

const DEFAULT_CONFIG_FILE: &str = "nightshift.toml";
const QUEUE_DB_FILE: &str = "queue.db";

/// Tasks shown by `status`.
const STATUS_RECENT_TASKS: usize = 5;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ NightshiftError::Validation(_)) => {
            Display::new().print_error(&e.to_string());
            ExitCode::from(2)
        }
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("nightshift=debug")
    } else {
        EnvFilter::new("nightshift=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let display = Display::new();
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    match cli.command {
        Commands::Init => cmd_init(&config_path).await,
        Commands::Start => cmd_start(&config_path).await,
        Commands::Once { force } => cmd_once(&display, &config_path, force).await,
        Commands::Status => cmd_status(&display, &config_path).await,
        Commands::Queue { action } => cmd_queue(&display, &config_path, action).await,
    }
}

async fn cmd_init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        return Err(NightshiftError::Validation(format!(
            "{} already exists; edit it or remove it first",
            config_path.display()
        )));
    }
    tokio::fs::write(config_path, DEFAULT_CONFIG_TOML).await?;
    println!("wrote {}", config_path.display());
    println!("edit workspace_root and the [agents.*] sections, then run `nightshift start`");
    Ok(())
}

async fn cmd_start(config_path: &Path) -> Result<()> {
    let config = OrchestrationConfig::load(config_path).await?;
    let (orchestrator, _queue, _coordinator) = wire(&config)?;

    let service = SchedulerService::new(&config, orchestrator)?;
    service.start()?;
    info!(config = %config_path.display(), "running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("stopping after the current cycle; Ctrl-C again to cancel active sessions");
    tokio::select! {
        _ = service.stop() => {}
        _ = tokio::signal::ctrl_c() => {
            service.stop_force().await;
        }
    }
    Ok(())
}

async fn cmd_once(display: &Display, config_path: &Path, force: bool) -> Result<()> {
    let config = OrchestrationConfig::load(config_path).await?;

    if !force {
        ConstraintGate::new(config.constraints.clone())
            .check_all()
            .await?;
    }

    let (orchestrator, _queue, _coordinator) = wire(&config)?;
    let report = orchestrator.run_cycle().await?;
    display.print_report(&report);
    Ok(())
}

async fn cmd_status(display: &Display, config_path: &Path) -> Result<()> {
    let config = OrchestrationConfig::load(config_path).await?;
    let state_dir = config.state_dir();

    let snapshot = load_status(&state_dir.join(STATUS_FILE))?;
    let queue = TaskQueue::open(state_dir.join(QUEUE_DB_FILE))?;
    let counts = queue.counts().await?;
    display.print_status(snapshot.as_ref(), &counts);

    let mut recent = queue.all(TaskFilter::default()).await?;
    recent.truncate(STATUS_RECENT_TASKS);
    if !recent.is_empty() {
        display.print_header("recent tasks");
        display.print_tasks(&recent);
    }
    Ok(())
}

async fn cmd_queue(display: &Display, config_path: &Path, action: QueueAction) -> Result<()> {
    let config = OrchestrationConfig::load(config_path).await?;
    let queue = TaskQueue::open(config.state_dir().join(QUEUE_DB_FILE))?;

    match action {
        QueueAction::List { status } => {
            let mut filter = TaskFilter::default();
            if let Some(raw) = status {
                let status = TaskStatus::parse(&raw).ok_or_else(|| {
                    NightshiftError::Validation(format!("unknown status \"{}\"", raw))
                })?;
                filter = filter.with_status(status);
            }
            let tasks = queue.all(filter).await?;
            display.print_tasks(&tasks);
        }
        QueueAction::Cleanup { older_than_days } => {
            let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
            let removed = queue.cleanup(cutoff).await?;
            println!("removed {} terminal task(s)", removed);
        }
    }
    Ok(())
}

/// Build the queue, coordinator and orchestrator for a validated config.
fn wire(
    config: &OrchestrationConfig,
) -> Result<(Arc<Orchestrator>, Arc<TaskQueue>, Arc<AgentCoordinator>)> {
    let queue = Arc::new(TaskQueue::open(config.state_dir().join(QUEUE_DB_FILE))?);

    let coordinator = Arc::new(AgentCoordinator::new(
        config.workspace(),
        config.max_concurrent,
    ));
    for (id, agent) in &config.agents {
        coordinator.register(Arc::new(CommandAgent::new(id.clone(), agent.clone())));
    }

    let engine: Arc<dyn DecisionEngine> = match config.decision.backend {
        DecisionBackendKind::Heuristic => Arc::new(HeuristicEngine::new()),
        DecisionBackendKind::Generative => Arc::new(GenerativeEngine::new(Arc::new(
            CommandBackend::new(config.decision.command.clone(), config.decision.timeout_sec),
        ))),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        Arc::clone(&queue),
        Arc::clone(&coordinator),
        engine,
    ));
    Ok((orchestrator, queue, coordinator))
}
