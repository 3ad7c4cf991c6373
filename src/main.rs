use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use evolution_suite::comms::{Observer, ObserverEvent, ReconnectPolicy};
use evolution_suite::{AgentManager, BulkAction, Config, Event, EventBus, GuidanceChannel, Orchestrator, RunOptions, StateWatcher};

/// Run agent evolution cycles on a project
#[derive(Parser)]
#[command(name = "evolution-suite")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cycle loop until it finishes or Ctrl-C
    Run {
        /// Project root
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Stop after this many cycles
        #[arg(long)]
        max_cycles: Option<u64>,

        /// Build the coordinator prompt without launching agents
        #[arg(long)]
        dry_run: bool,
    },
    /// Queue guidance for an agent
    Guide {
        agent_id: String,
        content: String,

        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Run {
            project,
            max_cycles,
            dry_run,
        } => run(project, RunOptions { max_cycles, dry_run }).await,
        Commands::Guide {
            agent_id,
            content,
            project,
        } => guide(project, &agent_id, &content).await,
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn run(project: PathBuf, options: RunOptions) -> Result<()> {
    let config = Arc::new(Config::load(&project)?);
    let events = EventBus::new(config.events.capacity, config.heartbeat_interval());
    let manager = Arc::new(AgentManager::new(config.clone(), events.clone()).context("Failed to set up agent pool")?);
    let orchestrator = Arc::new(Orchestrator::new(manager));

    let shutdown = CancellationToken::new();
    let watcher = StateWatcher::from_config(&config, events.clone()).spawn(shutdown.clone());
    let mut observer = Observer::connect(events, ReconnectPolicy::default());
    let observer_close = observer.close_handle();
    let logger = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            while let Some(event) = observer.recv().await {
                match event {
                    ObserverEvent::Event(envelope) => log_event(&envelope.event),
                    ObserverEvent::Resync => {
                        let status = orchestrator.get_status();
                        info!(cycle = status.cycle, phase = %status.phase, "Event stream resynchronized");
                    }
                }
            }
        })
    };

    info!(project = %config.project_root.display(), "Starting evolution run");
    orchestrator.start(options);
    tokio::select! {
        _ = orchestrator.wait_stopped() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            warn!("Interrupted, stopping agents");
            orchestrator.stop();
            let outcome = orchestrator.agents().stop_all().await;
            if !outcome.is_success() {
                warn!(result = %outcome.message(&BulkAction::Stop), "Some agents did not stop cleanly");
            }
            orchestrator.force_stop().await;
        }
    }

    shutdown.cancel();
    observer_close.close();
    let _ = watcher.await;
    let _ = logger.await;

    let page = orchestrator.list_cycles(usize::MAX, 0);
    let passed = page.cycles.iter().filter(|c| c.success).count();
    let usage = orchestrator.agents().usage().total();
    info!(
        cycles = page.total,
        passed,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        cost_usd = usage.cost_usd,
        "Run finished"
    );
    Ok(())
}

async fn guide(project: PathBuf, agent_id: &str, content: &str) -> Result<()> {
    let config = Config::load(&project)?;
    let channel = GuidanceChannel::from_config(&config)?;
    let entry = channel.append(agent_id, content, "cli").await?;
    info!(agent_id, timestamp = %entry.timestamp, "Guidance queued");
    Ok(())
}

fn log_event(event: &Event) {
    match event {
        Event::CycleStarted { cycle } => info!(cycle, "Cycle started"),
        Event::PhaseChanged { phase } => info!(phase = %phase, "Phase"),
        Event::CycleCompleted { cycle, result } => {
            info!(cycle, task_type = %result.task_type, description = %result.description, "Cycle passed")
        }
        Event::CycleFailed { cycle, result } => warn!(
            cycle,
            error = result.error.as_deref().unwrap_or_default(),
            "Cycle failed"
        ),
        Event::AgentStatus {
            agent_id,
            status,
            error,
        } => info!(agent_id = %agent_id, status = %status, error = ?error, "Agent status"),
        Event::AgentOutput { agent_id, line } => debug!(agent_id = %agent_id, "{}", line.content),
        Event::StateFileChanged { path } => info!(path = %path.display(), "State file changed"),
        Event::Error { message } => warn!(%message, "Error event"),
        other => debug!(event = ?other, "Event"),
    }
}
