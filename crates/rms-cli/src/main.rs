use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rms_agents::{AgentSet, TaskRequest};
use rms_core::{
    Event, EventBus, EventKind, EventPayload, IssueDraft, IssueStore, MemoryIssueStore,
    StoreError, Subscription, system_clock,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

#[derive(Parser)]
#[command(name = "rms")]
#[command(version)]
#[command(about = "RMS — event-driven agents for issue tracking")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent set, reading events from stdin and writing results to stdout
    Start,

    /// Initialize config directory and default config
    Init,

    /// Show the effective configuration
    Config,
}

/// One line of input on stdin
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inbound {
    /// `{"coordinate": {"task_type": "...", "payload": ...}}`
    Coordinate { coordinate: TaskRequest },
    /// `{"payload": {"kind": "...", "data": {...}}, "correlation_id": "..."}`
    Event {
        payload: EventPayload,
        #[serde(default)]
        correlation_id: Option<String>,
    },
}

/// Source name stamped on events read from stdin
const INPUT_SOURCE: &str = "cli";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the event stream
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Start => cmd_start(&cli.config).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config)
            .await
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        info!("Created default config at {}", config_path.display());
    }

    println!("RMS initialized at {}", config_dir.display());
    println!("Edit {} to tune SLAs and classifier rules.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = config::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = config::load(config_path)?;
    info!("Starting RMS agents...");

    let clock = system_clock();
    let bus = EventBus::with_clock(clock.clone());
    let store = Arc::new(MemoryIssueStore::new(clock.clone()));
    let agents = AgentSet::start(bus.clone(), cfg, clock, Some(store.clone()))
        .await
        .context("Failed to start agents")?;

    let outputs = forward_to_stdout(&bus);
    info!("Agents running; reading events from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Err(e) = handle_line(&agents, store.as_ref(), &line).await {
                            warn!("Skipping input line: {:#}", e);
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed, shutting down...");
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        }
    }

    agents.shutdown();
    bus.flush().await;
    for subscription in outputs {
        subscription.unsubscribe();
    }

    info!(
        "Processed {} events; {} notifications, {} patterns",
        agents.orchestrator().observed_count(),
        agents.notifications().len(),
        agents.learner().get_patterns(0.0).len()
    );
    Ok(())
}

/// Print every outward-facing event as one JSON line
fn forward_to_stdout(bus: &EventBus) -> Vec<Subscription> {
    [EventKind::AgentResult, EventKind::AgentTask, EventKind::AgentError]
        .into_iter()
        .map(|kind| {
            bus.subscribe(kind, |event: &Event| {
                let line = serde_json::to_string(event)?;
                println!("{}", line);
                Ok(())
            })
        })
        .collect()
}

async fn handle_line(agents: &AgentSet, store: &dyn IssueStore, line: &str) -> Result<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }

    let inbound: Inbound = serde_json::from_str(line).context("Invalid input line")?;
    match inbound {
        Inbound::Coordinate { coordinate } => {
            let task_id = agents.orchestrator().coordinate_task(coordinate);
            info!("Coordinating task {}", task_id);
        }
        Inbound::Event {
            payload,
            correlation_id,
        } => {
            if let EventPayload::IssueCreated(issue) = &payload {
                register_issue(store, issue).await?;
            }
            debug!("Publishing {} from stdin", payload.kind());
            agents.bus().publish(payload, INPUT_SOURCE, correlation_id);
        }
    }
    Ok(())
}

/// Store a new issue so the classifier can write its decision back
async fn register_issue(store: &dyn IssueStore, issue: &rms_core::IssueCreated) -> Result<()> {
    let draft = IssueDraft {
        id: issue.id.clone(),
        title: issue.title.clone(),
        description: issue.description.clone(),
        priority: issue.priority.unwrap_or_default(),
    };
    match store.create(draft).await {
        Ok(record) => {
            debug!("Registered {} (v{})", record.id, record.version);
            Ok(())
        }
        Err(StoreError::AlreadyExists(id)) => {
            warn!("Issue {} already registered, publishing anyway", id);
            Ok(())
        }
        Err(e) => Err(e).context("Failed to register issue"),
    }
}
