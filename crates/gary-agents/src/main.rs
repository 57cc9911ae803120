//! Agent orchestrator binary.
//!
//! Two modes:
//!
//! ```bash
//! # Serve the endpoint-management REST API with the auto-sleep sweeper
//! gary-agents serve --bind 127.0.0.1:8080
//!
//! # Drive one goal through the task loop and exit
//! gary-agents run "find the release blockers in the tracker" --model 120b
//! ```
//!
//! Endpoint targets, timeouts, and MCP servers come from the environment;
//! see `gateway::GatewayConfig`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gary_agents::{LoopConfig, TaskRunner, TaskState, TaskStore};
use gateway::api::{self, ApiState};
use gateway::{
    EndpointTracker, EventBus, FallbackRouter, GatewayConfig, HttpEndpointControl,
    HttpInferenceBackend, HttpMcpTransport, LifecycleManager, McpTransport, ModelVariant,
    ToolGateway,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the endpoint-management REST API and run the auto-sleep sweeper
    Serve {
        /// Address to bind the HTTP listener to
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
    /// Run one goal through the task loop and exit
    Run {
        /// The goal to accomplish
        goal: String,

        /// Model variant to start on (`120b` or `20b`)
        #[arg(long, default_value = "120b")]
        model: ModelVariant,

        /// Park at a human checkpoint on escalation instead of failing
        #[arg(long, default_value_t = false)]
        checkpoint: bool,

        /// Write the final task record as JSON to this path
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Serve { bind } => serve(bind).await,
        Command::Run {
            goal,
            model,
            checkpoint,
            output,
        } => run_task(goal, model, checkpoint, output).await,
    }
}

/// Bring up the management surface: resync endpoint statuses, start the
/// auto-sleep sweeper, and serve the REST API until ctrl-c.
async fn serve(bind: String) -> Result<()> {
    let config = GatewayConfig::default();
    let events = EventBus::new().shared();
    let tracker = Arc::new(EndpointTracker::new(&config));
    let control = Arc::new(HttpEndpointControl::new(&config)?);
    let manager = Arc::new(LifecycleManager::new(
        tracker.clone(),
        control,
        events,
        &config,
    ));

    for (id, status) in manager.resync().await {
        info!(endpoint = %id, status = %status, "endpoint status synced");
    }

    let cancel = CancellationToken::new();
    let sweeper = manager.spawn_sweeper(cancel.clone());

    let app = api::router(ApiState { tracker, manager });
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(addr = %bind, "endpoint management API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    cancel.cancel();
    sweeper.await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler failed: {e}");
    }
}

/// Wire the full stack for a one-shot run: resync, connect tool servers,
/// drive the task, report the outcome. Exits nonzero unless the task
/// completes.
async fn run_task(
    goal: String,
    model: ModelVariant,
    checkpoint: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = GatewayConfig::default();
    let events = EventBus::new().shared();
    let tracker = Arc::new(EndpointTracker::new(&config));
    let control = Arc::new(HttpEndpointControl::new(&config)?);
    let manager = Arc::new(LifecycleManager::new(
        tracker.clone(),
        control,
        events.clone(),
        &config,
    ));
    manager.resync().await;

    let backend = Arc::new(HttpInferenceBackend::new(&config)?);
    let router = Arc::new(FallbackRouter::new(
        tracker,
        manager,
        backend,
        events.clone(),
    ));

    let mut transports: Vec<Arc<dyn McpTransport>> = Vec::new();
    for server in &config.mcp_servers {
        match HttpMcpTransport::new(
            server.label.clone(),
            server.url.clone(),
            config.request_timeout,
        ) {
            Ok(transport) => transports.push(Arc::new(transport)),
            Err(e) => warn!(server = %server.label, error = %e, "skipping MCP server"),
        }
    }
    let tools = Arc::new(ToolGateway::connect(transports).await);
    info!(tools = tools.tool_count(), "tool gateway ready");

    let mut loop_config = LoopConfig::default();
    loop_config.checkpoint_enabled |= checkpoint;

    let store = Arc::new(TaskStore::new());
    let runner = TaskRunner::new(loop_config, router, tools, events, store);
    let task = runner.run(goal, model).await?;

    info!(task_id = %task.id, status = %task.status, steps = task.plan.len(), "task finished");
    for step in &task.plan {
        info!(
            index = step.index,
            status = ?step.status,
            attempts = step.attempts,
            tool = step.tool_name.as_deref().unwrap_or("reasoning"),
            "  {}",
            step.description
        );
    }
    if let Some(failure) = &task.failure {
        warn!(tag = %failure.tag, "{}", failure.description);
    }
    if let Some(path) = output {
        task.write_snapshot(&path)?;
        info!(path = %path.display(), "task snapshot written");
    }

    match task.status {
        TaskState::Complete => Ok(()),
        status => anyhow::bail!("task {} ended {status}", task.id),
    }
}
