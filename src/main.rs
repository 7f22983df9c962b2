mod actions;
mod agent;
mod config;
mod db;
mod errors;
mod logging;
mod mcp;
mod paths;
mod server;
mod services;
mod supervisor;
mod timeline;
mod ws;

use crate::actions::ActionOrchestrator;
use crate::agent::{AgentSession, JsonLinesAdapter, ToolShim};
use crate::config::ConfigStore;
use crate::db::Db;
use crate::mcp::McpClient;
use crate::server::ServerState;
use crate::services::{ArtifactService, ContextService, PlanService, ProjectService, TaskService};
use crate::supervisor::{AdapterLock, Supervisor};
use crate::ws::Broker;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "gamepipe", version)]
#[command(about = "Gamepipe — AI game-dev pipeline gateway", long_about = None)]
struct Cli {
    /// Port for the gateway server
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Log level override (trace|debug|info|warn|error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway server (default)
    Serve,
    /// Show adapter lock and configuration summary
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.cmd, Some(Command::Status)) {
        return print_status();
    }

    let log_dir = logging::setup_tracing(cli.log_level.as_deref());
    if let Err(e) = &log_dir {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = Arc::new(ConfigStore::open(paths::settings_file())?);
    let db = Arc::new(Db::open(paths::database_file())?);
    let broker = Arc::new(Broker::new());
    let supervisor = Arc::new(Supervisor::new(config.clone(), AdapterLock::at_default_path()));
    let mcp = Arc::new(McpClient::from_config(config.clone()));
    let shim = Arc::new(ToolShim::new(
        db.clone(),
        broker.clone(),
        mcp.clone(),
        config.clone(),
    ));
    let session = Arc::new(AgentSession::new(
        db.clone(),
        broker.clone(),
        config.clone(),
        supervisor.clone(),
        shim,
        Arc::new(JsonLinesAdapter),
    ));

    let state = Arc::new(ServerState {
        orchestrator: ActionOrchestrator::new(
            db.clone(),
            broker.clone(),
            mcp.clone(),
            config.clone(),
        ),
        projects: ProjectService::new(db.clone(), config.clone()),
        tasks: TaskService::new(db.clone(), broker.clone()),
        plans: PlanService::new(db.clone(), broker.clone(), config.clone()),
        context: ContextService::new(db.clone(), broker.clone(), config.clone()),
        artifacts: ArtifactService::new(db.clone(), broker.clone(), config.clone()),
        db,
        config,
        broker,
        supervisor: supervisor.clone(),
        session: session.clone(),
    });

    info!("--- Gamepipe Gateway Startup ---");
    info!("Settings: {}", state.config.path().display());
    if let Ok(dir) = &log_dir {
        info!("Log Directory: {}", dir.display());
    }
    info!("Projects Root: {}", state.config.get_all(false).projects.root);
    info!("--------------------------------");

    let server_state = state.clone();
    let serve = tokio::spawn(async move { server::start_server(server_state, cli.port).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down: stopping agent session and supervised processes");
    if let Err(e) = session.stop().await {
        warn!("agent session stop failed: {e}");
    }
    supervisor.stop_all().await;
    serve.abort();
    Ok(())
}

fn print_status() -> Result<()> {
    let lock = AdapterLock::at_default_path();
    let status = lock.status();
    println!("settings: {}", paths::settings_file().display());
    println!("database: {}", paths::database_file().display());
    match (status.running, status.pid) {
        (true, Some(pid)) => println!("mcp adapter: running (pid {pid})"),
        _ => println!("mcp adapter: not running"),
    }
    Ok(())
}
