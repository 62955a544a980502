use anyhow::Result;
use clap::Parser;
use conductor_core::{
    api::ApiServer,
    audit::AuditLog,
    config::Config,
    dispatch::Dispatcher,
    orchestrator::Orchestrator,
    planner::Planner,
    policy::{PolicyConfig, PolicyEngine},
    queue::JobQueue,
    registry::AgentRegistry,
    store::{FileJobStore, JobStore},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Interval between roster-file reload checks.
const ROSTER_RELOAD_SECS: u64 = 30;

#[derive(Parser, Debug)]
#[command(name = "conductor-core", about = "Agent orchestration engine", version)]
struct Args {
    /// Override the bind host (CONDUCTOR_HOST)
    #[arg(long)]
    host: Option<String>,
    /// Override the bind port (CONDUCTOR_PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Override the data directory (CONDUCTOR_DATA_DIR)
    #[arg(long)]
    data_dir: Option<String>,
    /// Override the agent roster path (CONDUCTOR_ROSTER_PATH)
    #[arg(long)]
    roster: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = Config::load()?;
    if let Some(host) = args.host {
        config.api.host = host;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.store.data_dir = data_dir;
    }
    if let Some(roster) = args.roster {
        config.store.roster_path = roster;
    }

    info!("Starting Conductor Core");

    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(&config.store.data_dir).await?);
    let registry = Arc::new(AgentRegistry::with_roster(&config.store.roster_path).await?);
    let audit = AuditLog::open(store.clone(), &config.store.data_dir).await?;
    let policy = Arc::new(PolicyEngine::new(PolicyConfig::default()));
    let queue = JobQueue::new();

    let dispatcher = Dispatcher::new(store.clone(), registry.clone(), policy, audit.clone());
    let orchestrator = Orchestrator::new(
        store.clone(),
        queue,
        dispatcher,
        audit,
        config.dispatch.clone(),
    );
    let planner = Arc::new(Planner::new(registry.clone(), config.planner.clone())?);
    let roster_path = config.store.roster_path.clone();
    let api_server = ApiServer::new(config, orchestrator.clone(), planner, registry.clone());

    // Roster hot reload: pick up edits to agents.yaml without a restart.
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(ROSTER_RELOAD_SECS)).await;
                if !tokio::fs::try_exists(&roster_path).await.unwrap_or(false) {
                    continue;
                }
                if let Err(e) = registry.reload_roster().await {
                    warn!("Roster reload failed: {}", e);
                }
            }
        });
    }

    tokio::select! {
        result = orchestrator.run() => {
            if let Err(e) = result {
                error!("Orchestrator failed: {}", e);
            }
        }
        result = api_server.run() => {
            if let Err(e) = result {
                error!("Intake API failed: {}", e);
            }
        }
    }

    Ok(())
}
