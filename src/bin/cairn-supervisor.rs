//! Recovery/supervision node: runs the deadline, stall, and progress
//! monitors against a shared Postgres store. Safe to run alongside any
//! number of orchestrator processes; everything it does is idempotent.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use cairn::{
    spawn_monitors, EventBus, EventKind, FailureHandler, InProcessEventBus, JobQueue,
    MonitorConfig, OrchestratorConfig, PostgresQueue, PostgresStore, Store,
};

#[derive(Parser, Debug)]
#[command(
    name = "cairn-supervisor",
    about = "Run cairn recovery monitors against a Postgres store"
)]
struct Args {
    /// PostgreSQL connection string
    #[arg(long, env = "CAIRN_DATABASE_URL")]
    database_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let orchestrator_config = OrchestratorConfig::from_env()?;
    let monitor_config = MonitorConfig::from_env()?;

    let postgres = PostgresStore::connect(&args.database_url).await?;
    let pool = postgres.pool().clone();
    let store: Arc<dyn Store> = Arc::new(postgres);
    let queue: Arc<dyn JobQueue> = Arc::new(PostgresQueue::new(pool));
    let bus = Arc::new(InProcessEventBus::new());

    // Stall failures published by this process are retried by this process.
    bus.subscribe(
        EventKind::SubtaskFailed,
        Arc::new(FailureHandler::new(
            store.clone(),
            queue.clone(),
            orchestrator_config.clone(),
        )),
    );

    let bus: Arc<dyn EventBus> = bus;
    let monitors = spawn_monitors(store, queue, bus, monitor_config, &orchestrator_config);

    info!("supervisor running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining monitors");
    monitors.shutdown().await;
    Ok(())
}
