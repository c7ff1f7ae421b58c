mod problem;
mod queue;
mod router;
mod tasks;
mod telemetry;
mod worker;

use std::{net::SocketAddr, sync::Arc};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use oncall_storage::Database;
use oncall_util::{load_env_file, AppConfig};

use crate::queue::{Clock, JobQueue};
use crate::tasks::{ProvisionSettings, ProvisioningTasks};
use crate::worker::WorkerPool;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "app", "database ready");

    let clock: Clock = Arc::new(Utc::now);
    let settings = ProvisionSettings::from_config(&config.worker)?;
    let queue = JobQueue::new(&database, clock.clone());
    let tasks = ProvisioningTasks::new(database.clone(), queue, settings, clock.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers =
        WorkerPool::new(&database, tasks.clone(), &config.worker, clock).spawn(shutdown_rx);
    info!(
        stage = "app",
        concurrency = config.worker.concurrency,
        queue = %config.worker.queue,
        "workers started"
    );

    let state = router::AppState::new(metrics, database, tasks);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(stage = "app", "shutting down workers");
    shutdown_tx.send(true).ok();
    for handle in workers {
        if let Err(err) = handle.await {
            warn!(stage = "app", error = %err, "worker task ended abnormally");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(stage = "app", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
