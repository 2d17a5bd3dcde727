// Shelfsync worker process
// Decision: The host owns process concerns only (config, telemetry, pool, signals)
// Decision: Connector processors are passed in through ProcessorSet so this crate
//           carries no upstream client code

pub mod config;
pub mod queues;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use shelfsync_task_queue::{PostgresTaskStore, TaskQueueService};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

pub use config::WorkerConfig;
pub use queues::{register_queues, DebugProcessor, ProcessorSet, QueueSettings};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};

/// Run the scheduler until SIGINT or SIGTERM, then requeue owned tasks
pub async fn run(config: WorkerConfig, processors: ProcessorSet) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let store = PostgresTaskStore::new(pool);
    if config.run_migrations {
        store
            .migrate()
            .await
            .context("Failed to run task queue migrations")?;
        info!("Task queue migrations applied");
    }

    let service = TaskQueueService::new(Arc::new(store), config.scheduler.clone());
    let queues = register_queues(&service, &processors, config.is_production())
        .context("Failed to register queues")?;
    if queues.is_empty() {
        warn!("No queues registered; this instance will only run maintenance");
    }

    service.start().context("Failed to start task queue")?;
    info!(
        worker_id = %service.worker_id(),
        environment = %config.environment,
        queues = ?queues,
        "Worker started"
    );

    shutdown_signal().await;
    info!("Received shutdown signal");

    let requeued = service
        .shutdown()
        .await
        .context("Failed to shut down task queue")?;
    info!(requeued, "Worker shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
