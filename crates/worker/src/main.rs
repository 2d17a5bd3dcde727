use anyhow::{Context, Result};
use shelfsync_worker::{init_telemetry, ProcessorSet, TelemetryConfig, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // .env feeds both telemetry and worker settings, so load it once up front
    dotenvy::dotenv().ok();

    // Flushes exported spans when main returns
    let _telemetry_guard = init_telemetry(TelemetryConfig::from_env());

    tracing::info!("shelfsync-worker starting...");

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    tracing::info!(
        worker_id = %config.scheduler.worker_id,
        environment = %config.environment,
        background_processing = config.scheduler.background_processing,
        "Loaded configuration"
    );

    // Connector builds register their processors here; a bare build serves
    // only the debug queue outside production
    let processors = ProcessorSet::new();

    if let Err(e) = shelfsync_worker::run(config, processors).await {
        tracing::error!(error = %e, "Worker error");
        return Err(e);
    }

    Ok(())
}
