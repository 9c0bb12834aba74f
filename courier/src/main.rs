use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use courier::config::AppConfig;
use courier::database;
use courier::database::repositories::SqlxSettingsRepository;
use courier::logging;
use courier::notification::{DeliveryPipeline, MaintenanceConfig, MaintenanceScheduler};
use courier::utils::http_client::install_rustls_provider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env_or_default();

    // Keep the guard alive so buffered file output is flushed on exit.
    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir)?;
    install_rustls_provider();

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let settings = SqlxSettingsRepository::new(pool.clone());
    logging_config.apply_persisted_filter(&settings).await;

    let pipeline = DeliveryPipeline::from_pool(pool.clone()).await?;
    pipeline.start().await?;

    let cancel = CancellationToken::new();

    let worker_task = tokio::spawn(
        Arc::clone(&pipeline.worker).run(config.tick, cancel.child_token()),
    );

    let maintenance = Arc::new(MaintenanceScheduler::new(
        Arc::clone(&pipeline.queue),
        Arc::clone(&pipeline.history),
        Arc::clone(&pipeline.policy),
        MaintenanceConfig {
            run_on_start: true,
            ..MaintenanceConfig::default()
        },
    ));
    let maintenance_task = maintenance.start(cancel.child_token());
    let log_cleanup_task = logging_config.start_retention_cleanup(cancel.child_token());

    info!(
        database = %config.database_url,
        tick = ?config.tick,
        "courier started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for in-flight deliveries");
    cancel.cancel();

    for (name, task) in [
        ("delivery worker", worker_task),
        ("maintenance", maintenance_task),
        ("log cleanup", log_cleanup_task),
    ] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Background task ended abnormally");
        }
    }

    pool.close().await;
    info!("courier stopped");
    Ok(())
}
