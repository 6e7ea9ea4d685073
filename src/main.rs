use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;
use tokio::{signal, sync::watch};
use tracing::{error, info, warn};

use telemetry_anomaly as scanner;
use telemetry_anomaly::{DetectionContext, Scheduler, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = scanner::config::load_config().context("loading configuration")?;
    scanner::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = scanner::db::establish_connection_from_app_config(&cfg)
        .await
        .context("connecting to database")?;
    scanner::db::check_connection(&db_pool)
        .await
        .context("database health check")?;
    if cfg.auto_migrate {
        scanner::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db = Arc::new(db_pool);

    let queue = scanner::task_queue::from_config(&cfg).await;
    let ctx = DetectionContext::new(db.clone(), queue, cfg.anomaly.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = WorkerPool::from_context(&ctx).start(shutdown_rx.clone());
    let scheduler = Scheduler::from_context(&ctx).start(shutdown_rx);

    info!(
        environment = %cfg.environment,
        workers = workers.len(),
        scheduler = scheduler.is_some(),
        "telemetry-anomaly running"
    );

    shutdown_signal().await;
    info!("Shutdown signal received");
    if shutdown_tx.send(true).is_err() {
        warn!("No components left to notify of shutdown");
    }

    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            error!("Scheduler task ended abnormally: {}", e);
        }
    }
    for result in join_all(workers).await {
        if let Err(e) = result {
            error!("Worker task ended abnormally: {}", e);
        }
    }

    drop(ctx);
    if let Ok(pool) = Arc::try_unwrap(db) {
        scanner::db::close_pool(pool).await?;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
