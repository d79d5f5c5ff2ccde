use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_worker::backend::{HttpBackend, ProcessingBackend};
use relay_worker::config::WorkerConfig;
use relay_worker::poller::Poller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_worker=info,relay_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    tracing::info!(
        worker_id = %config.worker_id,
        brokers = ?config.brokers,
        backend = %config.backend_url,
        work_dir = %config.work_dir.display(),
        "Loaded worker configuration"
    );

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.work_dir.display()))?;

    let backend: Arc<dyn ProcessingBackend> = Arc::new(HttpBackend::new(
        config.backend_url.clone(),
        config.health_timeout,
    ));
    let mut poller = Poller::from_config(&config, backend);

    // --- Connection test mode ---
    if std::env::args().any(|a| a == "--test") {
        let ok = poller.connect().await;
        tracing::info!(
            available = poller.pool().available_count(),
            brokers = poller.pool().len(),
            "Connection test: {}",
            poller.pool().summary()
        );
        anyhow::ensure!(ok, "Connection test failed");
        return Ok(());
    }

    // --- Run until signalled ---
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let stats = poller.run(cancel).await?;
    tracing::info!(
        claimed = stats.jobs_claimed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        "Shutdown complete"
    );
    Ok(())
}

/// Wait for SIGINT or SIGTERM. The job in flight, if any, finishes before
/// the loop observes cancellation.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), stopping"),
        () = terminate => tracing::info!("Received SIGTERM, stopping"),
    }
}
