//! EventFlow registration service.
//!
//! Runs the registration core over the in-memory repository with periodic
//! reconciliation and lease sweeping until Ctrl+C or SIGTERM.

use eventflow::metrics::register_business_metrics;
use eventflow::{Config, EventFlowApp};
use eventflow_core::environment::SystemClock;
use eventflow_runtime::background::await_shutdown;
use eventflow_runtime::memory::InMemoryRepository;
use eventflow_runtime::metrics::MetricsServer;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(config.server.log_filter()?)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting EventFlow registration service");

    config.validate()?;
    info!(
        lease_ttl_ms = config.ledger.lease_ttl_ms,
        retry_attempts = config.retry.max_attempts,
        reconcile_interval_secs = config.sync.reconcile_interval_secs,
        metrics_addr = %config.server.metrics_addr,
        "Configuration loaded"
    );

    let mut metrics_server = MetricsServer::new(config.server.metrics_addr()?);
    metrics_server.start()?;
    register_business_metrics();

    let shutdown_timeout = config.server.shutdown_timeout();
    let seed_demo = config.server.seed_demo;
    let app = EventFlowApp::new(
        config,
        Arc::new(InMemoryRepository::new()),
        Arc::new(SystemClock),
    );

    if seed_demo {
        let admin = app.seed_demo().await?;
        info!(admin = %admin.user_id, "Demo data provisioned");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let handles = app.spawn_background(&shutdown_tx);
    info!(tasks = handles.len(), "Background jobs started");

    shutdown_signal().await;

    let _ = shutdown_tx.send(());
    await_shutdown(handles, shutdown_timeout).await;

    match app.synchronizer().reconcile().await {
        Ok(report) => info!(repairs = report.repairs, "Final reconciliation pass complete"),
        Err(e) => error!(error = %e, "Final reconciliation pass failed"),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Waits for Ctrl+C (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
