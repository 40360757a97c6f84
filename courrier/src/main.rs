//! Courrier service binary.
//!
//! Usage: `courrier [CONFIG]`. The config path defaults to `COURRIER_CONFIG`
//! and then `courrier.toml`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use courrier::{service, Config, SmtpRelay};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("courrier_starting");

    let config = Config::from_env(std::env::args_os().nth(1).map(PathBuf::from))
        .context("Failed to load configuration")?;
    info!(
        rpc_bind = %config.rpc.bind,
        smtp_host = %config.smtp.host,
        smtp_port = config.smtp.port,
        mailboxes = config.mailboxes.len(),
        flush_interval_secs = config.worker.flush_interval().as_secs(),
        amqp_enabled = config.amqp.is_some(),
        "config_loaded"
    );

    let relay = SmtpRelay::from_config(&config.smtp)?;

    service::run(config, Arc::new(relay), shutdown_signal()).await?;

    info!("courrier_shutdown_complete");
    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
