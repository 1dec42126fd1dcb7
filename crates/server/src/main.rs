mod audit_log;
mod bootstrap;
mod health;
mod identity;
mod ingress;

use std::time::Duration;

use anyhow::Result;
use concierge_core::config::{AppConfig, LoadOptions};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::bootstrap::Application;

fn init_logging(config: &AppConfig) {
    use concierge_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_ascii_lowercase()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let Application { config, runtime, ingress } = bootstrap::bootstrap_with_config(config)?;
    let shutdown = CancellationToken::new();

    let sweeper = runtime.spawn_sweeper(shutdown.child_token());
    let transport_mode = if ingress.is_noop_transport() { "noop" } else { "live" };
    health::spawn(
        &config.server.bind_address,
        config.server.health_check_port,
        health::HealthState::new(runtime.clone(), transport_mode),
        shutdown.child_token(),
    )
    .await?;

    tracing::info!(
        event_name = "system.server.chat_transport_mode",
        transport_mode,
        correlation_id = "bootstrap",
        "chat ingress transport initialized"
    );

    let ingress_task = {
        let cancel = shutdown.child_token();
        tokio::spawn(async move { ingress.start(cancel).await })
    };

    tracing::info!(event_name = "system.server.started", correlation_id = "bootstrap", "concierge-server started");
    wait_for_shutdown().await?;
    tracing::info!(event_name = "system.server.stopping", correlation_id = "shutdown", "concierge-server stopping");

    shutdown.cancel();
    let grace = Duration::from_secs(config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, ingress_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(error))) => {
            tracing::warn!(event_name = "system.server.ingress_error", error = %error, "ingress ended with error");
        }
        Ok(Err(error)) => {
            tracing::warn!(event_name = "system.server.ingress_panicked", error = %error, "ingress task failed");
        }
        Err(_) => {
            tracing::warn!(
                event_name = "system.server.shutdown_timeout",
                grace_secs = config.server.graceful_shutdown_secs,
                "ingress did not stop within the grace period"
            );
        }
    }
    if let Err(error) = sweeper.await {
        tracing::warn!(event_name = "system.server.sweeper_failed", error = %error, "sweeper task failed");
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
