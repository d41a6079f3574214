mod bootstrap;
mod health;
mod webhooks;
mod workers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use winback_core::config::{AppConfig, LoadOptions};

use crate::health::OpsState;
use crate::webhooks::WebhookState;
use crate::workers::WorkerPool;

fn init_logging(config: &AppConfig) {
    use tracing::Level;
    use winback_core::config::LogFormat::*;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    // Now bootstrap using the same config we already loaded
    let app = bootstrap::bootstrap_with_config(config).await?;

    let webhook_state = WebhookState {
        intake: app.intake.clone(),
        reconciliation: app.reconciliation.clone(),
        messages: app.messages.clone(),
        queue: app.queue.clone(),
        engine: app.queue_engine.clone(),
        webhook_secret: app.config.server.webhook_secret.clone(),
    };
    let ops_state = OpsState { db_pool: app.db_pool.clone(), queue: app.queue.clone() };
    let router = webhooks::router(webhook_state).merge(health::router(ops_state));

    let workers = Arc::new(WorkerPool::new(
        app.queue.clone(),
        app.queue_engine.clone(),
        app.pipeline.clone(),
        app.delivery.clone(),
        app.conversations.clone(),
        app.messages.clone(),
        &app.config.queue,
    ))
    .start();

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        address = %address,
        "winback server listening"
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(event_name = "system.server.stopping", "winback server stopping");

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, workers.shutdown()).await.is_err() {
        tracing::warn!(
            event_name = "system.server.workers_still_busy",
            "queue workers did not stop within the shutdown grace period"
        );
    }
    app.db_pool.close().await;

    tracing::info!(event_name = "system.server.stopped", "winback server stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(
            event_name = "system.server.signal_failed",
            %error,
            "could not listen for the shutdown signal"
        );
    }
}
