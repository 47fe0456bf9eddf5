// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WES Daemon - workflow monitor
//!
//! Connects to the run store and drives runs on the configured executor
//! until Ctrl-C.

use tracing::{info, warn};

use wes_daemon::config::Config;
use wes_daemon::executor::build_executor;
use wes_daemon::monitor::{Monitor, MonitorConfig};
use wes_daemon::runs::RunService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wes_daemon=info,wes_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        executor = %config.executor,
        poll_interval_secs = config.poll_interval.as_secs(),
        max_concurrent_runs = config.max_concurrent_runs,
        "Starting WES daemon"
    );

    let store =
        wes_core::persistence::connect(&config.database_url, config.database_max_connections)
            .await?;
    info!("Connected to run store");

    let runs = RunService::new(store.clone(), config.workflow_type_versions.clone());
    for (state, count) in runs.system_state_counts().await? {
        if count > 0 {
            info!(state = %state, count, "Runs in store");
        }
    }

    let executor = build_executor(&config)?;
    info!(executor_type = executor.executor_type(), "Executor initialized");

    let monitor = Monitor::new(store, executor, MonitorConfig::from(&config));
    let shutdown = monitor.shutdown_handle();
    let worker = tokio::spawn(async move { monitor.run().await });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.notify_one();
    worker.await?;

    info!("WES daemon shut down");

    Ok(())
}
