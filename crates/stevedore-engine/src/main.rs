// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stevedore Engine - Container Job Orchestration Server
//!
//! Runs the HTTP API, worker pool, cron scheduler, and reaper against a
//! PostgreSQL store and the local Docker daemon.

use std::sync::Arc;

use tracing::{info, warn};

use stevedore_engine::config::Config;
use stevedore_engine::runner::{ContainerRuntime, DockerRuntime};
use stevedore_engine::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stevedore_engine=info,stevedore_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        max_concurrent_runs = config.max_concurrent_runs,
        "Starting Stevedore Engine"
    );

    let pool = stevedore_core::db::connect(&config.database_url, config.db_pool_size).await?;
    info!("Connected to database");

    stevedore_core::migrations::run(&pool).await?;
    info!("Database schema up to date");

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect().await?);
    info!(runtime_type = runtime.runtime_type(), "Container runtime ready");

    let engine = EngineRuntime::builder()
        .pool(pool)
        .runtime(runtime)
        .apply(&config)
        .start()
        .await?;

    info!(addr = %config.http_addr, "Stevedore Engine ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    engine.shutdown().await?;

    info!("Stevedore Engine shut down");

    Ok(())
}
