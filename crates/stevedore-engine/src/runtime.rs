// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Assembled engine runtime: worker pool, scheduler, reaper, HTTP server.
//!
//! [`EngineRuntime`] wires the background tasks to one pool and one
//! container runtime, and tears them down in reverse dependency order on
//! shutdown: the scheduler stops producing work, the worker pool drains
//! in-flight runs, the reaper takes its final pass last so anything cut
//! off is still swept on the next start.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use stevedore_core::queue;

use crate::config::Config;
use crate::heartbeat::{Reaper, ReaperConfig};
use crate::notify::Notifier;
use crate::runner::ContainerRuntime;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::server::{self, AppState};
use crate::worker::{WorkerConfig, WorkerPool};

/// Builder for an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    pool: Option<PgPool>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    http_addr: SocketAddr,
    worker_config: WorkerConfig,
    scheduler_config: SchedulerConfig,
    reaper_config: ReaperConfig,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            pool: None,
            runtime: None,
            http_addr: "0.0.0.0:8080".parse().unwrap(),
            worker_config: WorkerConfig::default(),
            scheduler_config: SchedulerConfig::default(),
            reaper_config: ReaperConfig::default(),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the PostgreSQL connection pool (required).
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the container runtime (required).
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set the HTTP bind address. Default: `0.0.0.0:8080`.
    pub fn http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = addr;
        self
    }

    /// Override the worker pool configuration.
    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Override the scheduler configuration.
    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    /// Override the reaper configuration.
    pub fn reaper_config(mut self, config: ReaperConfig) -> Self {
        self.reaper_config = config;
        self
    }

    /// Apply the pieces of [`Config`] that concern the engine runtime.
    pub fn apply(mut self, config: &Config) -> Self {
        self.http_addr = config.http_addr;
        self.worker_config.max_concurrent = config.max_concurrent_runs;
        self.worker_config.poll_interval = config.poll_interval;
        self.worker_config.shutdown_grace = config.shutdown_grace;
        self
    }

    /// Start the engine: reconcile leftovers, then spawn the scheduler,
    /// worker pool, reaper, and HTTP server.
    pub async fn start(self) -> Result<EngineRuntime> {
        let pool = self.pool.ok_or_else(|| anyhow::anyhow!("pool is required"))?;
        let runtime = self
            .runtime
            .ok_or_else(|| anyhow::anyhow!("runtime is required"))?;

        // Queue rows whose runs already resolved are leftovers of an
        // unclean shutdown.
        let purged = queue::purge_terminal(&pool).await?;
        if purged > 0 {
            info!(purged, "Purged queue rows of terminal runs");
        }

        let notifier = Notifier::new(pool.clone());

        let scheduler = Scheduler::new(pool.clone(), self.scheduler_config);
        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_handle = tokio::spawn(scheduler.run());

        let worker_pool = Arc::new(WorkerPool::new(
            pool.clone(),
            runtime.clone(),
            notifier,
            self.worker_config,
        ));
        let worker_shutdown = worker_pool.shutdown_handle();
        let worker_handle = {
            let worker_pool = worker_pool.clone();
            tokio::spawn(async move { worker_pool.run().await })
        };

        let reaper = Reaper::new(pool.clone(), runtime.clone(), self.reaper_config);
        let reaper_shutdown = reaper.shutdown_handle();
        let reaper_handle = tokio::spawn(reaper.run());

        let server_shutdown = Arc::new(Notify::new());
        let server_handle = {
            let state = AppState {
                pool: pool.clone(),
                runtime: runtime.clone(),
            };
            let shutdown = server_shutdown.clone();
            tokio::spawn(server::serve(self.http_addr, state, shutdown))
        };

        info!(http_addr = %self.http_addr, "Engine runtime started");

        Ok(EngineRuntime {
            worker_pool,
            scheduler_shutdown,
            scheduler_handle,
            worker_shutdown,
            worker_handle,
            reaper_shutdown,
            reaper_handle,
            server_shutdown,
            server_handle,
        })
    }
}

/// A running engine that can be embedded in an application.
pub struct EngineRuntime {
    worker_pool: Arc<WorkerPool>,
    scheduler_shutdown: Arc<Notify>,
    scheduler_handle: JoinHandle<()>,
    worker_shutdown: Arc<Notify>,
    worker_handle: JoinHandle<()>,
    reaper_shutdown: Arc<Notify>,
    reaper_handle: JoinHandle<()>,
    server_shutdown: Arc<Notify>,
    server_handle: JoinHandle<std::io::Result<()>>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Number of currently executing runs.
    pub fn active_runs(&self) -> usize {
        self.worker_pool.active_runs()
    }

    /// Gracefully shut the engine down in reverse dependency order.
    pub async fn shutdown(self) -> Result<()> {
        info!("Engine runtime shutting down");

        // Stop producing new work.
        self.scheduler_shutdown.notify_one();
        if let Err(e) = self.scheduler_handle.await {
            error!(error = %e, "Scheduler task panicked");
        }

        // Stop claiming and drain in-flight runs (bounded inside).
        self.worker_shutdown.notify_one();
        if let Err(e) = self.worker_handle.await {
            error!(error = %e, "Worker pool task panicked");
        }

        // The reaper goes after the pool so it is around while runs drain.
        self.reaper_shutdown.notify_one();
        if let Err(e) = self.reaper_handle.await {
            error!(error = %e, "Reaper task panicked");
        }

        self.server_shutdown.notify_one();
        match self.server_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "HTTP server error during shutdown"),
            Err(e) => error!(error = %e, "HTTP server task panicked"),
        }

        info!("Engine runtime shutdown complete");
        Ok(())
    }
}
