// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Heartbeat emission and the stale-run reaper.
//!
//! Every supervised run owns a heartbeat task stamping liveness on the
//! run row. The reaper is the process-wide backstop: runs whose heartbeat
//! has expired are forced to `failed` and their containers torn down.
//! Together they guarantee that a run never stays `running` forever after
//! a worker crash, host reboot, or connection loss.
//!
//! The stale threshold must exceed the heartbeat interval by a safety
//! factor, otherwise healthy runs would be reaped between stamps.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stevedore_core::{queue, runs};

use crate::runner::ContainerRuntime;

/// Interval between liveness stamps of a supervised run.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Emit heartbeats for one run until `stop` fires.
///
/// Each stamp is guarded on the run still being active, so a terminated
/// run is never resurrected. Store errors are logged and the emitter
/// keeps going; a missed stamp only matters if it persists past the
/// reaper's stale threshold.
pub async fn emit_heartbeat(pool: PgPool, run_id: Uuid, stop: Arc<Notify>) {
    loop {
        tokio::select! {
            biased;

            _ = stop.notified() => {
                debug!(run_id = %run_id, "Heartbeat emitter stopped");
                return;
            }

            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                if let Err(e) = runs::touch_heartbeat(&pool, run_id).await {
                    warn!(run_id = %run_id, error = %e, "Failed to update heartbeat");
                }
            }
        }
    }
}

/// Configuration for the reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to sweep for stale runs.
    pub poll_interval: Duration,
    /// Maximum heartbeat age before a run is considered abandoned. Must
    /// exceed [`HEARTBEAT_INTERVAL`] by a safety factor.
    pub stale_threshold: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
        }
    }
}

/// Background sweep that forces runs with expired heartbeats into
/// `failed` and cleans up their containers and queue rows.
pub struct Reaper {
    pool: PgPool,
    runtime: Arc<dyn ContainerRuntime>,
    config: ReaperConfig,
    shutdown: Arc<Notify>,
}

impl Reaper {
    /// Create a new reaper.
    pub fn new(pool: PgPool, runtime: Arc<dyn ContainerRuntime>, config: ReaperConfig) -> Self {
        Self {
            pool,
            runtime,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop until shutdown is signalled.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reaper shutting down");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Reaper sweep failed");
                    }
                }
            }
        }
    }

    /// One sweep: find stale runs, tear down their containers, force them
    /// to `failed`, and drop their queue rows.
    pub async fn sweep(&self) -> crate::error::Result<()> {
        let stale = runs::stale(&self.pool, self.config.stale_threshold.as_secs()).await?;

        if stale.is_empty() {
            debug!("No stale runs found");
            return Ok(());
        }

        info!(count = stale.len(), "Reaping stale runs");

        for run in stale {
            warn!(run_id = %run.id, container_id = ?run.container_id, "Reaping stale run");

            // Tear down the container first, best effort; the conditional
            // update below is what actually resolves the run.
            if let Some(ref container_id) = run.container_id {
                if let Err(e) = self.runtime.stop_container(container_id, 10).await {
                    warn!(run_id = %run.id, error = %e, "Failed to stop container of stale run");
                }
                if let Err(e) = self.runtime.remove_container(container_id).await {
                    debug!(run_id = %run.id, error = %e, "Failed to remove container of stale run");
                }
            }

            match runs::reap(&self.pool, run.id).await {
                Ok(true) => {}
                Ok(false) => {
                    // Somebody else resolved it between the scan and now.
                    debug!(run_id = %run.id, "Stale run already terminal");
                }
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "Failed to mark stale run as failed");
                    continue;
                }
            }

            if let Err(e) = queue::delete_for_run(&self.pool, run.id).await {
                warn!(run_id = %run.id, error = %e, "Failed to delete queue row of stale run");
            }

            info!(run_id = %run.id, "Reaped stale run");
        }

        Ok(())
    }
}
