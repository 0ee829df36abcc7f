// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control commands translating external requests into store mutations
//! and runtime calls.
//!
//! Every command validates its precondition against the current run state
//! and returns [`ControlError::InvalidState`] on violation. Terminal
//! writes go through the same conditional updates as the supervisor, so a
//! kill racing a natural exit resolves to exactly one winner.

use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use stevedore_core::{JobRun, RunStatus, StoreError, jobs, queue, runs};

use crate::runner::{ContainerRuntime, LogTail, RuntimeError};

/// Grace period given to a container stopped by a kill command.
const KILL_STOP_GRACE: u32 = 10;

/// How much log history a live-log request fetches.
const LIVE_LOG_TAIL: LogTail = LogTail::Last(1000);

/// Errors from control commands.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControlError {
    /// The job or run does not exist or is not visible to the caller.
    #[error("not found")]
    NotFound,

    /// The run is not in a state the command accepts.
    #[error("{0}")]
    InvalidState(&'static str),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Container runtime operation failed.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Result type for control commands.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Trigger a run of an active, owned job. The pending run and its queue
/// row are created atomically; the worker pool picks it up from there.
pub async fn trigger(pool: &PgPool, owner_id: Uuid, job_id: Uuid) -> Result<JobRun> {
    let job = jobs::get_active(pool, owner_id, job_id)
        .await?
        .ok_or(ControlError::NotFound)?;

    let run = queue::enqueue(pool, job.id, owner_id, 0, None).await?;
    info!(job_id = %job.id, run_id = %run.id, "Run triggered");
    Ok(run)
}

/// Trigger a run via webhook token. The token is the capability; no
/// caller identity is involved.
pub async fn webhook_trigger(pool: &PgPool, token: &str) -> Result<JobRun> {
    let job = jobs::get_by_webhook_token(pool, token)
        .await?
        .ok_or(ControlError::NotFound)?;

    let run = queue::enqueue(pool, job.id, job.owner_id, 0, None).await?;
    info!(job_id = %job.id, run_id = %run.id, "Run triggered via webhook");
    Ok(run)
}

/// Regenerate a job's webhook token, invalidating the previous URL.
pub async fn regenerate_webhook_token(
    pool: &PgPool,
    owner_id: Uuid,
    job_id: Uuid,
) -> Result<String> {
    let token = jobs::generate_webhook_token();
    if !jobs::set_webhook_token(pool, owner_id, job_id, &token).await? {
        return Err(ControlError::NotFound);
    }
    Ok(token)
}

/// Freeze a running run's container and mark the run paused.
pub async fn pause(
    pool: &PgPool,
    runtime: &Arc<dyn ContainerRuntime>,
    owner_id: Uuid,
    run_id: Uuid,
) -> Result<()> {
    let view = runs::control_view(pool, owner_id, run_id)
        .await?
        .ok_or(ControlError::NotFound)?;

    if view.status != RunStatus::Running {
        return Err(ControlError::InvalidState("Can only pause running jobs"));
    }
    let container_id = view
        .container_id
        .ok_or(ControlError::InvalidState(
            "No container associated with this run",
        ))?;

    runtime.pause_container(&container_id).await?;

    if !runs::pause(pool, run_id).await? {
        // The run resolved between the read and the update; the container
        // pause was still applied to a dying container, which is harmless.
        return Err(ControlError::InvalidState("Can only pause running jobs"));
    }

    info!(run_id = %run_id, "Run paused");
    Ok(())
}

/// Thaw a paused run's container and mark the run running again.
pub async fn resume(
    pool: &PgPool,
    runtime: &Arc<dyn ContainerRuntime>,
    owner_id: Uuid,
    run_id: Uuid,
) -> Result<()> {
    let view = runs::control_view(pool, owner_id, run_id)
        .await?
        .ok_or(ControlError::NotFound)?;

    if view.status != RunStatus::Paused {
        return Err(ControlError::InvalidState("Can only resume paused jobs"));
    }
    let container_id = view
        .container_id
        .ok_or(ControlError::InvalidState(
            "No container associated with this run",
        ))?;

    runtime.unpause_container(&container_id).await?;

    if !runs::resume(pool, run_id).await? {
        return Err(ControlError::InvalidState("Can only resume paused jobs"));
    }

    info!(run_id = %run_id, "Run resumed");
    Ok(())
}

/// Terminate a running or paused run.
///
/// The container teardown is best effort; the conditional cancel update
/// is what resolves the race against the supervisor's terminal write. If
/// the supervisor won in the meantime its result stands and this command
/// still reports success; the run is terminal either way.
pub async fn kill(
    pool: &PgPool,
    runtime: &Arc<dyn ContainerRuntime>,
    owner_id: Uuid,
    run_id: Uuid,
) -> Result<()> {
    let view = runs::control_view(pool, owner_id, run_id)
        .await?
        .ok_or(ControlError::NotFound)?;

    if view.status != RunStatus::Running && view.status != RunStatus::Paused {
        return Err(ControlError::InvalidState(
            "Can only kill running or paused jobs",
        ));
    }

    if let Some(ref container_id) = view.container_id {
        // A frozen container ignores signals; thaw it first.
        if view.status == RunStatus::Paused {
            if let Err(e) = runtime.unpause_container(container_id).await {
                warn!(run_id = %run_id, error = %e, "Failed to unpause container before kill");
            }
        }
        if let Err(e) = runtime.stop_container(container_id, KILL_STOP_GRACE).await {
            warn!(run_id = %run_id, error = %e, "Failed to stop container on kill");
        }
        if let Err(e) = runtime.remove_container(container_id).await {
            warn!(run_id = %run_id, error = %e, "Failed to remove container on kill");
        }
    }

    let duration_ms = view
        .started_at
        .map(|started| (chrono::Utc::now() - started).num_milliseconds());

    if runs::cancel(pool, run_id, duration_ms).await? {
        info!(run_id = %run_id, "Run killed by user");
    }

    queue::delete_for_run(pool, run_id).await?;
    Ok(())
}

/// Fetch a run's logs: live from the container while it is alive,
/// otherwise the stored tail.
pub async fn logs(
    pool: &PgPool,
    runtime: &Arc<dyn ContainerRuntime>,
    owner_id: Uuid,
    run_id: Uuid,
) -> Result<String> {
    let view = runs::control_view(pool, owner_id, run_id)
        .await?
        .ok_or(ControlError::NotFound)?;

    if let Some(ref container_id) = view.container_id {
        if view.status == RunStatus::Running || view.status == RunStatus::Paused {
            match runtime.logs(container_id, LIVE_LOG_TAIL).await {
                Ok(live) => return Ok(live),
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Live log fetch failed, using stored tail");
                }
            }
        }
    }

    Ok(view.logs_tail.unwrap_or_default())
}
