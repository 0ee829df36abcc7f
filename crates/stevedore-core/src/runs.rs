// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run persistence and guarded state transitions.
//!
//! Every transition out of a non-terminal state is a conditional `UPDATE`
//! keyed on the expected prior status and returns whether a row was
//! actually written. Callers treat a `false` return as "somebody else got
//! there first" (concurrent kill, reaper sweep) and must not retry with a
//! weaker guard.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{JobRun, RunStatus};

const RUN_COLUMNS: &str = "id, job_id, user_id, status, container_id, exit_code, error_message, \
     started_at, finished_at, paused_at, heartbeat_at, duration_ms, logs_tail, created_at";

/// Get a run by id, scoped to its owner.
pub async fn get(pool: &PgPool, owner_id: Uuid, run_id: Uuid) -> Result<Option<JobRun>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE id = $1 AND user_id = $2");
    Ok(sqlx::query_as::<_, JobRun>(&sql)
        .bind(run_id)
        .bind(owner_id)
        .fetch_optional(pool)
        .await?)
}

/// List runs of a job, newest first, at most `limit` rows.
pub async fn list_for_job(
    pool: &PgPool,
    owner_id: Uuid,
    job_id: Uuid,
    limit: i64,
) -> Result<Vec<JobRun>> {
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM job_runs \
         WHERE job_id = $1 AND user_id = $2 ORDER BY created_at DESC LIMIT $3"
    );
    Ok(sqlx::query_as::<_, JobRun>(&sql)
        .bind(job_id)
        .bind(owner_id)
        .bind(limit)
        .fetch_all(pool)
        .await?)
}

/// Transition a claimed run from `pending` to `running`, stamping
/// `started_at` and the initial heartbeat. Returns false when the run was
/// no longer pending (e.g. deleted or already failed).
pub async fn mark_running(pool: &PgPool, run_id: Uuid, started_at: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE job_runs
        SET status = 'running', started_at = $1, heartbeat_at = $1
        WHERE id = $2 AND status = 'pending'
        "#,
    )
    .bind(started_at)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Record the container id once the runtime has created it. Set at most
/// once per run; afterwards it is the sole handle for runtime operations.
pub async fn set_container_id(pool: &PgPool, run_id: Uuid, container_id: &str) -> Result<()> {
    sqlx::query("UPDATE job_runs SET container_id = $1 WHERE id = $2 AND container_id IS NULL")
        .bind(container_id)
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// The terminal outcome of a supervised execution.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// `Succeeded` or `Failed`.
    pub status: RunStatus,
    /// Container exit code, when one was observed.
    pub exit_code: Option<i32>,
    /// Failure detail; `None` on success.
    pub error_message: Option<String>,
    /// Captured log tail.
    pub logs_tail: Option<String>,
    /// Termination time.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: i64,
}

/// Persist the terminal outcome of a run in a single statement, guarded on
/// the run still being `running` or `paused` so a concurrent kill is not
/// overwritten. Returns whether this writer won.
pub async fn finish(pool: &PgPool, run_id: Uuid, outcome: &RunOutcome) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE job_runs
        SET status = $1, exit_code = $2, error_message = $3, finished_at = $4,
            duration_ms = $5, logs_tail = $6, heartbeat_at = NULL
        WHERE id = $7 AND status IN ('running', 'paused')
        "#,
    )
    .bind(outcome.status)
    .bind(outcome.exit_code)
    .bind(&outcome.error_message)
    .bind(outcome.finished_at)
    .bind(outcome.duration_ms)
    .bind(&outcome.logs_tail)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Force a run to `failed` with an error message. Covers pre-exec
/// failures (pull/create/start) and supervisor faults; guarded against
/// resurrecting a terminal run.
pub async fn fail(
    pool: &PgPool,
    run_id: Uuid,
    error_message: &str,
    finished_at: DateTime<Utc>,
    duration_ms: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE job_runs
        SET status = 'failed', error_message = $1, finished_at = $2,
            duration_ms = $3, heartbeat_at = NULL
        WHERE id = $4 AND status IN ('pending', 'running', 'paused')
        "#,
    )
    .bind(error_message)
    .bind(finished_at)
    .bind(duration_ms)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Stamp liveness on an active run. The status guard ensures a terminated
/// run is never resurrected by a late heartbeat.
pub async fn touch_heartbeat(pool: &PgPool, run_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE job_runs SET heartbeat_at = now() \
         WHERE id = $1 AND status IN ('running', 'paused')",
    )
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// An active run whose heartbeat has expired.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StaleRun {
    /// Run id.
    pub id: Uuid,
    /// Container to tear down, when one was created.
    pub container_id: Option<String>,
}

/// Find active runs whose heartbeat is older than `threshold_secs`.
pub async fn stale(pool: &PgPool, threshold_secs: u64) -> Result<Vec<StaleRun>> {
    Ok(sqlx::query_as::<_, StaleRun>(
        r#"
        SELECT id, container_id FROM job_runs
        WHERE status IN ('running', 'paused')
          AND heartbeat_at IS NOT NULL
          AND heartbeat_at < now() - make_interval(secs => $1)
        "#,
    )
    .bind(threshold_secs as f64)
    .fetch_all(pool)
    .await?)
}

/// Fail a stale run on behalf of a crashed worker. Guarded like every
/// other terminal write.
pub async fn reap(pool: &PgPool, run_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE job_runs
        SET status = 'failed',
            error_message = 'heartbeat timeout: worker may have crashed',
            finished_at = now(),
            duration_ms = CASE
                WHEN started_at IS NOT NULL
                THEN (EXTRACT(EPOCH FROM now() - started_at) * 1000)::BIGINT
                ELSE NULL
            END,
            heartbeat_at = NULL
        WHERE id = $1 AND status IN ('running', 'paused')
        "#,
    )
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Freeze a running run. Returns false when it was not running.
pub async fn pause(pool: &PgPool, run_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE job_runs SET status = 'paused', paused_at = now() \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Thaw a paused run. Returns false when it was not paused.
pub async fn resume(pool: &PgPool, run_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE job_runs SET status = 'running', paused_at = NULL \
         WHERE id = $1 AND status = 'paused'",
    )
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Cancel a run on user request. The guard makes the kill race-safe
/// against the supervisor's terminal write: whichever side commits first
/// wins and the other becomes a no-op.
pub async fn cancel(pool: &PgPool, run_id: Uuid, duration_ms: Option<i64>) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE job_runs
        SET status = 'cancelled', error_message = 'Killed by user',
            finished_at = now(), duration_ms = $1, heartbeat_at = NULL
        WHERE id = $2 AND status IN ('running', 'paused')
        "#,
    )
    .bind(duration_ms)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// The slice of run state a control command needs to validate its
/// precondition.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ControlView {
    /// Container handle, when one was created.
    pub container_id: Option<String>,
    /// Current status.
    pub status: RunStatus,
    /// When the worker claimed the run.
    pub started_at: Option<DateTime<Utc>>,
    /// Stored log tail.
    pub logs_tail: Option<String>,
}

/// Read the control-relevant slice of a run, scoped to its owner.
pub async fn control_view(
    pool: &PgPool,
    owner_id: Uuid,
    run_id: Uuid,
) -> Result<Option<ControlView>> {
    Ok(sqlx::query_as::<_, ControlView>(
        "SELECT container_id, status, started_at, logs_tail \
         FROM job_runs WHERE id = $1 AND user_id = $2",
    )
    .bind(run_id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?)
}

/// Count a job's runs in non-terminal states. The scheduler uses this to
/// avoid stacking runs.
pub async fn count_active_for_job(pool: &PgPool, job_id: Uuid) -> Result<i64> {
    Ok(sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM job_runs \
         WHERE job_id = $1 AND status IN ('pending', 'running', 'paused')",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await?)
}

/// Creation time of the most recent run of a job, in any state.
pub async fn latest_created_at(pool: &PgPool, job_id: Uuid) -> Result<Option<DateTime<Utc>>> {
    Ok(sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT created_at FROM job_runs WHERE job_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?)
}
