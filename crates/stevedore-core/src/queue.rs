// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The durable work queue connecting triggers to workers.
//!
//! Enqueue inserts the pending run and its queue row in one transaction;
//! claim takes a row-level lock with `SKIP LOCKED` so concurrent workers
//! never contend on the same row and never claim it twice.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::JobRun;

/// Create a pending run and its queue row atomically. Returns the run as
/// the caller should surface it (status `pending`).
pub async fn enqueue(
    pool: &PgPool,
    job_id: Uuid,
    owner_id: Uuid,
    priority: i32,
    scheduled_at: Option<DateTime<Utc>>,
) -> Result<JobRun> {
    let mut tx = pool.begin().await?;

    let run = sqlx::query_as::<_, JobRun>(
        r#"
        INSERT INTO job_runs (job_id, user_id, status)
        VALUES ($1, $2, 'pending')
        RETURNING id, job_id, user_id, status, container_id, exit_code, error_message,
                  started_at, finished_at, paused_at, heartbeat_at, duration_ms,
                  logs_tail, created_at
        "#,
    )
    .bind(job_id)
    .bind(owner_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO job_queue (job_id, run_id, priority, scheduled_at)
        VALUES ($1, $2, $3, COALESCE($4, now()))
        "#,
    )
    .bind(job_id)
    .bind(run.id)
    .bind(priority)
    .bind(scheduled_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(run)
}

/// A claimed queue row joined with the job attributes the supervisor
/// needs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedRun {
    /// Queue row id, for cleanup after the run resolves.
    pub queue_id: Uuid,
    /// The run to drive.
    pub run_id: Uuid,
    /// The job being executed.
    pub job_id: Uuid,
    /// Job name, used in the container name and notifications.
    pub job_name: String,
    /// Container image reference.
    pub image: String,
    /// Command override.
    pub command: Vec<String>,
    /// Environment variables.
    #[sqlx(json)]
    pub env: HashMap<String, String>,
    /// Memory limit in megabytes.
    pub memory_mb: i32,
    /// CPU allotment in millicores.
    pub cpu_millicores: i32,
    /// Timeout in seconds; 0 disables enforcement.
    pub timeout_seconds: i32,
}

/// Atomically claim the oldest, highest-priority eligible queue row.
///
/// The select takes `FOR UPDATE OF q SKIP LOCKED`, so rows locked by a
/// concurrent worker are skipped rather than waited on. Returns `None`
/// when no work is available, distinguishable from an error.
pub async fn claim(pool: &PgPool) -> Result<Option<ClaimedRun>> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query_as::<_, ClaimedRun>(
        r#"
        SELECT q.id AS queue_id, q.run_id, q.job_id,
               j.name AS job_name, j.image, j.command, j.env,
               j.memory_mb, j.cpu_millicores, j.timeout_seconds
        FROM job_queue q
        JOIN jobs j ON j.id = q.job_id
        WHERE q.picked_at IS NULL
          AND q.scheduled_at <= now()
        ORDER BY q.priority DESC, q.scheduled_at ASC
        LIMIT 1
        FOR UPDATE OF q SKIP LOCKED
        "#,
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(claimed) = claimed else {
        tx.rollback().await?;
        return Ok(None);
    };

    sqlx::query("UPDATE job_queue SET picked_at = now() WHERE id = $1")
        .bind(claimed.queue_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(Some(claimed))
}

/// Remove a queue row. Called exactly once per claim, whatever the
/// outcome of the run.
pub async fn cleanup(pool: &PgPool, queue_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM job_queue WHERE id = $1")
        .bind(queue_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove the queue row of a run, if any. Used by the kill command and
/// the reaper, which know the run but not the queue id.
pub async fn delete_for_run(pool: &PgPool, run_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM job_queue WHERE run_id = $1")
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete queue rows whose runs already reached a terminal state.
///
/// After an unclean shutdown, claimed rows can survive for runs a prior
/// reaper pass has already failed. Called once at engine startup.
pub async fn purge_terminal(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM job_queue q
        USING job_runs r
        WHERE r.id = q.run_id
          AND r.status IN ('succeeded', 'failed', 'cancelled')
        "#,
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
