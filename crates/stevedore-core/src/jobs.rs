// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job definition persistence.
//!
//! All reads are scoped to the owning user; an unknown id and a
//! non-owned id are indistinguishable to callers.

use rand::RngCore;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::models::{CreateJob, Job};

const JOB_COLUMNS: &str = "id, user_id, name, image, command, env, memory_mb, cpu_millicores, \
     timeout_seconds, schedule, webhook_token, notify_webhook, is_active, created_at, updated_at";

/// Create a new job definition for `owner_id`, applying resource defaults.
pub async fn create(pool: &PgPool, owner_id: Uuid, req: CreateJob) -> Result<Job> {
    let req = req.with_defaults();
    let env = serde_json::to_value(&req.env).unwrap_or_default();

    let sql = format!(
        r#"
        INSERT INTO jobs
            (user_id, name, image, command, env, memory_mb, cpu_millicores,
             timeout_seconds, schedule, notify_webhook)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING {JOB_COLUMNS}
        "#
    );

    sqlx::query_as::<_, Job>(&sql)
        .bind(owner_id)
        .bind(&req.name)
        .bind(&req.image)
        .bind(&req.command)
        .bind(env)
        .bind(req.memory_mb)
        .bind(req.cpu_millicores)
        .bind(req.timeout_seconds)
        .bind(&req.schedule)
        .bind(&req.notify_webhook)
        .fetch_one(pool)
        .await
        .map_err(|e| StoreError::from_unique(e, "job name"))
}

/// List all jobs owned by `owner_id`, newest first.
pub async fn list(pool: &PgPool, owner_id: Uuid) -> Result<Vec<Job>> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = $1 ORDER BY created_at DESC"
    );
    Ok(sqlx::query_as::<_, Job>(&sql)
        .bind(owner_id)
        .fetch_all(pool)
        .await?)
}

/// Get a job by id, scoped to its owner.
pub async fn get(pool: &PgPool, owner_id: Uuid, job_id: Uuid) -> Result<Option<Job>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND user_id = $2");
    Ok(sqlx::query_as::<_, Job>(&sql)
        .bind(job_id)
        .bind(owner_id)
        .fetch_optional(pool)
        .await?)
}

/// Get an active job by id, scoped to its owner. Used by the trigger path.
pub async fn get_active(pool: &PgPool, owner_id: Uuid, job_id: Uuid) -> Result<Option<Job>> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND user_id = $2 AND is_active = true"
    );
    Ok(sqlx::query_as::<_, Job>(&sql)
        .bind(job_id)
        .bind(owner_id)
        .fetch_optional(pool)
        .await?)
}

/// Look up an active job by its webhook token. The token is the
/// capability; no owner scoping applies.
pub async fn get_by_webhook_token(pool: &PgPool, token: &str) -> Result<Option<Job>> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE webhook_token = $1 AND is_active = true"
    );
    Ok(sqlx::query_as::<_, Job>(&sql)
        .bind(token)
        .fetch_optional(pool)
        .await?)
}

/// Delete a job. Runs and queue rows cascade at the schema level.
/// Returns false when the job does not exist or is not owned.
pub async fn delete(pool: &PgPool, owner_id: Uuid, job_id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND user_id = $2")
        .bind(job_id)
        .bind(owner_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Store a freshly generated webhook token on a job, invalidating any
/// previous one. Returns false when the job does not exist or is not
/// owned.
pub async fn set_webhook_token(
    pool: &PgPool,
    owner_id: Uuid,
    job_id: Uuid,
    token: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE jobs SET webhook_token = $1, updated_at = now() WHERE id = $2 AND user_id = $3",
    )
    .bind(token)
    .bind(job_id)
    .bind(owner_id)
    .execute(pool)
    .await
    .map_err(|e| StoreError::from_unique(e, "webhook token"))?;
    Ok(result.rows_affected() > 0)
}

/// Generate an opaque webhook token: 32 random bytes, hex-encoded, with a
/// `whk_` prefix.
pub fn generate_webhook_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("whk_{}", hex::encode(bytes))
}

/// A job eligible for cron scheduling.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduledJob {
    /// Job id.
    pub id: Uuid,
    /// Owning user, carried into scheduled runs.
    pub user_id: Uuid,
    /// The cron expression to evaluate.
    pub schedule: String,
}

/// List all active jobs carrying a cron expression.
pub async fn scheduled(pool: &PgPool) -> Result<Vec<ScheduledJob>> {
    Ok(sqlx::query_as::<_, ScheduledJob>(
        "SELECT id, user_id, schedule FROM jobs WHERE schedule IS NOT NULL AND is_active = true",
    )
    .fetch_all(pool)
    .await?)
}

/// Fetch the name and optional notification URL for a job, if it still
/// exists. Used by the completion notifier after a run finishes.
pub async fn notify_target(
    pool: &PgPool,
    job_id: Uuid,
) -> Result<Option<(String, Option<String>)>> {
    Ok(
        sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT name, notify_webhook FROM jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(pool)
        .await?,
    )
}
