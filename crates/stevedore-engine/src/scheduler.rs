// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron scheduler materialising time-due runs.
//!
//! Walks every active job carrying a cron expression and enqueues a run
//! when one is due. At most one run of a scheduled job is in flight at a
//! time: while a pending, running, or paused run exists the job is
//! skipped, so long-running jobs naturally backpressure their own
//! schedule instead of stacking.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use stevedore_core::jobs::ScheduledJob;
use stevedore_core::{jobs, queue, runs};

/// Errors from cron expression handling.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The expression does not have the 5 POSIX fields.
    #[error("expected 5 cron fields (minute hour day-of-month month day-of-week)")]
    FieldCount,
    /// The expression failed to parse.
    #[error("invalid cron expression: {0}")]
    Parse(#[from] cron::error::Error),
}

/// Parse a 5-field POSIX cron expression.
///
/// The cron crate wants a seconds field, so a `0` is prefixed; next-fire
/// times then land exactly on the minute, matching POSIX semantics.
pub fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    let expr = expr.trim();
    if expr.split_whitespace().count() != 5 {
        return Err(ScheduleError::FieldCount);
    }
    Ok(Schedule::from_str(&format!("0 {expr}"))?)
}

/// The first fire time strictly after `after`, if the schedule has one.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often scheduled jobs are evaluated.
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Background task that injects time-driven runs into the queue.
pub struct Scheduler {
    pool: PgPool,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(pool: PgPool, config: SchedulerConfig) -> Self {
        Self {
            pool,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop. Evaluates once immediately, then at every
    /// interval, until shutdown is signalled.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Scheduler started"
        );

        if let Err(e) = self.pass().await {
            error!(error = %e, "Scheduler pass failed");
        }

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Scheduler shutting down");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.pass().await {
                        error!(error = %e, "Scheduler pass failed");
                    }
                }
            }
        }
    }

    /// One evaluation pass over all scheduled jobs.
    pub async fn pass(&self) -> crate::error::Result<()> {
        let scheduled = jobs::scheduled(&self.pool).await?;

        for job in scheduled {
            if let Err(e) = self.consider(&job).await {
                error!(job_id = %job.id, error = %e, "Failed to evaluate scheduled job");
            }
        }

        Ok(())
    }

    /// Evaluate one job; enqueue a run when due. Returns whether a run
    /// was enqueued.
    async fn consider(&self, job: &ScheduledJob) -> crate::error::Result<bool> {
        let schedule = match parse_schedule(&job.schedule) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Skipping job with invalid cron expression");
                return Ok(false);
            }
        };

        // No stacking: wait for the in-flight run to resolve.
        if runs::count_active_for_job(&self.pool, job.id).await? > 0 {
            debug!(job_id = %job.id, "Scheduled job already has an active run");
            return Ok(false);
        }

        let due = match runs::latest_created_at(&self.pool, job.id).await? {
            // Never ran before: fire immediately.
            None => true,
            Some(last) => match next_fire(&schedule, last) {
                Some(next) => next <= Utc::now(),
                None => false,
            },
        };

        if !due {
            return Ok(false);
        }

        let run = queue::enqueue(&self.pool, job.id, job.user_id, 0, None).await?;
        info!(job_id = %job.id, run_id = %run.id, "Enqueued scheduled run");
        Ok(true)
    }
}
