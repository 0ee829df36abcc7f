// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool and per-run supervision.
//!
//! The pool polls the queue on a single ticker and admits at most
//! `max_concurrent` simultaneous supervised runs. Each supervised run is
//! driven through pull → create → start → wait → teardown while a
//! heartbeat task stamps liveness; the terminal state is persisted with a
//! single conditional update so a concurrent kill is never overwritten.
//!
//! No error escapes a supervisor: every failure path resolves the run to
//! `failed` and cleans up the queue row, and a panicking supervisor is
//! caught at the spawn boundary. A run that still slips through (process
//! death) is resolved by the reaper via heartbeat expiry.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stevedore_core::queue::{self, ClaimedRun};
use stevedore_core::runs::{self, RunOutcome};
use stevedore_core::RunStatus;

use crate::heartbeat::emit_heartbeat;
use crate::notify::Notifier;
use crate::runner::{ContainerRuntime, ContainerSpec, LogTail, RuntimeError};

/// Grace period given to a container stopped because its timeout fired.
const TIMEOUT_STOP_GRACE: u32 = 5;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum simultaneous supervised runs.
    pub max_concurrent: usize,
    /// How often the queue is polled.
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight runs.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Bounded concurrent executor owning the per-run supervision loop.
pub struct WorkerPool {
    pool: PgPool,
    runtime: Arc<dyn ContainerRuntime>,
    notifier: Notifier,
    config: WorkerConfig,
    active: Arc<AtomicUsize>,
    shutdown: Arc<Notify>,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new(
        pool: PgPool,
        runtime: Arc<dyn ContainerRuntime>,
        notifier: Notifier,
        config: WorkerConfig,
    ) -> Self {
        Self {
            pool,
            runtime,
            notifier,
            config,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Number of currently executing runs.
    pub fn active_runs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Run the poll loop until shutdown is signalled, then drain in-flight
    /// runs up to the configured grace period.
    pub async fn run(&self) {
        info!(
            max_concurrent = self.config.max_concurrent,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Worker pool started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Worker pool received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if self.active.load(Ordering::SeqCst) < self.config.max_concurrent {
                        self.poll_once().await;
                    }
                }
            }
        }

        self.drain().await;
    }

    /// Claim at most one queue row and spawn its supervisor.
    async fn poll_once(&self) {
        let claimed = match queue::claim(&self.pool).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "Failed to claim from queue");
                return;
            }
        };

        self.active.fetch_add(1, Ordering::SeqCst);

        let pool = self.pool.clone();
        let runtime = self.runtime.clone();
        let notifier = self.notifier.clone();
        let active = self.active.clone();
        let run_id = claimed.run_id;
        let queue_id = claimed.queue_id;

        tokio::spawn(async move {
            let supervised = std::panic::AssertUnwindSafe(supervise(
                pool.clone(),
                runtime,
                notifier,
                claimed,
            ))
            .catch_unwind()
            .await;

            if supervised.is_err() {
                // The supervisor itself blew up; resolve the run so it
                // never sticks in `running`.
                error!(run_id = %run_id, "Supervisor panicked");
                let now = Utc::now();
                if let Err(e) =
                    runs::fail(&pool, run_id, "internal error: supervisor panicked", now, 0).await
                {
                    error!(run_id = %run_id, error = %e, "Failed to record supervisor panic");
                }
                if let Err(e) = queue::cleanup(&pool, queue_id).await {
                    warn!(run_id = %run_id, error = %e, "Failed to clean up queue row");
                }
            }

            active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Wait for in-flight runs to complete, bounded by the shutdown
    /// grace. Runs cut off here are reaped after restart via heartbeat
    /// expiry.
    async fn drain(&self) {
        let in_flight = self.active.load(Ordering::SeqCst);
        if in_flight == 0 {
            info!("Worker pool stopped, no in-flight runs");
            return;
        }

        info!(in_flight, "Worker pool draining in-flight runs");

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while self.active.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => info!("All in-flight runs completed"),
            Err(_) => warn!(
                active = self.active.load(Ordering::SeqCst),
                "Shutdown grace elapsed, remaining runs may be orphaned"
            ),
        }
    }
}

/// Drive one claimed run from `pending` to a terminal state.
async fn supervise(
    pool: PgPool,
    runtime: Arc<dyn ContainerRuntime>,
    notifier: Notifier,
    claimed: ClaimedRun,
) {
    let started_at = Utc::now();
    let run_id = claimed.run_id;

    info!(
        run_id = %run_id,
        job = %claimed.job_name,
        image = %claimed.image,
        "Executing run"
    );

    // pending -> running; a run that is no longer pending was resolved
    // while queued (e.g. cascade delete), so only the queue row remains.
    match runs::mark_running(&pool, run_id, started_at).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(run_id = %run_id, "Claimed run is no longer pending, dropping");
            cleanup_queue(&pool, claimed.queue_id).await;
            return;
        }
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Failed to mark run as running");
            return;
        }
    }

    // Liveness stamps start before the (possibly slow) image pull so the
    // reaper never mistakes a long pull for a dead worker.
    let heartbeat_stop = Arc::new(Notify::new());
    tokio::spawn(emit_heartbeat(
        pool.clone(),
        run_id,
        heartbeat_stop.clone(),
    ));

    if let Err(e) = runtime.pull_image(&claimed.image).await {
        fail_run(
            &pool,
            &notifier,
            &claimed,
            started_at,
            &format!("image pull failed: {e}"),
        )
        .await;
        heartbeat_stop.notify_one();
        cleanup_queue(&pool, claimed.queue_id).await;
        return;
    }

    let container_name = format!(
        "stevedore-{}-{}",
        claimed.job_name,
        &run_id.to_string()[..8]
    );
    let spec = ContainerSpec {
        name: container_name,
        image: claimed.image.clone(),
        command: claimed.command.clone(),
        env: claimed.env.clone(),
        memory_mb: claimed.memory_mb as i64,
        cpu_millicores: claimed.cpu_millicores as i64,
    };

    let container_id = match runtime.create_container(&spec).await {
        Ok(id) => id,
        Err(e) => {
            fail_run(
                &pool,
                &notifier,
                &claimed,
                started_at,
                &format!("container create failed: {e}"),
            )
            .await;
            heartbeat_stop.notify_one();
            cleanup_queue(&pool, claimed.queue_id).await;
            return;
        }
    };

    if let Err(e) = runs::set_container_id(&pool, run_id, &container_id).await {
        warn!(run_id = %run_id, error = %e, "Failed to persist container id");
    }

    // Register the wait future BEFORE starting: a fast-exiting container's
    // exit event must not be lost.
    let wait_runtime = runtime.clone();
    let wait_container_id = container_id.clone();
    let mut wait_handle =
        tokio::spawn(async move { wait_runtime.wait_container(&wait_container_id).await });

    if let Err(e) = runtime.start_container(&container_id).await {
        fail_run(
            &pool,
            &notifier,
            &claimed,
            started_at,
            &format!("container start failed: {e}"),
        )
        .await;
        wait_handle.abort();
        remove_container(&runtime, &container_id, run_id).await;
        heartbeat_stop.notify_one();
        cleanup_queue(&pool, claimed.queue_id).await;
        return;
    }

    // Await the exit, racing the timeout when one is configured.
    let mut timed_out = false;
    let wait_result: Result<i64, RuntimeError> = if claimed.timeout_seconds > 0 {
        let timeout = Duration::from_secs(claimed.timeout_seconds as u64);
        tokio::select! {
            res = &mut wait_handle => flatten_wait(res),
            _ = tokio::time::sleep(timeout) => {
                timed_out = true;
                warn!(
                    run_id = %run_id,
                    timeout_seconds = claimed.timeout_seconds,
                    "Run timed out, stopping container"
                );
                if let Err(e) = runtime.stop_container(&container_id, TIMEOUT_STOP_GRACE).await {
                    warn!(run_id = %run_id, error = %e, "Failed to stop timed-out container");
                }
                // Drain the wait future for the real exit.
                flatten_wait((&mut wait_handle).await)
            }
        }
    } else {
        flatten_wait(wait_handle.await)
    };

    heartbeat_stop.notify_one();

    let finished_at = Utc::now();
    let duration_ms = (finished_at - started_at).num_milliseconds();

    // Best effort: a run without logs is still a resolved run.
    let logs_tail = match runtime.logs(&container_id, LogTail::All).await {
        Ok(logs) => logs,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "Failed to capture logs");
            String::new()
        }
    };

    let outcome = if timed_out {
        RunOutcome {
            status: RunStatus::Failed,
            exit_code: wait_result.as_ref().ok().map(|c| *c as i32),
            error_message: Some(format!(
                "timeout exceeded ({}s limit)",
                claimed.timeout_seconds
            )),
            logs_tail: Some(logs_tail),
            finished_at,
            duration_ms,
        }
    } else {
        match wait_result {
            Err(e) => RunOutcome {
                status: RunStatus::Failed,
                exit_code: None,
                error_message: Some(e.to_string()),
                logs_tail: Some(logs_tail),
                finished_at,
                duration_ms,
            },
            Ok(0) => RunOutcome {
                status: RunStatus::Succeeded,
                exit_code: Some(0),
                error_message: None,
                logs_tail: Some(logs_tail),
                finished_at,
                duration_ms,
            },
            Ok(code) => RunOutcome {
                status: RunStatus::Failed,
                exit_code: Some(code as i32),
                error_message: Some(format!("exit code {code}")),
                logs_tail: Some(logs_tail),
                finished_at,
                duration_ms,
            },
        }
    };

    match runs::finish(&pool, run_id, &outcome).await {
        Ok(true) => {
            notifier
                .run_completed(
                    claimed.job_id,
                    run_id,
                    outcome.status,
                    outcome.exit_code,
                    duration_ms,
                    outcome.error_message.clone(),
                )
                .await;
        }
        Ok(false) => {
            // A kill command won the race; its state stands.
            debug!(run_id = %run_id, "Terminal state already written elsewhere");
        }
        Err(e) => {
            // The reaper remains the backstop.
            error!(run_id = %run_id, error = %e, "Failed to persist terminal state");
        }
    }

    remove_container(&runtime, &container_id, run_id).await;
    cleanup_queue(&pool, claimed.queue_id).await;

    info!(
        run_id = %run_id,
        status = ?outcome.status,
        exit_code = ?outcome.exit_code,
        duration_ms,
        "Run completed"
    );
}

/// Map a wait-task join result onto the runtime result. A join error
/// means the wait task itself died, which counts as a wait fault.
fn flatten_wait(res: Result<Result<i64, RuntimeError>, JoinError>) -> Result<i64, RuntimeError> {
    match res {
        Ok(inner) => inner,
        Err(e) => Err(RuntimeError::Wait(format!("wait task failed: {e}"))),
    }
}

/// Mark a run as failed with an error message and notify the job's
/// webhook. Used for pre-exec failures; the guard in [`runs::fail`]
/// protects already-terminal runs.
async fn fail_run(
    pool: &PgPool,
    notifier: &Notifier,
    claimed: &ClaimedRun,
    started_at: DateTime<Utc>,
    error_message: &str,
) {
    let finished_at = Utc::now();
    let duration_ms = (finished_at - started_at).num_milliseconds();

    match runs::fail(pool, claimed.run_id, error_message, finished_at, duration_ms).await {
        Ok(true) => {
            warn!(run_id = %claimed.run_id, error = %error_message, "Run failed");
            notifier
                .run_completed(
                    claimed.job_id,
                    claimed.run_id,
                    RunStatus::Failed,
                    None,
                    duration_ms,
                    Some(error_message.to_string()),
                )
                .await;
        }
        Ok(false) => {
            debug!(run_id = %claimed.run_id, "Run already terminal, fail skipped");
        }
        Err(e) => {
            error!(run_id = %claimed.run_id, error = %e, "Failed to mark run as failed");
        }
    }
}

async fn remove_container(runtime: &Arc<dyn ContainerRuntime>, container_id: &str, run_id: Uuid) {
    if let Err(e) = runtime.remove_container(container_id).await {
        warn!(run_id = %run_id, error = %e, "Failed to remove container");
    }
}

async fn cleanup_queue(pool: &PgPool, queue_id: Uuid) {
    if let Err(e) = queue::cleanup(pool, queue_id).await {
        warn!(queue_id = %queue_id, error = %e, "Failed to clean up queue row");
    }
}
