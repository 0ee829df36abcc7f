// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for the execution subsystem.
//!
//! Each test runs the real store, queue, worker pool, and control layer
//! against the mock container runtime. Tests are skipped when
//! TEST_DATABASE_URL is unset.

mod common;

use std::time::Duration;

use common::TestContext;
use stevedore_core::models::RunStatus;
use stevedore_core::{queue, runs};
use stevedore_engine::control::{self, ControlError};
use stevedore_engine::heartbeat::{Reaper, ReaperConfig};
use stevedore_engine::runner::MockBehavior;
use stevedore_engine::scheduler::{Scheduler, SchedulerConfig};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn success_path_captures_exit_code_duration_and_logs() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    ctx.mock.set_behavior(
        "alpine",
        MockBehavior {
            exit_code: 0,
            run_ms: 50,
            logs: "hi\n".to_string(),
            ..Default::default()
        },
    );

    let job = ctx.create_job("hello", "alpine", 60).await;
    ctx.start_workers();

    let run = control::trigger(&ctx.pool, ctx.owner_id, job.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Pending);

    let done = ctx.wait_for_status(run.id, RunStatus::Succeeded, WAIT).await;

    assert_eq!(done.exit_code, Some(0));
    assert!(done.error_message.is_none());
    assert!(done.logs_tail.unwrap().contains("hi"));
    assert!(done.duration_ms.unwrap() >= 0);

    // Monotone timestamps.
    let started = done.started_at.unwrap();
    let finished = done.finished_at.unwrap();
    assert!(done.created_at <= started);
    assert!(started <= finished);

    // Queue closure: no queue row for a terminal run.
    ctx.wait_for_queue_cleanup(run.id).await;
    // Teardown: the container is gone.
    assert_eq!(ctx.mock.container_count(), 0);
}

#[tokio::test]
async fn nonzero_exit_fails_with_exit_code_message() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    ctx.mock.set_behavior(
        "exit7",
        MockBehavior {
            exit_code: 7,
            run_ms: 20,
            ..Default::default()
        },
    );

    let job = ctx.create_job("exits-seven", "exit7", 60).await;
    ctx.start_workers();

    let run = control::trigger(&ctx.pool, ctx.owner_id, job.id).await.unwrap();
    let done = ctx.wait_for_status(run.id, RunStatus::Failed, WAIT).await;

    assert_eq!(done.exit_code, Some(7));
    assert_eq!(done.error_message.as_deref(), Some("exit code 7"));
    ctx.wait_for_queue_cleanup(run.id).await;
}

#[tokio::test]
async fn pre_exec_pull_failure_resolves_the_run() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    ctx.mock.set_behavior(
        "missing-image",
        MockBehavior {
            fail_pull: true,
            ..Default::default()
        },
    );

    let job = ctx.create_job("bad-image", "missing-image", 60).await;
    ctx.start_workers();

    let run = control::trigger(&ctx.pool, ctx.owner_id, job.id).await.unwrap();
    let done = ctx.wait_for_status(run.id, RunStatus::Failed, WAIT).await;

    assert!(
        done.error_message.unwrap().starts_with("image pull failed"),
        "pre-exec failure must carry a descriptive error"
    );
    ctx.wait_for_queue_cleanup(run.id).await;
}

#[tokio::test]
async fn timeout_stops_the_container_and_fails_the_run() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    ctx.mock.set_behavior(
        "sleeper",
        MockBehavior {
            never_exit: true,
            ..Default::default()
        },
    );

    let job = ctx.create_job("sleepy", "sleeper", 1).await;
    ctx.start_workers();

    let run = control::trigger(&ctx.pool, ctx.owner_id, job.id).await.unwrap();
    let done = ctx
        .wait_for_status(run.id, RunStatus::Failed, Duration::from_secs(7))
        .await;

    assert!(
        done.error_message
            .unwrap()
            .starts_with("timeout exceeded"),
        "timeout failure must say so"
    );
    ctx.wait_for_queue_cleanup(run.id).await;
}

#[tokio::test]
async fn kill_cancels_a_running_run() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    ctx.mock.set_behavior(
        "sleeper",
        MockBehavior {
            never_exit: true,
            ..Default::default()
        },
    );

    let job = ctx.create_job("long-sleep", "sleeper", 600).await;
    ctx.start_workers();

    let run = control::trigger(&ctx.pool, ctx.owner_id, job.id).await.unwrap();
    ctx.wait_for_container(run.id, WAIT).await;

    control::kill(&ctx.pool, &ctx.runtime, ctx.owner_id, run.id)
        .await
        .unwrap();

    let done = ctx.wait_for_status(run.id, RunStatus::Cancelled, WAIT).await;
    assert_eq!(done.error_message.as_deref(), Some("Killed by user"));
    assert_eq!(ctx.queue_rows(run.id).await, 0);

    // No resurrection: the supervisor's late teardown must not overwrite
    // the cancellation.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let after = ctx.run(run.id).await;
    assert_eq!(after.status, RunStatus::Cancelled);
    assert_eq!(after.error_message.as_deref(), Some("Killed by user"));
}

#[tokio::test]
async fn kill_rejects_terminal_runs() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    let job = ctx.create_job("quick", "alpine", 60).await;
    ctx.start_workers();

    let run = control::trigger(&ctx.pool, ctx.owner_id, job.id).await.unwrap();
    ctx.wait_for_status(run.id, RunStatus::Succeeded, WAIT).await;

    let err = control::kill(&ctx.pool, &ctx.runtime, ctx.owner_id, run.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidState(_)));
}

#[tokio::test]
async fn pause_and_resume_round_trip() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    ctx.mock.set_behavior(
        "worker-image",
        MockBehavior {
            exit_code: 0,
            run_ms: 700,
            logs: "done\n".to_string(),
            ..Default::default()
        },
    );

    let job = ctx.create_job("pausable", "worker-image", 60).await;
    ctx.start_workers();

    let run = control::trigger(&ctx.pool, ctx.owner_id, job.id).await.unwrap();
    ctx.wait_for_container(run.id, WAIT).await;

    control::pause(&ctx.pool, &ctx.runtime, ctx.owner_id, run.id)
        .await
        .unwrap();
    let paused = ctx.run(run.id).await;
    assert_eq!(paused.status, RunStatus::Paused);
    assert!(paused.paused_at.is_some());
    assert!(ctx.mock.is_paused(paused.container_id.as_deref().unwrap()));

    // Pausing twice is a conflict.
    let err = control::pause(&ctx.pool, &ctx.runtime, ctx.owner_id, run.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidState(_)));

    control::resume(&ctx.pool, &ctx.runtime, ctx.owner_id, run.id)
        .await
        .unwrap();
    let resumed = ctx.run(run.id).await;
    assert_eq!(resumed.status, RunStatus::Running);
    assert!(resumed.paused_at.is_none());

    let done = ctx.wait_for_status(run.id, RunStatus::Succeeded, WAIT).await;
    assert!(done.logs_tail.unwrap().contains("done"));
}

#[tokio::test]
async fn reaper_fails_runs_with_expired_heartbeats() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    let job = ctx.create_job("orphaned", "alpine", 60).await;
    let run = ctx.enqueue(job.id).await;
    ctx.simulate_worker_loss(run.id, "mock_gone", 120).await;

    let reaper = Reaper::new(ctx.pool.clone(), ctx.runtime.clone(), ReaperConfig::default());
    reaper.sweep().await.unwrap();

    let done = ctx.run(run.id).await;
    assert_eq!(done.status, RunStatus::Failed);
    assert_eq!(
        done.error_message.as_deref(),
        Some("heartbeat timeout: worker may have crashed")
    );
    assert!(done.heartbeat_at.is_none());
    assert_eq!(ctx.queue_rows(run.id).await, 0);
}

#[tokio::test]
async fn reaper_leaves_healthy_runs_alone() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    let job = ctx.create_job("healthy", "alpine", 60).await;
    let run = ctx.enqueue(job.id).await;
    // Fresh heartbeat, well within the stale threshold.
    ctx.simulate_worker_loss(run.id, "mock_alive", 5).await;

    let reaper = Reaper::new(ctx.pool.clone(), ctx.runtime.clone(), ReaperConfig::default());
    reaper.sweep().await.unwrap();

    assert_eq!(ctx.run(run.id).await.status, RunStatus::Running);
}

#[tokio::test]
async fn scheduler_enqueues_once_and_never_stacks() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    let job = ctx.create_job("cron-job", "alpine", 60).await;
    sqlx::query("UPDATE jobs SET schedule = '* * * * *' WHERE id = $1")
        .bind(job.id)
        .execute(&ctx.pool)
        .await
        .unwrap();

    let scheduler = Scheduler::new(ctx.pool.clone(), SchedulerConfig::default());

    // Never ran: the first pass enqueues immediately.
    scheduler.pass().await.unwrap();
    assert_eq!(runs::count_active_for_job(&ctx.pool, job.id).await.unwrap(), 1);

    // Non-terminal run in flight: further passes are no-ops.
    scheduler.pass().await.unwrap();
    scheduler.pass().await.unwrap();
    assert_eq!(runs::count_active_for_job(&ctx.pool, job.id).await.unwrap(), 1);

    // Resolve the run just now: the next fire is the coming minute, so
    // nothing new is due yet.
    sqlx::query("UPDATE job_runs SET status = 'succeeded', finished_at = now() WHERE job_id = $1")
        .bind(job.id)
        .execute(&ctx.pool)
        .await
        .unwrap();
    scheduler.pass().await.unwrap();
    assert_eq!(runs::count_active_for_job(&ctx.pool, job.id).await.unwrap(), 0);
}

#[tokio::test]
async fn scheduler_skips_invalid_cron_expressions() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    let job = ctx.create_job("bad-cron", "alpine", 60).await;
    sqlx::query("UPDATE jobs SET schedule = 'definitely not cron' WHERE id = $1")
        .bind(job.id)
        .execute(&ctx.pool)
        .await
        .unwrap();

    let scheduler = Scheduler::new(ctx.pool.clone(), SchedulerConfig::default());
    scheduler.pass().await.unwrap();

    assert_eq!(runs::count_active_for_job(&ctx.pool, job.id).await.unwrap(), 0);
}

#[tokio::test]
async fn claims_are_exclusive_and_ordered() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    let job = ctx.create_job("queued", "alpine", 60).await;
    // Explicit eligibility times so ordering is deterministic.
    let run_a = queue::enqueue(
        &ctx.pool,
        job.id,
        ctx.owner_id,
        0,
        Some(chrono::Utc::now() - chrono::Duration::seconds(5)),
    )
    .await
    .unwrap();
    let run_b = ctx.enqueue(job.id).await;

    let first = queue::claim(&ctx.pool).await.unwrap().unwrap();
    let second = queue::claim(&ctx.pool).await.unwrap().unwrap();

    // Each run is claimed exactly once, oldest first.
    assert_eq!(first.run_id, run_a.id);
    assert_eq!(second.run_id, run_b.id);

    // Nothing claimable remains; empty is not an error.
    assert!(queue::claim(&ctx.pool).await.unwrap().is_none());
}

#[tokio::test]
async fn claim_honors_priority_over_age() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    let job = ctx.create_job("prioritized", "alpine", 60).await;
    let _low = ctx.enqueue(job.id).await;
    let high = queue::enqueue(&ctx.pool, job.id, ctx.owner_id, 10, None)
        .await
        .unwrap();

    let first = queue::claim(&ctx.pool).await.unwrap().unwrap();
    assert_eq!(first.run_id, high.id);
}

#[tokio::test]
async fn webhook_token_is_the_capability() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    let job = ctx.create_job("hooked", "alpine", 60).await;

    let token = control::regenerate_webhook_token(&ctx.pool, ctx.owner_id, job.id)
        .await
        .unwrap();
    assert!(token.starts_with("whk_"));

    let run = control::webhook_trigger(&ctx.pool, &token).await.unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.job_id, job.id);

    // Regeneration invalidates the previous URL.
    let new_token = control::regenerate_webhook_token(&ctx.pool, ctx.owner_id, job.id)
        .await
        .unwrap();
    assert_ne!(new_token, token);
    let err = control::webhook_trigger(&ctx.pool, &token).await.unwrap_err();
    assert!(matches!(err, ControlError::NotFound));
}

#[tokio::test]
async fn trigger_rejects_inactive_and_foreign_jobs() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    let job = ctx.create_job("inactive", "alpine", 60).await;
    sqlx::query("UPDATE jobs SET is_active = false WHERE id = $1")
        .bind(job.id)
        .execute(&ctx.pool)
        .await
        .unwrap();

    let err = control::trigger(&ctx.pool, ctx.owner_id, job.id).await.unwrap_err();
    assert!(matches!(err, ControlError::NotFound));

    // A different owner cannot see the job at all.
    let stranger = uuid::Uuid::new_v4();
    let err = control::trigger(&ctx.pool, stranger, job.id).await.unwrap_err();
    assert!(matches!(err, ControlError::NotFound));
}

#[tokio::test]
async fn startup_purge_drops_queue_rows_of_terminal_runs() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    let job = ctx.create_job("leftover", "alpine", 60).await;
    let run = ctx.enqueue(job.id).await;

    // An unclean shutdown left the queue row behind after the run was
    // resolved elsewhere.
    sqlx::query("UPDATE job_runs SET status = 'failed', finished_at = now() WHERE id = $1")
        .bind(run.id)
        .execute(&ctx.pool)
        .await
        .unwrap();
    assert_eq!(ctx.queue_rows(run.id).await, 1);

    let purged = queue::purge_terminal(&ctx.pool).await.unwrap();
    assert_eq!(purged, 1);
    assert_eq!(ctx.queue_rows(run.id).await, 0);
}

#[tokio::test]
async fn stored_logs_are_served_after_termination() {
    let Some(ctx) = TestContext::new().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    ctx.mock.set_behavior(
        "chatty",
        MockBehavior {
            run_ms: 20,
            logs: "line one\nline two\n".to_string(),
            ..Default::default()
        },
    );

    let job = ctx.create_job("chatty-job", "chatty", 60).await;
    ctx.start_workers();

    let run = control::trigger(&ctx.pool, ctx.owner_id, job.id).await.unwrap();
    ctx.wait_for_status(run.id, RunStatus::Succeeded, WAIT).await;

    // The container is gone; logs come from the stored tail.
    let logs = control::logs(&ctx.pool, &ctx.runtime, ctx.owner_id, run.id)
        .await
        .unwrap();
    assert!(logs.contains("line two"));
}
