// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for engine E2E tests.
//!
//! Provides a TestContext over a real PostgreSQL database and the mock
//! container runtime. Tests are skipped when TEST_DATABASE_URL is unset.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{Mutex, MutexGuard, Notify};
use uuid::Uuid;

use stevedore_core::models::{CreateJob, Job, JobRun, RunStatus};
use stevedore_core::{jobs, migrations, queue, runs};
use stevedore_engine::notify::Notifier;
use stevedore_engine::runner::{ContainerRuntime, MockRuntime};
use stevedore_engine::worker::{WorkerConfig, WorkerPool};

// The queue is a shared table, so tests that claim from it must not
// interleave. One lock serializes every E2E test in this binary.
static DB_LOCK: Mutex<()> = Mutex::const_new(());

/// Test context owning a clean database, a test user, and a mock runtime.
pub struct TestContext {
    pub pool: PgPool,
    pub owner_id: Uuid,
    pub mock: Arc<MockRuntime>,
    pub runtime: Arc<dyn ContainerRuntime>,
    _guard: MutexGuard<'static, ()>,
}

impl TestContext {
    /// Create a new test context, or `None` when TEST_DATABASE_URL is
    /// not configured.
    pub async fn new() -> Option<Self> {
        let guard = DB_LOCK.lock().await;

        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&database_url).await.ok()?;

        migrations::run(&pool).await.ok()?;

        // Start from a clean slate; jobs, runs, and queue rows cascade.
        sqlx::query("DELETE FROM users").execute(&pool).await.ok()?;

        let owner_id: Uuid = sqlx::query_scalar(
            "INSERT INTO users (email) VALUES ($1) RETURNING id",
        )
        .bind(format!("test-{}@example.com", Uuid::new_v4()))
        .fetch_one(&pool)
        .await
        .ok()?;

        let mock = Arc::new(MockRuntime::new());
        let runtime: Arc<dyn ContainerRuntime> = mock.clone();

        Some(Self {
            pool,
            owner_id,
            mock,
            runtime,
            _guard: guard,
        })
    }

    /// Create a job owned by the test user.
    pub async fn create_job(&self, name: &str, image: &str, timeout_seconds: i32) -> Job {
        jobs::create(
            &self.pool,
            self.owner_id,
            CreateJob {
                name: name.to_string(),
                image: image.to_string(),
                timeout_seconds,
                ..Default::default()
            },
        )
        .await
        .expect("create job")
    }

    /// Start a worker pool with a fast poll interval. The tasks die with
    /// the test runtime.
    pub fn start_workers(&self) -> Arc<Notify> {
        let worker_pool = Arc::new(WorkerPool::new(
            self.pool.clone(),
            self.runtime.clone(),
            Notifier::new(self.pool.clone()),
            WorkerConfig {
                max_concurrent: 5,
                poll_interval: Duration::from_millis(50),
                shutdown_grace: Duration::from_secs(5),
            },
        ));
        let shutdown = worker_pool.shutdown_handle();
        tokio::spawn(async move { worker_pool.run().await });
        shutdown
    }

    /// Fetch a run, panicking when it is missing.
    pub async fn run(&self, run_id: Uuid) -> JobRun {
        runs::get(&self.pool, self.owner_id, run_id)
            .await
            .expect("get run")
            .expect("run exists")
    }

    /// Poll until the run reaches `status` or the timeout elapses.
    pub async fn wait_for_status(&self, run_id: Uuid, status: RunStatus, timeout: Duration) -> JobRun {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.run(run_id).await;
            if run.status == status {
                return run;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "run {run_id} stuck in {:?} while waiting for {status:?}",
                run.status
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Poll until the run is `running` with a container attached. A run
    /// is marked running before its container is created, so commands
    /// that need the container handle wait here instead of on the status
    /// alone.
    pub async fn wait_for_container(&self, run_id: Uuid, timeout: Duration) -> JobRun {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.run(run_id).await;
            if run.status == RunStatus::Running && run.container_id.is_some() {
                return run;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "run {run_id} never attached a container (status {:?})",
                run.status
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Poll until the run's queue row is gone. The supervisor cleans the
    /// queue just after the terminal write commits, so tests that observe
    /// a terminal status wait here before asserting queue closure.
    pub async fn wait_for_queue_cleanup(&self, run_id: Uuid) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.queue_rows(run_id).await > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "queue row for run {run_id} was never cleaned up"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Number of queue rows for a run.
    pub async fn queue_rows(&self, run_id: Uuid) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM job_queue WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .expect("count queue rows")
    }

    /// Force a run into `running` with an aged heartbeat, simulating a
    /// crashed worker that stopped stamping liveness.
    pub async fn simulate_worker_loss(&self, run_id: Uuid, container_id: &str, age_secs: i64) {
        sqlx::query(
            r#"
            UPDATE job_runs
            SET status = 'running', container_id = $1, started_at = now(),
                heartbeat_at = now() - make_interval(secs => $2)
            WHERE id = $3
            "#,
        )
        .bind(container_id)
        .bind(age_secs as f64)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .expect("simulate worker loss");
    }

    /// Enqueue a run without going through the control layer.
    pub async fn enqueue(&self, job_id: Uuid) -> JobRun {
        queue::enqueue(&self.pool, job_id, self.owner_id, 0, None)
            .await
            .expect("enqueue")
    }
}
