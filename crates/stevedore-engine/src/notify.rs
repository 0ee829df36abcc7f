// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound run-completion notifications.
//!
//! Jobs may carry a `notify_webhook` URL; when a run reaches a terminal
//! state the supervisor posts a JSON payload there. Delivery is
//! fire-and-forget: failures are logged and never retried.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use stevedore_core::{RunStatus, jobs};

/// Payload posted to a job's notification webhook.
#[derive(Debug, Serialize)]
struct RunCompletedPayload<'a> {
    event: &'static str,
    run_id: Uuid,
    job_id: Uuid,
    job_name: &'a str,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    timestamp: DateTime<Utc>,
}

/// Posts run-completion payloads to configured webhook URLs.
#[derive(Clone)]
pub struct Notifier {
    pool: PgPool,
    client: reqwest::Client,
}

impl Notifier {
    /// Create a notifier with a 10 second delivery timeout.
    pub fn new(pool: PgPool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self { pool, client }
    }

    /// Notify the job's webhook, if one is configured, that a run
    /// completed. Spawns the delivery so the caller never waits on the
    /// remote endpoint.
    pub async fn run_completed(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        status: RunStatus,
        exit_code: Option<i32>,
        duration_ms: i64,
        error: Option<String>,
    ) {
        let target = match jobs::notify_target(&self.pool, job_id).await {
            Ok(Some((name, Some(url)))) => (name, url),
            Ok(_) => return,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Failed to look up notification target");
                return;
            }
        };
        let (job_name, url) = target;

        let body = serde_json::to_value(RunCompletedPayload {
            event: "run.completed",
            run_id,
            job_id,
            job_name: &job_name,
            status,
            exit_code,
            duration_ms,
            error: error.as_deref(),
            timestamp: Utc::now(),
        })
        .expect("payload serialization cannot fail");

        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(response) => {
                    debug!(run_id = %run_id, status = %response.status(), "Notification delivered");
                }
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Notification delivery failed");
                }
            }
        });
    }
}
