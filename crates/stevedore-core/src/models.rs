// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain types shared across the workspace.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a run. Maps to the Postgres `run_status` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "run_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Accepted and queued, not yet claimed by a worker.
    Pending,
    /// Claimed by a worker; the container is (or is about to be) executing.
    Running,
    /// Container exited with code 0.
    Succeeded,
    /// Container exited non-zero, a runtime fault occurred, the timeout
    /// fired, or the heartbeat expired.
    Failed,
    /// Container frozen by a pause command.
    Paused,
    /// Terminated by a kill command.
    Cancelled,
}

impl RunStatus {
    /// Whether this state has no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// A reusable container-execution template.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning user. Jobs are only visible to their owner.
    #[sqlx(rename = "user_id")]
    #[serde(rename = "user_id")]
    pub owner_id: Uuid,
    /// Name, unique per owner.
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Command override; empty means the image default.
    pub command: Vec<String>,
    /// Environment variables injected into the container.
    #[sqlx(json)]
    pub env: HashMap<String, String>,
    /// Memory limit in megabytes.
    pub memory_mb: i32,
    /// CPU allotment in millicores (1000 = 1 core).
    pub cpu_millicores: i32,
    /// Execution timeout in seconds; 0 disables enforcement.
    pub timeout_seconds: i32,
    /// Optional 5-field cron expression.
    pub schedule: Option<String>,
    /// Capability token for unauthenticated webhook triggering.
    pub webhook_token: Option<String>,
    /// Optional URL notified when a run reaches a terminal state.
    pub notify_webhook: Option<String>,
    /// Inactive jobs cannot be triggered or scheduled.
    pub is_active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// One execution attempt of a job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRun {
    /// Unique identifier.
    pub id: Uuid,
    /// The job this run executes.
    pub job_id: Uuid,
    /// Denormalised owner, for authorization and cascade.
    #[sqlx(rename = "user_id")]
    #[serde(rename = "user_id")]
    pub owner_id: Uuid,
    /// Current lifecycle state.
    pub status: RunStatus,
    /// Engine container id, set once the container is created.
    pub container_id: Option<String>,
    /// Process exit code, set at termination.
    pub exit_code: Option<i32>,
    /// Failure or cancellation detail.
    pub error_message: Option<String>,
    /// When the worker claimed the run.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// When the run was last paused; cleared on resume.
    pub paused_at: Option<DateTime<Utc>>,
    /// Last liveness stamp from the supervising worker.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// Captured stdout+stderr tail.
    pub logs_tail: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A durable marker that a run awaits execution.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueItem {
    /// Unique identifier.
    pub id: Uuid,
    /// The job to execute.
    pub job_id: Uuid,
    /// The run this row materialises.
    pub run_id: Uuid,
    /// Higher priority is claimed first.
    pub priority: i32,
    /// Earliest time the row is eligible for claiming.
    pub scheduled_at: DateTime<Utc>,
    /// Set when a worker claims the row; null while claimable.
    pub picked_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Payload for creating a job. Zero or absent resource fields receive
/// server-side defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateJob {
    /// Job name, unique per owner.
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Command override.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Memory limit in megabytes; 0 means the 512 MB default.
    #[serde(default)]
    pub memory_mb: i32,
    /// CPU millicores; 0 means the 1000 default.
    #[serde(default)]
    pub cpu_millicores: i32,
    /// Timeout in seconds; 0 means the 3600 default.
    #[serde(default)]
    pub timeout_seconds: i32,
    /// Optional 5-field cron expression.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Optional URL notified on run completion.
    #[serde(default)]
    pub notify_webhook: Option<String>,
}

impl CreateJob {
    /// Apply server-side defaults for unset resource fields.
    pub fn with_defaults(mut self) -> Self {
        if self.memory_mb == 0 {
            self.memory_mb = 512;
        }
        if self.cpu_millicores == 0 {
            self.cpu_millicores = 1000;
        }
        if self.timeout_seconds == 0 {
            self.timeout_seconds = 3600;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }

    #[test]
    fn create_job_defaults() {
        let job = CreateJob {
            name: "hello".into(),
            image: "alpine".into(),
            ..Default::default()
        }
        .with_defaults();

        assert_eq!(job.memory_mb, 512);
        assert_eq!(job.cpu_millicores, 1000);
        assert_eq!(job.timeout_seconds, 3600);
    }

    #[test]
    fn create_job_defaults_keep_explicit_values() {
        let job = CreateJob {
            name: "hello".into(),
            image: "alpine".into(),
            memory_mb: 128,
            cpu_millicores: 250,
            timeout_seconds: 60,
            ..Default::default()
        }
        .with_defaults();

        assert_eq!(job.memory_mb, 128);
        assert_eq!(job.cpu_millicores, 250);
        assert_eq!(job.timeout_seconds, 60);
    }

    #[test]
    fn run_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Succeeded).unwrap(),
            "\"succeeded\""
        );
        assert_eq!(
            serde_json::from_str::<RunStatus>("\"cancelled\"").unwrap(),
            RunStatus::Cancelled
        );
    }
}
