// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime for testing.
//!
//! Simulates container execution in memory with programmable behavior
//! per image: exit codes, run duration, canned logs, and pre-exec
//! failures. Pause/unpause is bookkeeping only; it does not stretch the
//! simulated run duration.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::traits::{ContainerRuntime, ContainerSpec, LogTail, Result, RuntimeError};

/// Programmable behavior for containers of one image.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Exit code of a natural exit.
    pub exit_code: i64,
    /// Simulated run duration in milliseconds.
    pub run_ms: u64,
    /// Canned log output.
    pub logs: String,
    /// Fail the image pull.
    pub fail_pull: bool,
    /// Fail container creation.
    pub fail_create: bool,
    /// Fail container start.
    pub fail_start: bool,
    /// Never exit naturally; only a stop resolves the wait.
    pub never_exit: bool,
    /// Exit code observed after a stop.
    pub stop_exit_code: i64,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            exit_code: 0,
            run_ms: 10,
            logs: String::new(),
            fail_pull: false,
            fail_create: false,
            fail_start: false,
            never_exit: false,
            stop_exit_code: 137,
        }
    }
}

struct MockContainer {
    behavior: MockBehavior,
    paused: bool,
    exit_tx: watch::Sender<Option<i64>>,
}

/// In-memory mock implementation of [`ContainerRuntime`].
#[derive(Default)]
pub struct MockRuntime {
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    containers: Mutex<HashMap<String, MockContainer>>,
    counter: AtomicU64,
}

impl MockRuntime {
    /// Create a mock runtime with default behavior for every image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Program the behavior of containers created from `image`.
    pub fn set_behavior(&self, image: &str, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(image.to_string(), behavior);
    }

    /// Whether the container exists and is currently paused.
    pub fn is_paused(&self, container_id: &str) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(container_id)
            .map(|c| c.paused)
            .unwrap_or(false)
    }

    /// Whether the container exists and has not exited.
    pub fn is_running(&self, container_id: &str) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(container_id)
            .map(|c| c.exit_tx.borrow().is_none())
            .unwrap_or(false)
    }

    /// Number of containers the runtime still knows about.
    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    fn behavior_for(&self, image: &str) -> MockBehavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.behavior_for(image).fail_pull {
            return Err(RuntimeError::Pull {
                image: image.to_string(),
                reason: "mock pull failure".to_string(),
            });
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let behavior = self.behavior_for(&spec.image);
        if behavior.fail_create {
            return Err(RuntimeError::Create("mock create failure".to_string()));
        }

        let id = format!("mock_{:016x}", self.counter.fetch_add(1, Ordering::SeqCst));
        let (exit_tx, _) = watch::channel(None);

        self.containers.lock().unwrap().insert(
            id.clone(),
            MockContainer {
                behavior,
                paused: false,
                exit_tx,
            },
        );

        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        let (behavior, exit_tx) = {
            let containers = self.containers.lock().unwrap();
            let container = containers
                .get(container_id)
                .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
            (container.behavior.clone(), container.exit_tx.clone())
        };

        if behavior.fail_start {
            return Err(RuntimeError::Start("mock start failure".to_string()));
        }

        if !behavior.never_exit {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(behavior.run_ms)).await;
                // A stop may already have resolved the exit.
                exit_tx.send_if_modified(|v| {
                    if v.is_none() {
                        *v = Some(behavior.exit_code);
                        true
                    } else {
                        false
                    }
                });
            });
        }

        Ok(())
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        let mut rx = {
            let containers = self.containers.lock().unwrap();
            let container = containers
                .get(container_id)
                .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
            container.exit_tx.subscribe()
        };

        let exit = rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|e| RuntimeError::Wait(e.to_string()))?;

        Ok(exit.expect("guarded by wait_for"))
    }

    async fn pause_container(&self, container_id: &str) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.paused = true;
        Ok(())
    }

    async fn unpause_container(&self, container_id: &str) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.paused = false;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, _grace_seconds: u32) -> Result<()> {
        // Force-kill semantics: stopping an unknown container is a no-op.
        let containers = self.containers.lock().unwrap();
        if let Some(container) = containers.get(container_id) {
            let code = container.behavior.stop_exit_code;
            container.exit_tx.send_if_modified(|v| {
                if v.is_none() {
                    *v = Some(code);
                    true
                } else {
                    false
                }
            });
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.containers.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn logs(&self, container_id: &str, _tail: LogTail) -> Result<String> {
        let containers = self.containers.lock().unwrap();
        let container = containers
            .get(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        Ok(container.behavior.logs.clone())
    }
}
