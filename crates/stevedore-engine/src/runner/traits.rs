// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime trait definitions.
//!
//! Defines the abstract interface supervisors use to drive containers.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from container runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// Image could not be pulled.
    #[error("pulling image {image}: {reason}")]
    Pull {
        /// Image reference.
        image: String,
        /// Engine-reported cause.
        reason: String,
    },

    /// Container could not be created.
    #[error("creating container: {0}")]
    Create(String),

    /// Container could not be started.
    #[error("starting container: {0}")]
    Start(String),

    /// Waiting for the container failed. Distinct from a non-zero exit,
    /// which is reported through the exit code.
    #[error("waiting for container: {0}")]
    Wait(String),

    /// The container is not known to the engine.
    #[error("no such container: {0}")]
    NotFound(String),

    /// Any other engine fault.
    #[error("container engine: {0}")]
    Engine(String),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Parameters for creating a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command override; empty means the image default.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Memory limit in megabytes.
    pub memory_mb: i64,
    /// CPU allotment in millicores (1000 = 1 core).
    pub cpu_millicores: i64,
}

impl ContainerSpec {
    /// Memory limit in bytes, as the engine wants it.
    pub fn memory_bytes(&self) -> i64 {
        self.memory_mb * 1024 * 1024
    }

    /// CPU allotment in nano-CPUs, as the engine wants it.
    pub fn nano_cpus(&self) -> i64 {
        self.cpu_millicores * 1_000_000
    }
}

/// How much of the log stream to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTail {
    /// The entire stream.
    All,
    /// The last `n` lines.
    Last(u32),
}

impl fmt::Display for LogTail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTail::All => f.write_str("all"),
            LogTail::Last(n) => write!(f, "{n}"),
        }
    }
}

/// Trait for container runtimes.
///
/// Implementations are pure execution engines and never touch the
/// database; persistence is the caller's concern.
///
/// # Wait ordering contract
///
/// [`wait_container`](ContainerRuntime::wait_container) observes the
/// container's *next* exit. Supervisors must register the wait future
/// before calling [`start_container`](ContainerRuntime::start_container),
/// otherwise a fast-exiting container's exit event can be lost.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g. "docker", "mock").
    fn runtime_type(&self) -> &'static str;

    /// Ensure the image is locally present. Blocks until done; a no-op
    /// when cached.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a container without starting it. Applies resource limits
    /// and a no-new-privileges restriction. Returns the container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Begin execution of a created container.
    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Block until the container exits and return its exit code. An error
    /// is returned only on engine faults, never for a non-zero exit.
    async fn wait_container(&self, container_id: &str) -> Result<i64>;

    /// Freeze a running container.
    async fn pause_container(&self, container_id: &str) -> Result<()>;

    /// Thaw a paused container.
    async fn unpause_container(&self, container_id: &str) -> Result<()>;

    /// Gracefully stop a container, force-killing after `grace_seconds`.
    async fn stop_container(&self, container_id: &str, grace_seconds: u32) -> Result<()>;

    /// Remove a container; force-kill acceptable.
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Fetch stdout+stderr as one demultiplexed text blob.
    async fn logs(&self, container_id: &str, tail: LogTail) -> Result<String>;
}
