// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker implementation of [`ContainerRuntime`].
//!
//! Talks to the local Docker daemon through bollard. Log output is
//! demultiplexed from the engine's framed stdout/stderr stream into a
//! single text blob; stderr is not distinguished in the stored tail.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use futures_util::stream::TryStreamExt;
use tracing::{debug, warn};

use super::traits::{ContainerRuntime, ContainerSpec, LogTail, Result, RuntimeError};

/// Container runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and verify the connection.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Engine(format!("connecting to docker daemon: {e}")))?;

        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Engine(format!("pinging docker daemon: {e}")))?;

        Ok(Self { docker })
    }

    /// Inspect a container's recorded exit code. Fallback for wait-stream
    /// faults.
    async fn inspect_exit_code(&self, container_id: &str) -> Option<i64> {
        let details = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .ok()?;
        details.state?.exit_code
    }
}

fn map_err(err: bollard::errors::Error, container_id: &str) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(container_id.to_string()),
        other => RuntimeError::Engine(other.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn runtime_type(&self) -> &'static str {
        "docker"
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        debug!(image, "Pulling image");

        let options = Some(CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        });

        let mut pull_stream = self.docker.create_image(options, None, None);
        while let Some(progress) = pull_stream.try_next().await.map_err(|e| RuntimeError::Pull {
            image: image.to_string(),
            reason: e.to_string(),
        })? {
            if let Some(status) = progress.status {
                debug!(image, status, "Pull progress");
            }
        }

        debug!(image, "Image ready");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes()),
            nano_cpus: Some(spec.nano_cpus()),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        });

        let container = self
            .docker
            .create_container(options, body)
            .await
            .map_err(|e| RuntimeError::Create(e.to_string()))?;

        debug!(container_id = %container.id, name = %spec.name, "Container created");
        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await
            .map_err(|e| RuntimeError::Start(e.to_string()))
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        // "next-exit" observes the exit that follows registration, so a
        // wait registered before start cannot resolve against a stale
        // created-but-never-started state.
        let options = Some(WaitContainerOptions {
            condition: "next-exit".to_string(),
            ..Default::default()
        });

        let mut wait_stream = self.docker.wait_container(container_id, options);

        match wait_stream.try_next().await {
            Ok(Some(response)) => {
                debug!(container_id, status_code = response.status_code, "Container exited");
                Ok(response.status_code)
            }
            Ok(None) => {
                // Stream ended without a status; recover via inspect.
                match self.inspect_exit_code(container_id).await {
                    Some(code) => Ok(code),
                    None => Err(RuntimeError::Wait(
                        "wait stream ended without a status".to_string(),
                    )),
                }
            }
            Err(e) => match self.inspect_exit_code(container_id).await {
                Some(code) => {
                    warn!(container_id, error = %e, "Wait stream failed, recovered exit code via inspect");
                    Ok(code)
                }
                None => Err(RuntimeError::Wait(e.to_string())),
            },
        }
    }

    async fn pause_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .pause_container(container_id)
            .await
            .map_err(|e| map_err(e, container_id))
    }

    async fn unpause_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .unpause_container(container_id)
            .await
            .map_err(|e| map_err(e, container_id))
    }

    async fn stop_container(&self, container_id: &str, grace_seconds: u32) -> Result<()> {
        let options = Some(StopContainerOptions {
            t: Some(grace_seconds as i32),
            ..Default::default()
        });

        self.docker
            .stop_container(container_id, options)
            .await
            .map_err(|e| map_err(e, container_id))
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let options = Some(RemoveContainerOptions {
            force: true,
            v: true,
            link: false,
        });

        self.docker
            .remove_container(container_id, options)
            .await
            .map_err(|e| map_err(e, container_id))
    }

    async fn logs(&self, container_id: &str, tail: LogTail) -> Result<String> {
        let options = Some(LogsOptions {
            stdout: true,
            stderr: true,
            since: 0,
            until: 0,
            timestamps: false,
            follow: false,
            tail: tail.to_string(),
        });

        let mut logs_stream = self.docker.logs(container_id, options);
        let mut collected = String::new();

        while let Some(output) = logs_stream
            .try_next()
            .await
            .map_err(|e| map_err(e, container_id))?
        {
            match output {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                    collected.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }

        Ok(super::clip_logs(&collected))
    }
}
