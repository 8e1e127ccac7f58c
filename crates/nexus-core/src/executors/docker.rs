// src/executors/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput; // For LogOutput::StdOut, LogOutput::StdErr
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    BuildImageOptionsBuilder,
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    KillContainerOptions as BollardKillContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    RemoveImageOptions as BollardRemoveImageOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::default::Default;
use tokio::sync::mpsc;

use super::runtime::{IsolationRuntime, LogChunk, UnitSpec};
use crate::errors::ExecutorError;

/// Docker implementation of the isolation runtime capability set.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform's default socket. The
    /// connection is lazy; reachability is only known after `ping`.
    pub fn connect() -> Result<Self, ExecutorError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl IsolationRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), ExecutorError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, ExecutorError> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(ExecutorError::BollardError(e)),
        }
    }

    async fn build_image(&self, tag: &str, context: Vec<u8>) -> Result<(), ExecutorError> {
        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(tag)
            .rm(true)
            .forcerm(true)
            .build();

        let mut build_stream =
            self.docker
                .build_image(options, None, Some(bollard::body_full(context.into())));

        while let Some(progress) = build_stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(detail) = info.error_detail {
                        return Err(ExecutorError::ImageBuildFailed(
                            detail.message.unwrap_or_else(|| "unknown build error".to_string()),
                        ));
                    }
                    if let Some(line) = info.stream {
                        let line = line.trim();
                        if !line.is_empty() {
                            log::trace!("build {}: {}", tag, line);
                        }
                    }
                }
                Err(e) => return Err(ExecutorError::ImageBuildFailed(e.to_string())),
            }
        }
        Ok(())
    }

    async fn create_unit(&self, spec: &UnitSpec) -> Result<String, ExecutorError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            user: Some(spec.user.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(spec.network_disabled),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_bytes),
                // Equal to memory: no swap on top of the ceiling.
                memory_swap: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                pids_limit: Some(spec.pids_limit),
                network_mode: Some(if spec.network_disabled { "none" } else { "bridge" }.to_string()),
                readonly_rootfs: Some(spec.read_only_rootfs),
                tmpfs: Some(spec.scratch_mounts.clone()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| ExecutorError::LaunchFailed(e.to_string()))?;
        Ok(container.id)
    }

    async fn start_unit(&self, unit_id: &str) -> Result<(), ExecutorError> {
        self.docker
            .start_container(unit_id, None::<BollardStartContainerOptionsQuery>)
            .await
            .map_err(|e| ExecutorError::LaunchFailed(e.to_string()))
    }

    async fn stream_logs(
        &self,
        unit_id: &str,
        sink: mpsc::UnboundedSender<LogChunk>,
    ) -> Result<(), ExecutorError> {
        let mut output_stream = self.docker.logs(
            unit_id,
            Some(BollardLogsOptionsQuery {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        while let Some(log_result) = output_stream.next().await {
            let chunk = match log_result? {
                LogOutput::StdOut { message } => LogChunk::Stdout(message.to_vec()),
                LogOutput::StdErr { message } => LogChunk::Stderr(message.to_vec()),
                _ => continue,
            };
            if sink.send(chunk).is_err() {
                // Receiver gone: the orchestrator stopped collecting.
                break;
            }
        }
        Ok(())
    }

    async fn wait_unit(&self, unit_id: &str) -> Result<i64, ExecutorError> {
        let mut wait_stream = self
            .docker
            .wait_container(unit_id, None::<BollardWaitContainerOptionsQuery>);

        match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(ExecutorError::BollardError(e)),
            None => Err(ExecutorError::RuntimeError(
                "Container wait stream ended unexpectedly".to_string(),
            )),
        }
    }

    async fn kill_unit(&self, unit_id: &str) -> Result<(), ExecutorError> {
        match self
            .docker
            .kill_container(unit_id, None::<BollardKillContainerOptionsQuery>)
            .await
        {
            Ok(()) => Ok(()),
            // Already gone or already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(ExecutorError::BollardError(e)),
        }
    }

    async fn remove_unit(&self, unit_id: &str) -> Result<(), ExecutorError> {
        let options = Some(BollardRemoveContainerOptionsQuery {
            force: true,
            v: true,
            ..Default::default()
        });
        match self.docker.remove_container(unit_id, options).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(ExecutorError::BollardError(e)),
        }
    }

    async fn remove_image(&self, tag: &str) -> Result<(), ExecutorError> {
        let options = Some(BollardRemoveImageOptionsQuery {
            force: true,
            ..Default::default()
        });
        match self.docker.remove_image(tag, options, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(ExecutorError::BollardError(e)),
        }
    }
}
