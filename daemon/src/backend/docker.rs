//! Docker runtime implementation.
//!
//! Talks to the local Docker daemon through bollard. One client is shared by
//! every worker; bollard's client is safe for concurrent use.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, instrument};

use super::{ContainerRuntime, UnitOutput, UnitSpec};

/// Runtime backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect with local defaults (`DOCKER_HOST` or the platform socket) and
    /// verify the daemon answers.
    pub async fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker")?;
        docker.ping().await.context("Docker ping failed")?;
        Ok(Self { docker })
    }

    /// Pull `image` unless it is already present locally.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!(image = %image, "Image already present");
                return Ok(());
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to inspect image {image}"));
            }
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.with_context(|| format!("Failed to pull image {image}"))?;
            if let Some(status) = progress.status {
                debug!(image = %image, status = %status, "Pull progress");
            }
        }
        info!(image = %image, "Image pulled");
        Ok(())
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Raw log bytes, decoded once at the end so a character split across
/// frames survives.
#[derive(Debug, Default)]
struct LogBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LogBuffers {
    fn push(&mut self, frame: LogOutput) {
        match frame {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                self.stdout.extend_from_slice(&message);
            }
            LogOutput::StdErr { message } => self.stderr.extend_from_slice(&message),
            LogOutput::StdIn { .. } => {}
        }
    }

    fn into_output(self) -> UnitOutput {
        UnitOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
        }
    }
}

/// Translate a unit spec into the container create request.
fn container_config(spec: &UnitSpec) -> Config<String> {
    let profile = &spec.profile;

    let ulimits = profile
        .ulimits
        .iter()
        .map(|limit| ResourcesUlimits {
            name: Some(limit.name.to_string()),
            soft: Some(limit.soft),
            hard: Some(limit.hard),
        })
        .collect();

    // Empty options = runtime tmpfs defaults
    let tmpfs = HashMap::from([(profile.scratch_dir.clone(), String::new())]);

    Config {
        image: Some(profile.image.clone()),
        cmd: Some(spec.command.clone()),
        user: Some(profile.user.clone()),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            tmpfs: Some(tmpfs),
            privileged: Some(false),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            memory: Some(profile.memory_bytes),
            nano_cpus: Some(profile.nano_cpus),
            pids_limit: Some(profile.pids_limit),
            ulimits: Some(ulimits),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(image = %spec.profile.image))]
    async fn create(&self, spec: &UnitSpec) -> Result<String> {
        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, container_config(spec))
            .await
            .context("Failed to create container")?;

        for warning in &response.warnings {
            debug!(unit = %response.id, warning = %warning, "Container create warning");
        }
        Ok(response.id)
    }

    async fn start(&self, unit: &str) -> Result<()> {
        self.docker
            .start_container(unit, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start container")
    }

    async fn wait(&self, unit: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(unit, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e).context("Container wait failed"),
            None => anyhow::bail!("Container wait stream ended without a status"),
        }
    }

    async fn logs(&self, unit: &str) -> Result<UnitOutput> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(unit, Some(options));

        let mut buffers = LogBuffers::default();
        while let Some(chunk) = stream.next().await {
            buffers.push(chunk.context("Failed to read container logs")?);
        }
        Ok(buffers.into_output())
    }

    async fn remove(&self, unit: &str) -> Result<()> {
        if let Err(e) = self
            .docker
            .stop_container(unit, Some(StopContainerOptions { t: 0 }))
            .await
        {
            // Already stopped units reject the stop; force-remove handles the rest
            debug!(unit = %unit, error = %e, "Stop before remove failed");
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(unit, Some(options))
            .await
            .context("Failed to remove container")
    }

    async fn oom_killed(&self, unit: &str) -> Result<Option<bool>> {
        let details = self
            .docker
            .inspect_container(unit, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;
        Ok(details.state.and_then(|state| state.oom_killed))
    }
}
