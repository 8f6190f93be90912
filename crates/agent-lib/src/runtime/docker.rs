//! Docker implementation of the container runtime contract

use super::{ContainerInspect, ContainerRuntime, ContainerSpec, RuntimeStatsSample};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StatsOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{EndpointIpamConfig, EndpointSettings, HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const CPUS_TO_NANO_CPUS: f64 = 1_000_000_000.0;

/// Docker-backed [`ContainerRuntime`].
#[derive(Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon at `socket`, falling back to the local
    /// defaults.
    pub fn connect(socket: &str) -> Result<Self> {
        let client = Docker::connect_with_unix(socket, 120, bollard::API_DEFAULT_VERSION)
            .or_else(|_| Docker::connect_with_local_defaults())
            .context("Failed to connect to the Docker daemon")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|(host, container)| Mount {
                source: Some(host.to_string_lossy().to_string()),
                target: Some(container.to_string_lossy().to_string()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            nano_cpus: Some((spec.cpus * CPUS_TO_NANO_CPUS).ceil() as i64),
            memory: Some(spec.memory_bytes as i64),
            network_mode: spec.network.clone(),
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            ..Default::default()
        };

        let networking_config = match (&spec.network, &spec.ipv4_address) {
            (Some(network), Some(address)) => {
                let endpoint = EndpointSettings {
                    ipam_config: Some(EndpointIpamConfig {
                        ipv4_address: Some(address.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                Some(bollard::container::NetworkingConfig {
                    endpoints_config: HashMap::from([(network.clone(), endpoint)]),
                })
            }
            _ => None,
        };

        let env: Vec<String> = spec
            .environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let response = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .with_context(|| format!("Failed to create container '{}'", spec.name))?;

        info!(name = %spec.name, id = %response.id, "Created container");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("Failed to start container '{}'", id))?;
        info!(id = %id, "Started container");
        Ok(())
    }

    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()> {
        self.client
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .with_context(|| format!("Failed to stop container '{}'", name))?;
        info!(name = %name, "Stopped container");
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.client
            .remove_container(name, None::<RemoveContainerOptions>)
            .await
            .with_context(|| format!("Failed to remove container '{}'", name))?;
        info!(name = %name, "Removed container");
        Ok(())
    }

    async fn container_logs(&self, name: &str) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = self.client.logs(name, Some(options));
        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Failed to read logs of '{}'", name))?;
            logs.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(logs)
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInspect> {
        let response = self
            .client
            .inspect_container(name, None)
            .await
            .with_context(|| format!("Failed to inspect container '{}'", name))?;

        let status = response
            .state
            .as_ref()
            .and_then(|state| state.status.as_ref())
            .map(|status| status.to_string());
        let host_config = response.host_config.as_ref();
        let cpu_limit = host_config
            .and_then(|hc| hc.nano_cpus)
            .map(|nano| nano as f64 / CPUS_TO_NANO_CPUS);
        let memory_limit_bytes = host_config
            .and_then(|hc| hc.memory)
            .and_then(|m| u64::try_from(m).ok());

        Ok(ContainerInspect {
            status,
            cpu_limit,
            memory_limit_bytes,
        })
    }

    async fn container_stats(&self, name: &str, nic: &str) -> Result<RuntimeStatsSample> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let stats = self
            .client
            .stats(name, Some(options))
            .next()
            .await
            .with_context(|| format!("No stats returned for container '{}'", name))?
            .with_context(|| format!("Failed to read stats for container '{}'", name))?;

        let network = stats.networks.as_ref().and_then(|n| n.get(nic));

        Ok(RuntimeStatsSample {
            cpu_total_usage: Some(stats.cpu_stats.cpu_usage.total_usage),
            precpu_total_usage: Some(stats.precpu_stats.cpu_usage.total_usage),
            system_cpu_usage: stats.cpu_stats.system_cpu_usage,
            presystem_cpu_usage: stats.precpu_stats.system_cpu_usage,
            online_cpus: stats.cpu_stats.online_cpus,
            memory_usage_bytes: stats.memory_stats.usage,
            rx_bytes: network.map(|n| n.rx_bytes),
            tx_bytes: network.map(|n| n.tx_bytes),
        })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        debug!(image = %image, "Pulling image");
        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = stream.next().await {
            progress.with_context(|| format!("Failed to pull image '{}'", image))?;
        }
        info!(image = %image, "Pulled image");
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        let images = self
            .client
            .list_images(None::<ListImagesOptions<String>>)
            .await
            .context("Failed to list images")?;

        Ok(images
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .collect())
    }
}
