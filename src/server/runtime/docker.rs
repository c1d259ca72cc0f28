use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    EndpointSettings, HostConfig, RestartPolicy as DockerRestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{
    workload_labels, ContainerInfo, ContainerPhase, InstanceRuntime, Readiness, RuntimeEvent,
    ServiceInfo,
};
use crate::db::models::{ContainerSpec, Mount, RestartPolicy};

/// Sentinel "cluster ip" reported for the Docker pseudo-service; consumers
/// treat it like a headless service address.
pub const DOCKER_NETWORK_IP: &str = "docker-network";

/// Docker runtime adapter. A container attached to a managed bridge
/// network stands in for the workload; the network alias equal to the
/// service name stands in for the Service.
pub struct DockerRuntime {
    docker: Docker,
    network: String,
}

impl DockerRuntime {
    pub fn connect_local(network: impl Into<String>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            network: network.into(),
        })
    }

    async fn ensure_network(&self) -> Result<()> {
        if self.docker.inspect_network::<String>(&self.network, None).await.is_ok() {
            return Ok(());
        }
        let options = CreateNetworkOptions {
            name: self.network.clone(),
            driver: "bridge".to_string(),
            ..Default::default()
        };
        match self.docker.create_network(options).await {
            Ok(_) => {
                info!(network = self.network, "created docker network");
                Ok(())
            }
            // Racing creators are fine; the network exists either way.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(e).context("Failed to create docker network"),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.with_context(|| format!("Failed to pull image {}", image))?;
            if let Some(error) = progress.error {
                bail!("Failed to pull image {}: {}", image, error);
            }
        }
        Ok(())
    }

    fn binds_from_mounts(mounts: &[Mount]) -> Result<Option<Vec<String>>> {
        let mut binds = Vec::new();
        for mount in mounts {
            match mount {
                Mount::HostPath {
                    mount_path,
                    host_path,
                    read_only,
                    ..
                } => {
                    let mode = if *read_only { ":ro" } else { "" };
                    binds.push(format!("{}:{}{}", host_path, mount_path, mode));
                }
                Mount::Pvc { pvc_name, .. } => {
                    bail!("pvc mount {} is not supported by the docker runtime", pvc_name)
                }
                Mount::ConfigMap {
                    config_map_name, ..
                } => bail!(
                    "configMap mount {} is not supported by the docker runtime",
                    config_map_name
                ),
            }
        }
        Ok((!binds.is_empty()).then_some(binds))
    }

    fn restart_policy(policy: RestartPolicy) -> DockerRestartPolicy {
        let name = match policy {
            RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
            RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
            RestartPolicy::Never => RestartPolicyNameEnum::NO,
        };
        DockerRestartPolicy {
            name: Some(name),
            ..Default::default()
        }
    }

    fn container_config(&self, spec: &ContainerSpec) -> Result<Config<String>> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let mut full_command = spec.command.clone();
        full_command.extend(spec.args.iter().cloned());

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(format!("{}/tcp", spec.port), HashMap::new());

        let mut endpoints = HashMap::new();
        endpoints.insert(
            self.network.clone(),
            EndpointSettings {
                aliases: Some(vec![spec.service_name.clone()]),
                ..Default::default()
            },
        );

        Ok(Config {
            image: Some(spec.image.clone()),
            cmd: (!full_command.is_empty()).then_some(full_command),
            env: (!env.is_empty()).then_some(env),
            working_dir: (!spec.working_dir.is_empty()).then(|| spec.working_dir.clone()),
            labels: Some(workload_labels(spec).into_iter().collect()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                binds: Self::binds_from_mounts(&spec.mounts)?,
                restart_policy: Some(Self::restart_policy(spec.restart_policy)),
                network_mode: Some(self.network.clone()),
                ..Default::default()
            }),
            networking_config: Some(bollard::container::NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        })
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
}

fn phase_from_state(status: Option<&str>) -> ContainerPhase {
    match status.unwrap_or_default() {
        "running" => ContainerPhase::Running,
        "created" | "restarting" | "paused" => ContainerPhase::Pending,
        _ => ContainerPhase::Stopped,
    }
}

#[async_trait]
impl InstanceRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.ensure_network().await?;
        self.pull_image(&spec.image).await?;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let config = self.container_config(spec)?;
        self.docker
            .create_container(Some(options), config)
            .await
            .with_context(|| format!("Failed to create container {}", spec.name))?;

        if let Err(err) = self
            .docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
        {
            // Roll the half-created container back before surfacing.
            if let Err(cleanup_err) = self.delete_container(&spec.name).await {
                debug!(container = spec.name, error = %cleanup_err, "rollback delete failed");
            }
            return Err(err).with_context(|| format!("Failed to start container {}", spec.name));
        }

        Ok(spec.name.clone())
    }

    async fn delete_container(&self, name: &str) -> Result<()> {
        // Stop errors are tolerated; force removal handles a wedged stop.
        if let Err(err) = self.docker.stop_container(name, None).await {
            if !Self::is_not_found(&err) {
                warn!(container = name, error = %err, "stop before remove failed");
            }
        }
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if Self::is_not_found(&err) => Ok(()),
            Err(err) => Err(err).with_context(|| format!("Failed to remove container {}", name)),
        }
    }

    async fn scale_container(&self, name: &str, replicas: i32) -> Result<()> {
        if replicas == 0 {
            return self.delete_container(name).await;
        }
        bail!("docker runtime only supports scaling to zero, got {}", replicas)
    }

    async fn restart_container(&self, spec: &ContainerSpec) -> Result<()> {
        match self.docker.inspect_container(&spec.name, None).await {
            Ok(_) => {
                self.delete_container(&spec.name).await?;
            }
            Err(err) if Self::is_not_found(&err) => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to inspect container {}", spec.name))
            }
        }
        self.create_container(spec).await?;
        Ok(())
    }

    async fn container_info(&self, name: &str) -> Result<ContainerInfo> {
        let inspect = self
            .docker
            .inspect_container(name, None)
            .await
            .with_context(|| format!("Failed to inspect container {}", name))?;

        let status = inspect
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string());

        let ip = inspect
            .network_settings
            .as_ref()
            .and_then(|settings| settings.networks.as_ref())
            .and_then(|networks| networks.get(&self.network))
            .and_then(|endpoint| endpoint.ip_address.clone())
            .filter(|ip| !ip.is_empty());

        let ports = inspect
            .config
            .as_ref()
            .and_then(|c| c.exposed_ports.as_ref())
            .map(|ports| {
                ports
                    .keys()
                    .filter_map(|key| key.split('/').next()?.parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        let created_at = inspect
            .created
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(ContainerInfo {
            name: name.to_string(),
            phase: phase_from_state(status.as_deref()),
            ip,
            ports,
            labels: inspect
                .config
                .as_ref()
                .and_then(|c| c.labels.clone())
                .map(|labels| labels.into_iter().collect())
                .unwrap_or_default(),
            created_at,
        })
    }

    async fn container_readiness(&self, name: &str) -> Result<Readiness> {
        let inspect = self
            .docker
            .inspect_container(name, None)
            .await
            .with_context(|| format!("Failed to inspect container {}", name))?;

        let state = inspect.state.unwrap_or_default();
        let running = state.running.unwrap_or(false);
        let message = if running {
            String::new()
        } else {
            let status = state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let error = state.error.unwrap_or_default();
            format!("container is {} {}", status, error).trim_end().to_string()
        };

        Ok(Readiness {
            ready: running,
            message,
        })
    }

    async fn container_logs(&self, name: &str, tail_lines: i64) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail_lines.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Failed to read logs from {}", name))?;
            output.push_str(&chunk.to_string());
        }
        Ok(output)
    }

    async fn container_events(&self, _name: &str) -> Result<Vec<RuntimeEvent>> {
        // The daemon has no object-scoped event store comparable to the
        // cluster's; callers get an empty list.
        Ok(Vec::new())
    }

    async fn container_warning_events(&self, _name: &str) -> Result<Vec<RuntimeEvent>> {
        Ok(Vec::new())
    }

    async fn create_service(&self, spec: &ContainerSpec) -> Result<String> {
        // The network alias is attached at container creation; all the
        // pseudo-service needs is the network itself.
        self.ensure_network().await?;
        Ok(spec.service_name.clone())
    }

    async fn delete_service(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<ServiceInfo> {
        let filters: HashMap<String, Vec<String>> = [(
            "label".to_string(),
            vec![format!("{}={}", super::LABEL_APP, service_to_container(name))],
        )]
        .into();
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list containers for service lookup")?;

        let container = containers
            .first()
            .ok_or_else(|| anyhow!("service {} not found", name))?;

        let ports = container
            .ports
            .as_ref()
            .map(|ports| ports.iter().map(|p| p.private_port as i32).collect())
            .unwrap_or_default();

        Ok(ServiceInfo {
            name: name.to_string(),
            cluster_ip: Some(DOCKER_NETWORK_IP.to_string()),
            ports,
        })
    }

    async fn restart_service(&self, _spec: &ContainerSpec) -> Result<()> {
        self.ensure_network().await?;
        Ok(())
    }
}

/// Derived container name for a service name; the compiler generates both
/// from the same instance id prefix.
fn service_to_container(service_name: &str) -> String {
    service_name
        .strip_suffix("-service")
        .map(|stem| format!("{}-container", stem))
        .unwrap_or_else(|| service_name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_maps_back_to_container_name() {
        assert_eq!(
            service_to_container("mcp-instance-a1b2c3d4-service"),
            "mcp-instance-a1b2c3d4-container"
        );
        assert_eq!(service_to_container("plain"), "plain");
    }

    #[test]
    fn phase_mapping_covers_docker_states() {
        assert_eq!(phase_from_state(Some("running")), ContainerPhase::Running);
        assert_eq!(phase_from_state(Some("created")), ContainerPhase::Pending);
        assert_eq!(phase_from_state(Some("exited")), ContainerPhase::Stopped);
        assert_eq!(phase_from_state(None), ContainerPhase::Stopped);
    }

    #[test]
    fn host_path_mounts_become_binds_and_pvc_is_rejected() {
        let binds = DockerRuntime::binds_from_mounts(&[Mount::HostPath {
            mount_path: "/data".to_string(),
            host_path: "/var/lib/data".to_string(),
            node_name: "ignored".to_string(),
            read_only: true,
            sub_path: String::new(),
        }])
        .unwrap()
        .unwrap();
        assert_eq!(binds, vec!["/var/lib/data:/data:ro".to_string()]);

        let err = DockerRuntime::binds_from_mounts(&[Mount::Pvc {
            mount_path: "/data".to_string(),
            pvc_name: "claim".to_string(),
            read_only: false,
            sub_path: String::new(),
        }])
        .unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[tokio::test]
    async fn scaling_to_nonzero_is_rejected() {
        // Connection setup is lazy, so no daemon is needed for this check.
        let Ok(runtime) = DockerRuntime::connect_local("mcp-net") else {
            return;
        };
        let err = runtime.scale_container("anything", 2).await.unwrap_err();
        assert!(err.to_string().contains("scaling to zero"));
    }
}
