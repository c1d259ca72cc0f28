pub mod affinity;
pub mod docker;
pub mod kubernetes;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::models::{ContainerSpec, Environment, EnvironmentType};
use crate::server::instance::error::{InstanceError, InstanceResult};

pub use docker::DockerRuntime;
pub use kubernetes::KubernetesRuntime;

/// Label carrying the owning app name; doubles as the service selector.
pub const LABEL_APP: &str = "app";
/// Label carrying the instance id.
pub const LABEL_INSTANCE: &str = "instance";
pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const MANAGED_BY: &str = "mcp-control";

/// Coarse workload phase, derived per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerPhase {
    Running,
    Pending,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub phase: ContainerPhase,
    pub ip: Option<String>,
    pub ports: Vec<i32>,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ContainerInfo {
    /// Creation timestamp as RFC3339, the format reported to operators.
    pub fn created_at_rfc3339(&self) -> String {
        self.created_at.to_rfc3339()
    }
}

#[derive(Debug, Clone)]
pub struct Readiness {
    pub ready: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub event_type: String,
    pub reason: String,
    pub message: String,
    pub object: String,
    pub last_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub cluster_ip: Option<String>,
    pub ports: Vec<i32>,
}

/// Container + service CRUD behind one interface. Implemented for
/// Kubernetes (Deployment + headless Service) and Docker (container on a
/// managed network, the network alias standing in for the service).
///
/// All operations surface the underlying error; `create_container` rolls
/// back whatever it partially created before returning one.
#[async_trait]
pub trait InstanceRuntime: Send + Sync {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn delete_container(&self, name: &str) -> Result<()>;
    /// Kubernetes scales the Deployment. Docker only supports 0, which
    /// delegates to delete.
    async fn scale_container(&self, name: &str, replicas: i32) -> Result<()>;
    /// Delete-then-recreate; creates outright when the workload is gone.
    async fn restart_container(&self, spec: &ContainerSpec) -> Result<()>;
    async fn container_info(&self, name: &str) -> Result<ContainerInfo>;
    async fn container_readiness(&self, name: &str) -> Result<Readiness>;
    async fn container_logs(&self, name: &str, tail_lines: i64) -> Result<String>;
    async fn container_events(&self, name: &str) -> Result<Vec<RuntimeEvent>>;
    async fn container_warning_events(&self, name: &str) -> Result<Vec<RuntimeEvent>>;

    async fn create_service(&self, spec: &ContainerSpec) -> Result<String>;
    async fn delete_service(&self, name: &str) -> Result<()>;
    async fn get_service(&self, name: &str) -> Result<ServiceInfo>;
    async fn restart_service(&self, spec: &ContainerSpec) -> Result<()>;
}

/// Builds one runtime adapter per environment. Adapters are cheap and the
/// database stays the source of truth, so no client cache is kept.
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    async fn for_environment(
        &self,
        environment: &Environment,
    ) -> InstanceResult<Arc<dyn InstanceRuntime>>;
}

pub struct DefaultRuntimeFactory {
    docker_network: String,
}

impl DefaultRuntimeFactory {
    pub fn new(docker_network: impl Into<String>) -> Self {
        Self {
            docker_network: docker_network.into(),
        }
    }
}

#[async_trait]
impl RuntimeFactory for DefaultRuntimeFactory {
    async fn for_environment(
        &self,
        environment: &Environment,
    ) -> InstanceResult<Arc<dyn InstanceRuntime>> {
        match environment.env_type {
            EnvironmentType::Kubernetes => {
                let runtime = KubernetesRuntime::from_environment(environment)
                    .await
                    .map_err(InstanceError::upstream)?;
                Ok(Arc::new(runtime))
            }
            EnvironmentType::Docker => {
                let runtime = DockerRuntime::connect_local(&self.docker_network)
                    .map_err(InstanceError::upstream)?;
                Ok(Arc::new(runtime))
            }
        }
    }
}

/// Validate an environment before it is registered: Kubernetes
/// environments must carry kubeconfig YAML that actually parses.
pub fn validate_environment(environment: &Environment) -> InstanceResult<()> {
    if environment.name.is_empty() {
        return Err(InstanceError::validation("environment name is required"));
    }
    if environment.env_type == EnvironmentType::Kubernetes {
        serde_yaml::from_str::<kube::config::Kubeconfig>(&environment.config).map_err(|err| {
            InstanceError::validation(format!(
                "environment {} has an invalid kubeconfig: {}",
                environment.name, err
            ))
        })?;
    }
    Ok(())
}

/// Labels attached to every managed workload: the compiled spec's labels
/// plus the `app`/`instance`/`managed-by` triple the gateway and the
/// reconciler rely on.
pub fn workload_labels(spec: &ContainerSpec) -> BTreeMap<String, String> {
    let mut labels = spec.labels.clone();
    labels.insert(LABEL_APP.to_string(), spec.name.clone());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::RestartPolicy;

    fn spec_with_labels(labels: &[(&str, &str)]) -> ContainerSpec {
        ContainerSpec {
            image: "img:1".to_string(),
            name: "mcp-instance-a1b2c3d4-container".to_string(),
            service_name: "mcp-instance-a1b2c3d4-service".to_string(),
            port: 8080,
            command: vec!["/bin/sh".to_string()],
            args: vec![],
            env: BTreeMap::new(),
            mounts: vec![],
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            restart_policy: RestartPolicy::Always,
            working_dir: "/app".to_string(),
        }
    }

    #[test]
    fn workload_labels_always_carry_the_managed_triple() {
        let spec = spec_with_labels(&[("instance", "a1b2c3d4ffff")]);
        let labels = workload_labels(&spec);
        assert_eq!(
            labels.get(LABEL_APP).map(String::as_str),
            Some("mcp-instance-a1b2c3d4-container")
        );
        assert_eq!(labels.get(LABEL_MANAGED_BY).map(String::as_str), Some(MANAGED_BY));
        assert_eq!(labels.get(LABEL_INSTANCE).map(String::as_str), Some("a1b2c3d4ffff"));
    }

    #[test]
    fn kubernetes_environments_need_a_parseable_kubeconfig() {
        let mut environment = crate::testutil::kubernetes_environment(1);
        environment.config = "clusters: [not, a, kubeconfig".to_string();
        let err = validate_environment(&environment).unwrap_err();
        assert!(matches!(err, InstanceError::Validation(_)));

        environment.config = concat!(
            "apiVersion: v1\n",
            "kind: Config\n",
            "clusters: []\n",
            "contexts: []\n",
            "users: []\n",
        )
        .to_string();
        validate_environment(&environment).unwrap();

        // Docker environments carry no kubeconfig at all.
        let mut docker = crate::testutil::kubernetes_environment(2);
        docker.env_type = EnvironmentType::Docker;
        docker.config = String::new();
        validate_environment(&docker).unwrap();
    }
}
