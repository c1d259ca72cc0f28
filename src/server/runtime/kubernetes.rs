use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, ReplicaSet};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, Event, HostPathVolumeSource, Node,
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    workload_labels, ContainerInfo, ContainerPhase, InstanceRuntime, Readiness, RuntimeEvent,
    ServiceInfo, LABEL_APP, LABEL_INSTANCE,
};
use crate::db::models::{ContainerSpec, Environment, Mount};
use crate::server::runtime::affinity::{self, ClusterInventory};

/// Attempts the restart observer makes while waiting for a foreground
/// deletion to finalize before recreating the workload.
const RESTART_WAIT_ATTEMPTS: u32 = 30;
const RESTART_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Kubernetes runtime adapter: one instance maps to a single-replica
/// Deployment plus a headless Service in the environment's namespace.
#[derive(Clone)]
pub struct KubernetesRuntime {
    client: Client,
    namespace: String,
}

impl KubernetesRuntime {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Build a client from the kubeconfig text stored on the environment.
    pub async fn from_environment(environment: &Environment) -> Result<Self> {
        let kubeconfig: Kubeconfig = serde_yaml::from_str(&environment.config)
            .with_context(|| format!("Invalid kubeconfig for environment {}", environment.name))?;
        let config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .with_context(|| {
                    format!("Failed to load kubeconfig for environment {}", environment.name)
                })?;
        let client = Client::try_from(config).context("Failed to build Kubernetes client")?;

        let namespace = if environment.namespace.is_empty() {
            "default".to_string()
        } else {
            environment.namespace.clone()
        };
        Ok(Self::new(client, namespace))
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Selector shared by the Deployment and the Service: the app label
    /// plus the instance label when the compiled spec carries one.
    fn selector_labels(spec: &ContainerSpec) -> BTreeMap<String, String> {
        let mut selector = BTreeMap::new();
        selector.insert(LABEL_APP.to_string(), spec.name.clone());
        if let Some(instance) = spec.labels.get(LABEL_INSTANCE) {
            selector.insert(LABEL_INSTANCE.to_string(), instance.clone());
        }
        selector
    }

    fn build_deployment(
        &self,
        spec: &ContainerSpec,
        affinity: Option<k8s_openapi::api::core::v1::Affinity>,
    ) -> Deployment {
        let labels = workload_labels(spec);
        let selector = Self::selector_labels(spec);

        let mut volumes = Vec::new();
        let mut volume_mounts = Vec::new();
        for (index, mount) in spec.mounts.iter().enumerate() {
            let volume_name = format!("vol-{}", index);
            let (source, mount_path, read_only, sub_path) = match mount {
                Mount::HostPath {
                    mount_path,
                    host_path,
                    read_only,
                    sub_path,
                    ..
                } => (
                    Volume {
                        name: volume_name.clone(),
                        host_path: Some(HostPathVolumeSource {
                            path: host_path.clone(),
                            type_: None,
                        }),
                        ..Default::default()
                    },
                    mount_path,
                    *read_only,
                    sub_path,
                ),
                Mount::Pvc {
                    mount_path,
                    pvc_name,
                    read_only,
                    sub_path,
                } => (
                    Volume {
                        name: volume_name.clone(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: pvc_name.clone(),
                            read_only: Some(*read_only),
                        }),
                        ..Default::default()
                    },
                    mount_path,
                    *read_only,
                    sub_path,
                ),
                Mount::ConfigMap {
                    mount_path,
                    config_map_name,
                    read_only,
                    sub_path,
                } => (
                    Volume {
                        name: volume_name.clone(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: config_map_name.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    mount_path,
                    *read_only,
                    sub_path,
                ),
            };
            volumes.push(source);
            volume_mounts.push(VolumeMount {
                name: volume_name,
                mount_path: mount_path.clone(),
                read_only: Some(read_only),
                sub_path: (!sub_path.is_empty()).then(|| sub_path.clone()),
                ..Default::default()
            });
        }

        let env: Vec<EnvVar> = spec
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();

        let container = Container {
            name: "mcp".to_string(),
            image: Some(spec.image.clone()),
            command: (!spec.command.is_empty()).then(|| spec.command.clone()),
            args: (!spec.args.is_empty()).then(|| spec.args.clone()),
            working_dir: (!spec.working_dir.is_empty()).then(|| spec.working_dir.clone()),
            ports: Some(vec![ContainerPort {
                container_port: spec.port,
                ..Default::default()
            }]),
            env: (!env.is_empty()).then_some(env),
            volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
            ..Default::default()
        };

        Deployment {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: (!volumes.is_empty()).then_some(volumes),
                        affinity,
                        restart_policy: Some(spec.restart_policy.as_str().to_string()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_service(&self, spec: &ContainerSpec) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(spec.service_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(workload_labels(spec)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(Self::selector_labels(spec)),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: spec.port,
                    target_port: Some(IntOrString::Int(spec.port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Pods backing a workload, newest first.
    async fn workload_pods(&self, name: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&format!("{}={}", LABEL_APP, name));
        let mut pods = self
            .pods()
            .list(&params)
            .await
            .context("Failed to list pods")?
            .items;
        pods.sort_by(|a, b| {
            b.metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .cmp(&a.metadata.creation_timestamp.as_ref().map(|t| t.0))
        });
        Ok(pods)
    }

    /// Every event attached to the Deployment, its ReplicaSets or its Pods.
    async fn workload_events(&self, name: &str) -> Result<Vec<Event>> {
        let mut object_names: Vec<String> = vec![name.to_string()];

        let rs_api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().labels(&format!("{}={}", LABEL_APP, name));
        let replica_sets = rs_api
            .list(&params)
            .await
            .context("Failed to list replica sets")?;
        object_names.extend(replica_sets.items.into_iter().filter_map(|rs| rs.metadata.name));

        let pods = self.workload_pods(name).await?;
        object_names.extend(pods.into_iter().filter_map(|pod| pod.metadata.name));

        let event_api: Api<Event> = Api::namespaced(self.client.clone(), &self.namespace);
        let events = event_api
            .list(&ListParams::default())
            .await
            .context("Failed to list events")?;

        Ok(events
            .items
            .into_iter()
            .filter(|event| {
                event
                    .involved_object
                    .name
                    .as_ref()
                    .map(|n| object_names.iter().any(|o| o == n))
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn recreate(&self, spec: &ContainerSpec) -> Result<()> {
        let affinity = affinity::plan_node_affinity(self, &spec.mounts)
            .await
            .map_err(|e| anyhow!(e))?;
        let deployment = self.build_deployment(spec, affinity);
        self.deployments()
            .create(&PostParams::default(), &deployment)
            .await
            .with_context(|| format!("Failed to create deployment {}", spec.name))?;
        Ok(())
    }
}

fn to_runtime_event(event: Event) -> RuntimeEvent {
    RuntimeEvent {
        event_type: event.type_.unwrap_or_default(),
        reason: event.reason.unwrap_or_default(),
        message: event.message.unwrap_or_default(),
        object: event.involved_object.name.unwrap_or_default(),
        last_timestamp: event.last_timestamp.map(|t| t.0),
    }
}

fn phase_from_replicas(replicas: i32, ready_replicas: i32) -> ContainerPhase {
    if ready_replicas > 0 {
        ContainerPhase::Running
    } else if replicas > 0 {
        ContainerPhase::Pending
    } else {
        ContainerPhase::Stopped
    }
}

/// Diagnostic for an unready workload, in descending priority: failed init
/// containers, terminated containers, waiting reasons, crash-looping
/// restarts, then pod conditions.
fn readiness_message(pods: &[Pod], ready_replicas: i32, replicas: i32) -> String {
    for pod in pods {
        let pod_name = pod.metadata.name.as_deref().unwrap_or("unknown");
        let Some(status) = &pod.status else { continue };

        if let Some(init_statuses) = &status.init_container_statuses {
            for init in init_statuses {
                if let Some(terminated) = init.state.as_ref().and_then(|s| s.terminated.as_ref()) {
                    if terminated.exit_code != 0 {
                        return format!(
                            "pod {} init container {} failed with exit code {}",
                            pod_name, init.name, terminated.exit_code
                        );
                    }
                }
            }
        }

        if let Some(container_statuses) = &status.container_statuses {
            for cs in container_statuses {
                if let Some(terminated) = cs.state.as_ref().and_then(|s| s.terminated.as_ref()) {
                    let reason = terminated.reason.as_deref().unwrap_or("Terminated");
                    return format!(
                        "pod {} container terminated: {} (exit code {})",
                        pod_name, reason, terminated.exit_code
                    );
                }
                if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                    let reason = waiting.reason.as_deref().unwrap_or("Waiting");
                    let message = waiting.message.as_deref().unwrap_or("");
                    return format!("pod {} container waiting: {} {}", pod_name, reason, message)
                        .trim_end()
                        .to_string();
                }
                if cs.restart_count >= 3 {
                    return format!(
                        "pod {} container restarted {} times",
                        pod_name, cs.restart_count
                    );
                }
            }
        }

        if let Some(conditions) = &status.conditions {
            for wanted in ["PodScheduled", "Initialized", "ContainersReady"] {
                if let Some(condition) = conditions
                    .iter()
                    .find(|c| c.type_ == wanted && c.status == "False")
                {
                    let message = condition.message.as_deref().unwrap_or("");
                    return format!("pod {} {}=False {}", pod_name, wanted, message)
                        .trim_end()
                        .to_string();
                }
            }
        }
    }

    format!("ready replicas {}/{}", ready_replicas, replicas)
}

#[async_trait]
impl ClusterInventory for KubernetesRuntime {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.get_opt(name).await.context("Failed to get node")
    }

    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.namespace);
        api.get_opt(name).await.context("Failed to get pvc")
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.get_opt(name).await.context("Failed to get pv")
    }
}

#[async_trait]
impl InstanceRuntime for KubernetesRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        if let Err(err) = self.recreate(spec).await {
            // Best-effort rollback of anything the create left behind.
            if let Err(cleanup_err) = self.delete_container(&spec.name).await {
                debug!(container = spec.name, error = %cleanup_err, "rollback delete failed");
            }
            return Err(err);
        }
        Ok(spec.name.clone())
    }

    async fn delete_container(&self, name: &str) -> Result<()> {
        match self
            .deployments()
            .delete(name, &DeleteParams::foreground())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete deployment {}", name)),
        }
    }

    async fn scale_container(&self, name: &str, replicas: i32) -> Result<()> {
        let patch = serde_json::json!({"spec": {"replicas": replicas}});
        self.deployments()
            .patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("Failed to scale deployment {} to {}", name, replicas))?;
        Ok(())
    }

    async fn restart_container(&self, spec: &ContainerSpec) -> Result<()> {
        let existing = self
            .deployments()
            .get_opt(&spec.name)
            .await
            .context("Failed to look up deployment before restart")?;

        if existing.is_none() {
            return self.recreate(spec).await;
        }

        self.delete_container(&spec.name).await?;

        // Foreground deletion finalizes asynchronously. Observe it from a
        // spawned task so the caller is not blocked, then recreate.
        let runtime = self.clone();
        let spec = spec.clone();
        tokio::spawn(async move {
            for attempt in 0..RESTART_WAIT_ATTEMPTS {
                tokio::time::sleep(RESTART_WAIT_INTERVAL).await;
                match runtime.deployments().get_opt(&spec.name).await {
                    Ok(None) => {
                        if let Err(e) = runtime.recreate(&spec).await {
                            warn!(container = spec.name, error = %e, "restart recreate failed");
                        }
                        return;
                    }
                    Ok(Some(_)) => {
                        debug!(container = spec.name, attempt, "waiting for deletion");
                    }
                    Err(e) => {
                        warn!(container = spec.name, error = %e, "restart observation failed");
                        return;
                    }
                }
            }
            warn!(
                container = spec.name,
                "deployment still present after restart wait window"
            );
        });

        Ok(())
    }

    async fn container_info(&self, name: &str) -> Result<ContainerInfo> {
        let deployment = self
            .deployments()
            .get_opt(name)
            .await
            .context("Failed to get deployment")?
            .ok_or_else(|| anyhow!("deployment {} not found", name))?;

        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        let ready_replicas = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);

        let ports = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|pod_spec| {
                pod_spec
                    .containers
                    .iter()
                    .flat_map(|c| c.ports.iter().flatten())
                    .map(|p| p.container_port)
                    .collect()
            })
            .unwrap_or_default();

        let ip = self
            .workload_pods(name)
            .await?
            .iter()
            .find_map(|pod| pod.status.as_ref().and_then(|s| s.pod_ip.clone()));

        Ok(ContainerInfo {
            name: name.to_string(),
            phase: phase_from_replicas(replicas, ready_replicas),
            ip,
            ports,
            labels: deployment.metadata.labels.unwrap_or_default(),
            created_at: deployment
                .metadata
                .creation_timestamp
                .map(|t| t.0)
                .unwrap_or_else(Utc::now),
        })
    }

    async fn container_readiness(&self, name: &str) -> Result<Readiness> {
        let deployment = self
            .deployments()
            .get_opt(name)
            .await
            .context("Failed to get deployment")?
            .ok_or_else(|| anyhow!("deployment {} not found", name))?;

        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        let ready_replicas = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);

        let ready = ready_replicas == replicas && ready_replicas > 0;
        if ready {
            return Ok(Readiness {
                ready: true,
                message: String::new(),
            });
        }

        let pods = self.workload_pods(name).await?;
        Ok(Readiness {
            ready: false,
            message: readiness_message(&pods, ready_replicas, replicas),
        })
    }

    async fn container_logs(&self, name: &str, tail_lines: i64) -> Result<String> {
        let pods = self.workload_pods(name).await?;
        let pod = pods
            .iter()
            .find(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .map(|p| p == "Running")
                    .unwrap_or(false)
            })
            .or_else(|| pods.first())
            .ok_or_else(|| anyhow!("no pods found for workload {}", name))?;
        let pod_name = pod
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| anyhow!("pod without a name"))?;

        let params = LogParams {
            tail_lines: Some(tail_lines),
            ..Default::default()
        };
        self.pods()
            .logs(pod_name, &params)
            .await
            .with_context(|| format!("Failed to fetch logs from pod {}", pod_name))
    }

    async fn container_events(&self, name: &str) -> Result<Vec<RuntimeEvent>> {
        let events = self.workload_events(name).await?;
        Ok(events.into_iter().map(to_runtime_event).collect())
    }

    async fn container_warning_events(&self, name: &str) -> Result<Vec<RuntimeEvent>> {
        let events = self.workload_events(name).await?;
        Ok(events
            .into_iter()
            .filter(|event| event.type_.as_deref() == Some("Warning"))
            .map(to_runtime_event)
            .collect())
    }

    async fn create_service(&self, spec: &ContainerSpec) -> Result<String> {
        let service = self.build_service(spec);
        self.services()
            .create(&PostParams::default(), &service)
            .await
            .with_context(|| format!("Failed to create service {}", spec.service_name))?;
        Ok(spec.service_name.clone())
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        match self.services().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete service {}", name)),
        }
    }

    async fn get_service(&self, name: &str) -> Result<ServiceInfo> {
        let service = self
            .services()
            .get_opt(name)
            .await
            .context("Failed to get service")?
            .ok_or_else(|| anyhow!("service {} not found", name))?;

        let spec = service.spec.unwrap_or_default();
        Ok(ServiceInfo {
            name: name.to_string(),
            cluster_ip: spec.cluster_ip,
            ports: spec
                .ports
                .map(|ports| ports.into_iter().map(|p| p.port).collect())
                .unwrap_or_default(),
        })
    }

    async fn restart_service(&self, spec: &ContainerSpec) -> Result<()> {
        self.delete_service(&spec.service_name).await?;
        for _ in 0..10 {
            match self.services().get_opt(&spec.service_name).await? {
                None => break,
                Some(_) => tokio::time::sleep(Duration::from_millis(500)).await,
            }
        }
        self.create_service(spec).await?;
        Ok(())
    }
}
