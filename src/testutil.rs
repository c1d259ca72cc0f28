//! In-memory fakes for exercising the orchestrator, reconciler and gateway
//! resolution without a cluster or a database.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::db::models::{
    AccessType, CodePackage, ContainerSpec, ContainerStatus, Environment, EnvironmentType,
    Instance, InstanceStatus, McpProtocol, RestartPolicy,
};
use crate::db::{CodePackageStore, EnvironmentStore, InstanceStore, TemplateStore};
use crate::server::instance::error::InstanceResult;
use crate::server::runtime::{
    ContainerInfo, ContainerPhase, InstanceRuntime, Readiness, RuntimeEvent, RuntimeFactory,
    ServiceInfo,
};

/// One in-memory store covering every store interface.
#[derive(Default)]
pub struct MemoryStore {
    pub instances: Mutex<BTreeMap<String, Instance>>,
    pub environments: Mutex<BTreeMap<i64, Environment>>,
    pub packages: Mutex<BTreeMap<String, CodePackage>>,
    pub template_counts: Mutex<BTreeMap<i64, i64>>,
    pub update_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn with_environment(environment: Environment) -> Arc<Self> {
        let store = Self::default();
        store
            .environments
            .lock()
            .unwrap()
            .insert(environment.id, environment);
        Arc::new(store)
    }

    pub fn put_instance(&self, instance: Instance) {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.instance_id.clone(), instance);
    }

    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.instances.lock().unwrap().get(instance_id).cloned()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get(&self, instance_id: &str) -> Result<Option<Instance>> {
        Ok(self.instances.lock().unwrap().get(instance_id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Instance>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .find(|i| i.name == name)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }

    async fn list_by_environment(&self, environment_id: i64) -> Result<Vec<Instance>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.environment_id == environment_id)
            .cloned()
            .collect())
    }

    async fn list_by_access_type(&self, access_type: AccessType) -> Result<Vec<Instance>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.access_type == access_type)
            .cloned()
            .collect())
    }

    async fn list_hosting(&self) -> Result<Vec<Instance>> {
        self.list_by_access_type(AccessType::Hosting).await
    }

    async fn count_by_environment(&self, environment_id: i64) -> Result<i64> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.environment_id == environment_id)
            .count() as i64)
    }

    async fn insert(&self, instance: &Instance) -> Result<()> {
        self.put_instance(instance.clone());
        Ok(())
    }

    async fn update(&self, instance: &Instance) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.put_instance(instance.clone());
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> Result<()> {
        self.instances.lock().unwrap().remove(instance_id);
        Ok(())
    }
}

#[async_trait]
impl EnvironmentStore for MemoryStore {
    async fn get(&self, id: i64) -> Result<Option<Environment>> {
        Ok(self.environments.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Environment>> {
        Ok(self.environments.lock().unwrap().values().cloned().collect())
    }

    async fn insert(&self, environment: &Environment) -> Result<i64> {
        let id = environment.id;
        self.environments
            .lock()
            .unwrap()
            .insert(id, environment.clone());
        Ok(id)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.environments.lock().unwrap().remove(&id);
        Ok(())
    }
}

#[async_trait]
impl TemplateStore for MemoryStore {
    async fn count_by_environment(&self, environment_id: i64) -> Result<i64> {
        Ok(*self
            .template_counts
            .lock()
            .unwrap()
            .get(&environment_id)
            .unwrap_or(&0))
    }
}

#[async_trait]
impl CodePackageStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<CodePackage>> {
        Ok(self.packages.lock().unwrap().get(id).cloned())
    }
}

/// Scripted runtime: returns canned answers and records every call.
#[derive(Default)]
pub struct FakeRuntime {
    pub info: Mutex<Option<ContainerInfo>>,
    pub readiness: Mutex<Option<Readiness>>,
    pub service: Mutex<Option<ServiceInfo>>,
    pub log_output: Mutex<String>,
    pub calls: Mutex<Vec<String>>,
    pub fail_container_create: AtomicBool,
    pub fail_service_create: AtomicBool,
    pub info_delay: Mutex<Duration>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl FakeRuntime {
    pub fn running(name: &str) -> Self {
        let runtime = Self::default();
        *runtime.info.lock().unwrap() = Some(ContainerInfo {
            name: name.to_string(),
            phase: ContainerPhase::Running,
            ip: Some("10.0.0.5".to_string()),
            ports: vec![8080],
            labels: BTreeMap::new(),
            created_at: Utc::now(),
        });
        *runtime.readiness.lock().unwrap() = Some(Readiness {
            ready: true,
            message: String::new(),
        });
        runtime
    }

    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstanceRuntime for FakeRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(format!("create_container:{}", spec.name));
        if self.fail_container_create.load(Ordering::SeqCst) {
            bail!("scripted container create failure");
        }
        Ok(spec.name.clone())
    }

    async fn delete_container(&self, name: &str) -> Result<()> {
        self.record(format!("delete_container:{}", name));
        Ok(())
    }

    async fn scale_container(&self, name: &str, replicas: i32) -> Result<()> {
        self.record(format!("scale_container:{}:{}", name, replicas));
        Ok(())
    }

    async fn restart_container(&self, spec: &ContainerSpec) -> Result<()> {
        self.record(format!("restart_container:{}", spec.name));
        Ok(())
    }

    async fn container_info(&self, name: &str) -> Result<ContainerInfo> {
        self.record(format!("container_info:{}", name));
        let delay = *self.info_delay.lock().unwrap();
        if delay > Duration::ZERO {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        self.info
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("container {} not found", name))
    }

    async fn container_readiness(&self, name: &str) -> Result<Readiness> {
        self.record(format!("container_readiness:{}", name));
        self.readiness
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("readiness unavailable for {}", name))
    }

    async fn container_logs(&self, name: &str, tail_lines: i64) -> Result<String> {
        self.record(format!("container_logs:{}:{}", name, tail_lines));
        Ok(self.log_output.lock().unwrap().clone())
    }

    async fn container_events(&self, _name: &str) -> Result<Vec<RuntimeEvent>> {
        Ok(Vec::new())
    }

    async fn container_warning_events(&self, _name: &str) -> Result<Vec<RuntimeEvent>> {
        Ok(Vec::new())
    }

    async fn create_service(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(format!("create_service:{}", spec.service_name));
        if self.fail_service_create.load(Ordering::SeqCst) {
            bail!("scripted service create failure");
        }
        Ok(spec.service_name.clone())
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        self.record(format!("delete_service:{}", name));
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<ServiceInfo> {
        self.record(format!("get_service:{}", name));
        self.service
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("service {} not found", name))
    }

    async fn restart_service(&self, spec: &ContainerSpec) -> Result<()> {
        self.record(format!("restart_service:{}", spec.service_name));
        Ok(())
    }
}

pub struct FakeRuntimeFactory {
    pub runtime: Arc<FakeRuntime>,
}

#[async_trait]
impl RuntimeFactory for FakeRuntimeFactory {
    async fn for_environment(
        &self,
        _environment: &Environment,
    ) -> InstanceResult<Arc<dyn InstanceRuntime>> {
        Ok(self.runtime.clone() as Arc<dyn InstanceRuntime>)
    }
}

pub fn kubernetes_environment(id: i64) -> Environment {
    Environment {
        id,
        name: format!("env-{}", id),
        env_type: EnvironmentType::Kubernetes,
        namespace: "mcp".to_string(),
        config: String::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn compiled_spec(instance_id: &str) -> ContainerSpec {
    ContainerSpec {
        image: "img:1".to_string(),
        name: crate::server::instance::compiler::container_name(instance_id),
        service_name: crate::server::instance::compiler::service_name(instance_id),
        port: 8080,
        command: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "./run.sh".to_string(),
        ],
        args: Vec::new(),
        env: BTreeMap::new(),
        mounts: Vec::new(),
        labels: [("instance".to_string(), instance_id.to_string())].into(),
        restart_policy: RestartPolicy::Always,
        working_dir: "/app".to_string(),
    }
}

/// A provisioned hosting instance in `pending` state.
pub fn hosting_instance(instance_id: &str, environment_id: i64) -> Instance {
    let spec = compiled_spec(instance_id);
    let now = Utc::now();
    Instance {
        instance_id: instance_id.to_string(),
        name: format!("instance-{}", instance_id),
        access_type: AccessType::Hosting,
        mcp_protocol: McpProtocol::Sse,
        status: InstanceStatus::Active,
        environment_id,
        image_address: "img:1".to_string(),
        port: 8080,
        init_script: String::new(),
        command: "./run.sh".to_string(),
        package_id: None,
        env_vars: BTreeMap::new(),
        volume_mounts: Vec::new(),
        startup_timeout_ms: 0,
        running_timeout_ms: 0,
        container_name: spec.name.clone(),
        container_service_name: spec.service_name.clone(),
        container_create_options: Some(spec),
        container_status: ContainerStatus::Pending,
        container_is_ready: false,
        container_last_message: String::new(),
        source_config: None,
        target_config: None,
        public_proxy_config: None,
        service_path: String::new(),
        created_at: now,
        updated_at: now,
    }
}
