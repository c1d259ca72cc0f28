use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::models::{
    AccessType, ContainerStatus, Environment, Instance, InstanceStatus, McpProtocol,
    McpServerEntry, McpServersDocument, Mount,
};
use crate::db::{CodePackageStore, EnvironmentStore, InstanceStore, TemplateStore};
use crate::server::instance::compiler::{self, MarketEndpoint};
use crate::server::instance::error::{InstanceError, InstanceResult};
use crate::server::instance::state_machine;
use crate::server::runtime::{RuntimeEvent, RuntimeFactory};

/// Probe deadline for the target-URL HTTP check.
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOG_TAIL: i64 = 100;

/// Request to provision a hosted instance.
#[derive(Debug, Clone)]
pub struct CreateHostedRequest {
    pub name: String,
    pub environment_id: i64,
    pub mcp_protocol: McpProtocol,
    pub image_address: String,
    pub port: i32,
    pub command: String,
    pub init_script: String,
    pub package_id: Option<String>,
    pub env_vars: BTreeMap<String, String>,
    pub volume_mounts: Vec<Mount>,
    pub startup_timeout_ms: i64,
    pub running_timeout_ms: i64,
    pub source_config: Option<McpServersDocument>,
    pub service_path: String,
}

/// Aggregated health of a hosted instance: workload readiness, service
/// presence and an end-to-end HTTP probe, plus cluster warning events.
#[derive(Debug, Clone)]
pub struct InstanceHealth {
    pub container_ready: bool,
    pub ready_message: String,
    pub service_ready: bool,
    pub http_ok: bool,
    pub http_message: String,
    pub warning_events: Vec<RuntimeEvent>,
}

/// Sole writer of the hosting fields on instance rows. Provisions and
/// tears down workloads through the runtime adapter and keeps the derived
/// config documents up to date.
#[derive(Clone)]
pub struct Orchestrator {
    instances: Arc<dyn InstanceStore>,
    environments: Arc<dyn EnvironmentStore>,
    templates: Arc<dyn TemplateStore>,
    code_packages: Arc<dyn CodePackageStore>,
    runtime_factory: Arc<dyn RuntimeFactory>,
    http_client: reqwest::Client,
    market: MarketEndpoint,
    domain: String,
    gateway_prefix: String,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        environments: Arc<dyn EnvironmentStore>,
        templates: Arc<dyn TemplateStore>,
        code_packages: Arc<dyn CodePackageStore>,
        runtime_factory: Arc<dyn RuntimeFactory>,
        http_client: reqwest::Client,
        market: MarketEndpoint,
        domain: impl Into<String>,
        gateway_prefix: impl Into<String>,
    ) -> Self {
        Self {
            instances,
            environments,
            templates,
            code_packages,
            runtime_factory,
            http_client,
            market,
            domain: domain.into(),
            gateway_prefix: gateway_prefix.into(),
        }
    }

    async fn load_instance(&self, instance_id: &str) -> InstanceResult<Instance> {
        self.instances
            .get(instance_id)
            .await?
            .ok_or_else(|| InstanceError::not_found(format!("instance {}", instance_id)))
    }

    async fn runtime_for(
        &self,
        environment_id: i64,
    ) -> InstanceResult<Arc<dyn crate::server::runtime::InstanceRuntime>> {
        let environment = self
            .environments
            .get(environment_id)
            .await?
            .ok_or_else(|| InstanceError::not_found(format!("environment {}", environment_id)))?;
        self.runtime_factory.for_environment(&environment).await
    }

    /// Provision a hosted instance: validate, compile the descriptor,
    /// create the workload and its service, then persist the descriptor
    /// and the derived target/public configs. A failed provisioning step
    /// tears the container down again and records `create-failed`.
    pub async fn create_hosted(&self, request: CreateHostedRequest) -> InstanceResult<Instance> {
        if request.environment_id == 0 {
            return Err(InstanceError::validation(
                "hosting instances require an environment",
            ));
        }
        if self
            .environments
            .get(request.environment_id)
            .await?
            .is_none()
        {
            return Err(InstanceError::not_found(format!(
                "environment {}",
                request.environment_id
            )));
        }
        if self.instances.find_by_name(&request.name).await?.is_some() {
            return Err(InstanceError::conflict(format!(
                "instance name {} already exists",
                request.name
            )));
        }
        if let Some(package_id) = request.package_id.as_deref().filter(|id| !id.is_empty()) {
            if self.code_packages.get(package_id).await?.is_none() {
                return Err(InstanceError::not_found(format!(
                    "code package {}",
                    package_id
                )));
            }
        }

        let now = Utc::now();
        let mut instance = Instance {
            instance_id: Uuid::new_v4().simple().to_string(),
            name: request.name,
            access_type: AccessType::Hosting,
            mcp_protocol: request.mcp_protocol,
            status: InstanceStatus::Active,
            environment_id: request.environment_id,
            image_address: request.image_address,
            port: request.port,
            init_script: request.init_script,
            command: request.command,
            package_id: request.package_id,
            env_vars: request.env_vars,
            volume_mounts: request.volume_mounts,
            startup_timeout_ms: request.startup_timeout_ms,
            running_timeout_ms: request.running_timeout_ms,
            container_create_options: None,
            container_name: String::new(),
            container_service_name: String::new(),
            container_status: ContainerStatus::Pending,
            container_is_ready: false,
            container_last_message: String::new(),
            source_config: request.source_config,
            target_config: None,
            public_proxy_config: None,
            service_path: request.service_path,
            created_at: now,
            updated_at: now,
        };

        let spec = compiler::compile(&instance, &self.market)?;
        instance.container_name = spec.name.clone();
        instance.container_service_name = spec.service_name.clone();
        instance.container_create_options = Some(spec.clone());
        instance.target_config = Some(self.target_document(&instance));
        instance.public_proxy_config = Some(self.public_document(&instance));

        self.instances.insert(&instance).await?;

        let runtime = self.runtime_for(instance.environment_id).await?;

        if let Err(err) = runtime.create_container(&spec).await {
            self.record_create_failure(&mut instance, &err.to_string()).await;
            return Err(InstanceError::upstream(err));
        }
        if let Err(err) = runtime.create_service(&spec).await {
            // Roll the container back so the failed create leaves nothing.
            if let Err(cleanup_err) = runtime.delete_container(&spec.name).await {
                warn!(instance_id = instance.instance_id, error = %cleanup_err, "rollback delete failed");
            }
            self.record_create_failure(&mut instance, &err.to_string()).await;
            return Err(InstanceError::upstream(err));
        }

        info!(
            instance_id = instance.instance_id,
            container = instance.container_name,
            "hosted instance provisioned"
        );
        Ok(instance)
    }

    async fn record_create_failure(&self, instance: &mut Instance, message: &str) {
        instance.container_status = ContainerStatus::CreateFailed;
        instance.container_is_ready = false;
        instance.container_last_message = message.to_string();
        if let Err(err) = self.instances.update(instance).await {
            warn!(instance_id = instance.instance_id, error = %err, "failed to record create failure");
        }
    }

    /// Tear down the workload (best effort) and delete the row.
    pub async fn delete(&self, instance_id: &str) -> InstanceResult<()> {
        let instance = self.load_instance(instance_id).await?;

        if instance.access_type == AccessType::Hosting && !instance.container_name.is_empty() {
            let runtime = self.runtime_for(instance.environment_id).await?;
            if let Err(err) = runtime.delete_container(&instance.container_name).await {
                warn!(instance_id, error = %err, "container delete failed, continuing");
            }
            if !instance.container_service_name.is_empty() {
                if let Err(err) = runtime
                    .delete_service(&instance.container_service_name)
                    .await
                {
                    warn!(instance_id, error = %err, "service delete failed, continuing");
                }
            }
        }

        self.instances.delete(instance_id).await?;
        info!(instance_id, "instance deleted");
        Ok(())
    }

    /// Delete-then-recreate from the persisted descriptor. The runtime may
    /// finish the recreate asynchronously; the instance is parked back in
    /// `pending` for the reconciler to supervise.
    pub async fn restart(&self, instance_id: &str) -> InstanceResult<()> {
        let mut instance = self.load_instance(instance_id).await?;
        let spec = instance
            .container_create_options
            .clone()
            .ok_or_else(|| InstanceError::validation("instance has no persisted descriptor"))?;

        let runtime = self.runtime_for(instance.environment_id).await?;
        runtime
            .restart_container(&spec)
            .await
            .map_err(InstanceError::upstream)?;

        instance.status = InstanceStatus::Active;
        instance.container_status = ContainerStatus::Pending;
        instance.container_is_ready = false;
        instance.container_last_message = "Restart requested".to_string();
        self.instances.update(&instance).await?;
        Ok(())
    }

    /// Stop a hosted instance without deleting its record: scale to zero
    /// (the Docker adapter deletes instead) and mark it manually stopped.
    pub async fn scale_to_zero(&self, instance_id: &str) -> InstanceResult<()> {
        let mut instance = self.load_instance(instance_id).await?;
        if instance.container_name.is_empty() {
            return Err(InstanceError::validation("instance has no container"));
        }

        let runtime = self.runtime_for(instance.environment_id).await?;
        runtime
            .scale_container(&instance.container_name, 0)
            .await
            .map_err(InstanceError::upstream)?;

        instance.status = InstanceStatus::Inactive;
        instance.container_status = ContainerStatus::ManualStop;
        instance.container_is_ready = state_machine::ready_for(ContainerStatus::ManualStop);
        instance.container_last_message = "Stopped by operator".to_string();
        self.instances.update(&instance).await?;
        info!(instance_id, "instance scaled to zero");
        Ok(())
    }

    /// Combine the three health probes and persist the readiness outcome.
    pub async fn status(&self, instance_id: &str) -> InstanceResult<InstanceHealth> {
        let mut instance = self.load_instance(instance_id).await?;
        let runtime = self.runtime_for(instance.environment_id).await?;

        let (container_ready, ready_message) = match runtime
            .container_readiness(&instance.container_name)
            .await
        {
            Ok(readiness) => (readiness.ready, readiness.message),
            Err(err) => (false, err.to_string()),
        };

        let service_ready = match runtime.get_service(&instance.container_service_name).await {
            Ok(service) => {
                let ip_ok = match service.cluster_ip.as_deref() {
                    None => false,
                    Some(ip) => !ip.is_empty(),
                };
                ip_ok && !service.ports.is_empty()
            }
            Err(err) => {
                debug!(instance_id, error = %err, "service probe failed");
                false
            }
        };

        let (http_ok, http_message) = self.probe_target(&instance).await;

        let warning_events = runtime
            .container_warning_events(&instance.container_name)
            .await
            .unwrap_or_default();

        instance.container_is_ready = container_ready;
        instance.container_last_message = ready_message.clone();
        self.instances.update(&instance).await?;

        Ok(InstanceHealth {
            container_ready,
            ready_message,
            service_ready,
            http_ok,
            http_message,
            warning_events,
        })
    }

    async fn probe_target(&self, instance: &Instance) -> (bool, String) {
        let Some(url) = instance
            .target_config
            .as_ref()
            .and_then(|config| config.first_entry())
            .and_then(|(_, entry)| entry.url.clone())
        else {
            return (false, "no target url configured".to_string());
        };

        match self
            .http_client
            .get(&url)
            .timeout(HTTP_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    (true, String::new())
                } else {
                    (false, format!("target returned HTTP {}", status.as_u16()))
                }
            }
            Err(err) => (false, format!("target probe failed: {}", err)),
        }
    }

    /// Tail of the workload logs, default 100 lines.
    pub async fn logs(&self, instance_id: &str, tail_lines: Option<i64>) -> InstanceResult<String> {
        let instance = self.load_instance(instance_id).await?;
        if instance.container_name.is_empty() {
            return Err(InstanceError::validation("instance has no container"));
        }
        let runtime = self.runtime_for(instance.environment_id).await?;
        runtime
            .container_logs(&instance.container_name, tail_lines.unwrap_or(DEFAULT_LOG_TAIL))
            .await
            .map_err(InstanceError::upstream)
    }

    /// Direct instances pass the upstream through untouched; the stored
    /// documents all point at the user-supplied config.
    pub async fn update_direct(
        &self,
        instance_id: &str,
        config: McpServersDocument,
    ) -> InstanceResult<Instance> {
        let mut instance = self.load_instance(instance_id).await?;
        if instance.access_type != AccessType::Direct {
            return Err(InstanceError::validation("instance is not direct access"));
        }
        instance.source_config = Some(config.clone());
        instance.target_config = Some(config.clone());
        instance.public_proxy_config = Some(config);
        self.instances.update(&instance).await?;
        Ok(instance)
    }

    /// Proxy instances keep the upstream as target and expose the derived
    /// gateway URL.
    pub async fn update_proxy(
        &self,
        instance_id: &str,
        config: McpServersDocument,
    ) -> InstanceResult<Instance> {
        let mut instance = self.load_instance(instance_id).await?;
        if instance.access_type != AccessType::Proxy {
            return Err(InstanceError::validation("instance is not proxy access"));
        }
        instance.source_config = Some(config.clone());
        instance.target_config = Some(config);
        instance.public_proxy_config = Some(self.public_document(&instance));
        self.instances.update(&instance).await?;
        Ok(instance)
    }

    /// Stop an instance whose workload is wedged beyond what the
    /// reconciler handles: tear the workload down and park the record in
    /// `exception-force-stop` with the operator's reason.
    pub async fn force_stop(&self, instance_id: &str, reason: &str) -> InstanceResult<()> {
        let mut instance = self.load_instance(instance_id).await?;
        if instance.container_name.is_empty() {
            return Err(InstanceError::validation("instance has no container"));
        }

        let runtime = self.runtime_for(instance.environment_id).await?;
        if let Err(err) = runtime.delete_container(&instance.container_name).await {
            warn!(instance_id, error = %err, "container delete failed, continuing");
        }
        if !instance.container_service_name.is_empty() {
            if let Err(err) = runtime
                .delete_service(&instance.container_service_name)
                .await
            {
                warn!(instance_id, error = %err, "service delete failed, continuing");
            }
        }

        instance.status = InstanceStatus::Inactive;
        instance.container_status = ContainerStatus::ExceptionForceStop;
        instance.container_is_ready = false;
        instance.container_last_message = reason.to_string();
        self.instances.update(&instance).await?;
        warn!(instance_id, reason, "instance force stopped");
        Ok(())
    }

    /// Register a cluster handle after validating it (Kubernetes configs
    /// must parse before anything tries to build a client from them).
    pub async fn register_environment(&self, environment: &Environment) -> InstanceResult<i64> {
        crate::server::runtime::validate_environment(environment)?;
        let id = self.environments.insert(environment).await?;
        info!(environment = environment.name, id, "environment registered");
        Ok(id)
    }

    /// Environments cannot be removed while a template or instance still
    /// references them.
    pub async fn delete_environment(&self, environment_id: i64) -> InstanceResult<()> {
        if self
            .environments
            .get(environment_id)
            .await?
            .is_none()
        {
            return Err(InstanceError::not_found(format!(
                "environment {}",
                environment_id
            )));
        }

        let instance_count = self.instances.count_by_environment(environment_id).await?;
        if instance_count > 0 {
            return Err(InstanceError::conflict(format!(
                "environment {} is referenced by {} instance(s)",
                environment_id, instance_count
            )));
        }
        let template_count = self.templates.count_by_environment(environment_id).await?;
        if template_count > 0 {
            return Err(InstanceError::conflict(format!(
                "environment {} is referenced by {} template(s)",
                environment_id, template_count
            )));
        }

        self.environments.delete(environment_id).await?;
        Ok(())
    }

    fn target_document(&self, instance: &Instance) -> McpServersDocument {
        McpServersDocument::single(
            instance.name.clone(),
            McpServerEntry {
                url: Some(compiler::derive_target_url(instance)),
                transport: Some(instance.effective_protocol().as_str().to_string()),
                ..Default::default()
            },
        )
    }

    fn public_document(&self, instance: &Instance) -> McpServersDocument {
        McpServersDocument::single(
            instance.name.clone(),
            McpServerEntry {
                url: Some(compiler::derive_public_url(
                    &self.domain,
                    &self.gateway_prefix,
                    instance,
                )),
                transport: Some(instance.effective_protocol().as_str().to_string()),
                ..Default::default()
            },
        )
    }
}
