use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the control plane relates to an MCP service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "access_type", rename_all = "kebab-case")]
pub enum AccessType {
    /// Consumers use the upstream URL as-is.
    Direct,
    /// The gateway terminates and forwards to an existing upstream.
    Proxy,
    /// The control plane materializes the workload itself.
    Hosting,
}

/// MCP transport dialect declared on the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "mcp_protocol", rename_all = "kebab-case")]
pub enum McpProtocol {
    Stdio,
    Sse,
    StreamableHttp,
}

impl McpProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpProtocol::Stdio => "stdio",
            McpProtocol::Sse => "sse",
            McpProtocol::StreamableHttp => "streamable-http",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "instance_status", rename_all = "kebab-case")]
pub enum InstanceStatus {
    Active,
    Inactive,
}

/// Lifecycle state of a hosted container, written by the orchestrator at
/// provisioning time and by the reconciler afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "container_status", rename_all = "kebab-case")]
pub enum ContainerStatus {
    Pending,
    Running,
    RunningUnready,
    InitTimeoutStop,
    RunTimeoutStop,
    ExceptionForceStop,
    ManualStop,
    CreateFailed,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Pending => "pending",
            ContainerStatus::Running => "running",
            ContainerStatus::RunningUnready => "running-unready",
            ContainerStatus::InitTimeoutStop => "init-timeout-stop",
            ContainerStatus::RunTimeoutStop => "run-timeout-stop",
            ContainerStatus::ExceptionForceStop => "exception-force-stop",
            ContainerStatus::ManualStop => "manual-stop",
            ContainerStatus::CreateFailed => "create-failed",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "environment_type", rename_all = "kebab-case")]
pub enum EnvironmentType {
    Kubernetes,
    Docker,
}

/// A registered cluster: the runtime factory turns this into a cluster
/// client. `config` holds kubeconfig YAML for Kubernetes environments.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Environment {
    pub id: i64,
    pub name: String,
    pub env_type: EnvironmentType,
    pub namespace: String,
    pub config: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A volume attached to a hosted container. The affinity planner and the
/// spec compiler match on the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mount {
    HostPath {
        mount_path: String,
        host_path: String,
        node_name: String,
        #[serde(default)]
        read_only: bool,
        #[serde(default)]
        sub_path: String,
    },
    Pvc {
        mount_path: String,
        pvc_name: String,
        #[serde(default)]
        read_only: bool,
        #[serde(default)]
        sub_path: String,
    },
    ConfigMap {
        mount_path: String,
        config_map_name: String,
        #[serde(default)]
        read_only: bool,
        #[serde(default)]
        sub_path: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "Always",
            RestartPolicy::OnFailure => "OnFailure",
            RestartPolicy::Never => "Never",
        }
    }
}

/// The concrete container-create descriptor compiled from an instance.
/// Persisted on the instance row and re-used verbatim on restart and when
/// the reconciler recreates a missing workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub service_name: String,
    pub port: i32,
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub working_dir: String,
}

/// One upstream entry inside an mcpServers document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Request timeout in seconds for non-streaming calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Read timeout in seconds for long-lived SSE streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse_read_timeout: Option<u64>,
}

/// The `{"mcpServers": {...}}` document stored in the three config columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServersDocument {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, McpServerEntry>,
}

impl McpServersDocument {
    /// Build a single-entry document, the shape this control plane writes
    /// for derived target and public-proxy configs.
    pub fn single(name: impl Into<String>, entry: McpServerEntry) -> Self {
        let mut mcp_servers = BTreeMap::new();
        mcp_servers.insert(name.into(), entry);
        Self { mcp_servers }
    }

    /// First entry in key order; derived documents only ever hold one.
    pub fn first_entry(&self) -> Option<(&String, &McpServerEntry)> {
        self.mcp_servers.iter().next()
    }
}

/// The central entity: one registered MCP service instance.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instance {
    pub instance_id: String,
    pub name: String,
    pub access_type: AccessType,
    pub mcp_protocol: McpProtocol,
    pub status: InstanceStatus,
    pub environment_id: i64,
    pub image_address: String,
    pub port: i32,
    pub init_script: String,
    pub command: String,
    pub package_id: Option<String>,
    #[sqlx(json)]
    pub env_vars: BTreeMap<String, String>,
    #[sqlx(json)]
    pub volume_mounts: Vec<Mount>,
    pub startup_timeout_ms: i64,
    pub running_timeout_ms: i64,
    #[sqlx(json)]
    pub container_create_options: Option<ContainerSpec>,
    pub container_name: String,
    pub container_service_name: String,
    pub container_status: ContainerStatus,
    pub container_is_ready: bool,
    pub container_last_message: String,
    #[sqlx(json)]
    pub source_config: Option<McpServersDocument>,
    #[sqlx(json)]
    pub target_config: Option<McpServersDocument>,
    #[sqlx(json)]
    pub public_proxy_config: Option<McpServersDocument>,
    pub service_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// The protocol the instance speaks to the outside world. Stdio under
    /// hosting is wrapped by the hosting image and surfaces as SSE.
    pub fn effective_protocol(&self) -> McpProtocol {
        if self.access_type == AccessType::Hosting && self.mcp_protocol == McpProtocol::Stdio {
            McpProtocol::Sse
        } else {
            self.mcp_protocol
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub environment_id: i64,
    #[sqlx(json)]
    pub spec: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CodePackage {
    pub id: String,
    pub name: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_round_trips_through_tagged_json() {
        let mount = Mount::HostPath {
            mount_path: "/data".to_string(),
            host_path: "/var/lib/data".to_string(),
            node_name: "node-1".to_string(),
            read_only: true,
            sub_path: String::new(),
        };
        let json = serde_json::to_value(&mount).unwrap();
        assert_eq!(json["type"], "host_path");
        assert_eq!(json["node_name"], "node-1");
        let back: Mount = serde_json::from_value(json).unwrap();
        assert_eq!(back, mount);
    }

    #[test]
    fn mcp_servers_document_uses_camel_case_keys() {
        let doc = McpServersDocument::single(
            "everything",
            McpServerEntry {
                url: Some("http://svc:8080/sse".to_string()),
                sse_read_timeout: Some(300),
                ..Default::default()
            },
        );
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["mcpServers"]["everything"]["sseReadTimeout"].is_number());
        assert!(json["mcpServers"]["everything"].get("command").is_none());
    }

    #[test]
    fn stdio_entry_parses_command_and_transport() {
        let json = serde_json::json!({
            "mcpServers": {
                "files": {"command": "npx", "args": ["-y", "server-files"], "type": "stdio"}
            }
        });
        let doc: McpServersDocument = serde_json::from_value(json).unwrap();
        let (_, entry) = doc.first_entry().unwrap();
        assert_eq!(entry.transport.as_deref(), Some("stdio"));
        assert_eq!(entry.command.as_deref(), Some("npx"));
    }
}
