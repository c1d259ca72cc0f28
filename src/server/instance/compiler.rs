use std::collections::BTreeMap;

use crate::db::models::{
    ContainerSpec, Instance, McpProtocol, McpServersDocument, RestartPolicy,
};
use crate::server::instance::error::{InstanceError, InstanceResult};
use crate::server::runtime::LABEL_INSTANCE;

/// Label keys carrying the supervision deadlines, in milliseconds.
pub const LABEL_STARTUP_TIMEOUT: &str = "mcp.startup.timeout";
pub const LABEL_RUNNING_TIMEOUT: &str = "mcp.running.timeout";

const WORKING_DIR: &str = "/app";
const CODE_PACKAGE_DIR: &str = "/app/codepkg";
const MCP_SERVERS_FILE: &str = "/app/mcp-servers.json";

/// Where the market service serves downloadable code packages.
#[derive(Debug, Clone)]
pub struct MarketEndpoint {
    pub host: String,
    pub port: u16,
    pub prefix: String,
}

impl MarketEndpoint {
    fn download_url(&self, package_id: &str) -> String {
        format!(
            "http://{}:{}/{}/code/download/{}",
            self.host,
            self.port,
            self.prefix.trim_matches('/'),
            package_id
        )
    }
}

fn short_id(instance_id: &str) -> &str {
    let end = instance_id
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(instance_id.len());
    &instance_id[..end]
}

/// `mcp-instance-<id[:8]>-container`, deterministic per instance.
pub fn container_name(instance_id: &str) -> String {
    format!("mcp-instance-{}-container", short_id(instance_id))
}

/// `mcp-instance-<id[:8]>-service`, deterministic per instance.
pub fn service_name(instance_id: &str) -> String {
    format!("mcp-instance-{}-service", short_id(instance_id))
}

/// Compile an instance into the concrete container-create descriptor: the
/// deterministic names, a `/bin/sh -c` startup script assembled from the
/// optional code-package install, the user's init script and the
/// protocol-specific launch, plus env defaults, labels and mounts.
pub fn compile(instance: &Instance, market: &MarketEndpoint) -> InstanceResult<ContainerSpec> {
    if instance.image_address.is_empty() {
        return Err(InstanceError::validation("image address is required"));
    }
    if instance.port <= 0 {
        return Err(InstanceError::validation("container port is required"));
    }

    let script = build_startup_script(instance, market)?;

    let mut env: BTreeMap<String, String> = BTreeMap::new();
    env.insert("MCP_INSTANCE_ID".to_string(), instance.instance_id.clone());
    env.insert("MCP_PORT".to_string(), instance.port.to_string());
    env.insert("NODE_ENV".to_string(), "production".to_string());
    // User values win over the injected defaults.
    for (key, value) in &instance.env_vars {
        env.insert(key.clone(), value.clone());
    }

    let mut labels: BTreeMap<String, String> = BTreeMap::new();
    labels.insert(LABEL_INSTANCE.to_string(), instance.instance_id.clone());
    if instance.startup_timeout_ms > 0 {
        labels.insert(
            LABEL_STARTUP_TIMEOUT.to_string(),
            instance.startup_timeout_ms.to_string(),
        );
    }
    if instance.running_timeout_ms > 0 {
        labels.insert(
            LABEL_RUNNING_TIMEOUT.to_string(),
            instance.running_timeout_ms.to_string(),
        );
    }

    Ok(ContainerSpec {
        image: instance.image_address.clone(),
        name: container_name(&instance.instance_id),
        service_name: service_name(&instance.instance_id),
        port: instance.port,
        command: vec!["/bin/sh".to_string(), "-c".to_string(), script],
        args: Vec::new(),
        env,
        mounts: instance.volume_mounts.clone(),
        labels,
        restart_policy: RestartPolicy::Always,
        working_dir: WORKING_DIR.to_string(),
    })
}

fn build_startup_script(instance: &Instance, market: &MarketEndpoint) -> InstanceResult<String> {
    let mut fragments: Vec<String> = Vec::new();

    if let Some(package_id) = instance.package_id.as_deref().filter(|id| !id.is_empty()) {
        fragments.push(format!(
            "mkdir -p {dir}\nwget -q -O /tmp/codepkg.zip {url}\nunzip -o /tmp/codepkg.zip -d {dir}\ncd {dir}",
            dir = CODE_PACKAGE_DIR,
            url = market.download_url(package_id),
        ));
    }

    if !instance.init_script.is_empty() {
        fragments.push(instance.init_script.clone());
    }

    match instance.mcp_protocol {
        McpProtocol::Stdio => {
            let config = validated_stdio_config(instance)?;
            let config_json = serde_json::to_string_pretty(&config)
                .map_err(|e| InstanceError::Internal(e.into()))?;
            fragments.push(format!(
                "cat > {file} <<'MCP_SERVERS_EOF'\n{json}\nMCP_SERVERS_EOF\nmcp-hosting --port={port} --mcp-servers-config {file}",
                file = MCP_SERVERS_FILE,
                json = config_json,
                port = instance.port,
            ));
        }
        McpProtocol::Sse | McpProtocol::StreamableHttp => {
            if instance.command.is_empty() {
                return Err(InstanceError::validation(format!(
                    "command is required for {} hosting",
                    instance.mcp_protocol.as_str()
                )));
            }
            fragments.push(instance.command.clone());
        }
    }

    Ok(fragments.join("\n"))
}

/// The stdio launch wraps the user's MCP config; it must parse and actually
/// describe a stdio server with a command to run.
fn validated_stdio_config(instance: &Instance) -> InstanceResult<McpServersDocument> {
    let config = instance
        .source_config
        .as_ref()
        .ok_or_else(|| InstanceError::validation("stdio hosting requires an MCP server config"))?;

    let (name, entry) = config
        .first_entry()
        .ok_or_else(|| InstanceError::validation("MCP server config has no entries"))?;

    if let Some(transport) = entry.transport.as_deref() {
        if transport != "stdio" {
            return Err(InstanceError::validation(format!(
                "MCP server {} declares transport {}, expected stdio",
                name, transport
            )));
        }
    }
    if entry.command.as_deref().unwrap_or("").is_empty() {
        return Err(InstanceError::validation(format!(
            "MCP server {} has no command to launch",
            name
        )));
    }

    Ok(config.clone())
}

/// Internal URL the gateway and the health probe talk to:
/// `http://<service-name>:<port>` plus the protocol suffix, or the
/// explicitly configured service path.
pub fn derive_target_url(instance: &Instance) -> String {
    let base = format!(
        "http://{}:{}",
        instance.container_service_name, instance.port
    );
    if !instance.service_path.is_empty() {
        let path = instance.service_path.trim_start_matches('/');
        return format!("{}/{}", base, path);
    }
    match instance.effective_protocol() {
        McpProtocol::Sse => format!("{}/sse", base),
        McpProtocol::StreamableHttp => format!("{}/mcp", base),
        McpProtocol::Stdio => base,
    }
}

/// The only URL exposed externally:
/// `<domain>/<gateway-prefix>/<instance-id>`, `/sse`-suffixed for SSE.
pub fn derive_public_url(domain: &str, gateway_prefix: &str, instance: &Instance) -> String {
    let mut url = format!(
        "{}/{}/{}",
        domain.trim_end_matches('/'),
        gateway_prefix.trim_matches('/'),
        urlencoding::encode(&instance.instance_id),
    );
    if instance.effective_protocol() == McpProtocol::Sse {
        url.push_str("/sse");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{AccessType, ContainerStatus, InstanceStatus, McpServerEntry};
    use chrono::Utc;

    fn market() -> MarketEndpoint {
        MarketEndpoint {
            host: "market".to_string(),
            port: 8900,
            prefix: "api".to_string(),
        }
    }

    fn base_instance() -> Instance {
        Instance {
            instance_id: "a1b2c3d4e5f6a7b8".to_string(),
            name: "everything".to_string(),
            access_type: AccessType::Hosting,
            mcp_protocol: McpProtocol::Sse,
            status: InstanceStatus::Active,
            environment_id: 1,
            image_address: "img:1".to_string(),
            port: 8080,
            init_script: String::new(),
            command: "./run.sh".to_string(),
            package_id: None,
            env_vars: BTreeMap::new(),
            volume_mounts: Vec::new(),
            startup_timeout_ms: 0,
            running_timeout_ms: 0,
            container_create_options: None,
            container_name: String::new(),
            container_service_name: String::new(),
            container_status: ContainerStatus::Pending,
            container_is_ready: false,
            container_last_message: String::new(),
            source_config: None,
            target_config: None,
            public_proxy_config: None,
            service_path: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn names_are_deterministic_from_the_id_prefix() {
        assert_eq!(
            container_name("a1b2c3d4e5f6"),
            "mcp-instance-a1b2c3d4-container"
        );
        assert_eq!(service_name("a1b2c3d4e5f6"), "mcp-instance-a1b2c3d4-service");
        // Short ids are used as-is.
        assert_eq!(container_name("ab"), "mcp-instance-ab-container");
    }

    #[test]
    fn sse_hosting_runs_the_user_command() {
        let spec = compile(&base_instance(), &market()).unwrap();
        assert_eq!(spec.name, "mcp-instance-a1b2c3d4-container");
        assert_eq!(spec.service_name, "mcp-instance-a1b2c3d4-service");
        assert_eq!(spec.command[0], "/bin/sh");
        assert_eq!(spec.command[1], "-c");
        assert_eq!(spec.command[2], "./run.sh");
        assert_eq!(spec.working_dir, "/app");
    }

    #[test]
    fn fragments_are_ordered_package_then_init_then_launch() {
        let mut instance = base_instance();
        instance.package_id = Some("pkg-42".to_string());
        instance.init_script = "pip install -r requirements.txt".to_string();

        let spec = compile(&instance, &market()).unwrap();
        let script = &spec.command[2];
        let package_pos = script
            .find("http://market:8900/api/code/download/pkg-42")
            .expect("package url");
        let init_pos = script.find("pip install").expect("init script");
        let launch_pos = script.find("./run.sh").expect("launch");
        assert!(package_pos < init_pos && init_pos < launch_pos);
        assert!(script.contains("unzip -o /tmp/codepkg.zip -d /app/codepkg"));
    }

    #[test]
    fn stdio_hosting_writes_the_config_and_launches_the_wrapper() {
        let mut instance = base_instance();
        instance.mcp_protocol = McpProtocol::Stdio;
        instance.command = String::new();
        instance.source_config = Some(McpServersDocument::single(
            "files",
            McpServerEntry {
                command: Some("npx".to_string()),
                args: Some(vec!["-y".to_string(), "server-files".to_string()]),
                transport: Some("stdio".to_string()),
                ..Default::default()
            },
        ));

        let spec = compile(&instance, &market()).unwrap();
        let script = &spec.command[2];
        assert!(script.contains("cat > /app/mcp-servers.json <<'MCP_SERVERS_EOF'"));
        assert!(script.contains("\"command\": \"npx\""));
        assert!(script
            .contains("mcp-hosting --port=8080 --mcp-servers-config /app/mcp-servers.json"));
    }

    #[test]
    fn stdio_without_a_command_is_rejected() {
        let mut instance = base_instance();
        instance.mcp_protocol = McpProtocol::Stdio;
        instance.source_config = Some(McpServersDocument::single(
            "files",
            McpServerEntry {
                url: Some("http://elsewhere/sse".to_string()),
                ..Default::default()
            },
        ));
        let err = compile(&instance, &market()).unwrap_err();
        assert!(matches!(err, InstanceError::Validation(_)));
    }

    #[test]
    fn sse_without_a_command_is_rejected() {
        let mut instance = base_instance();
        instance.command = String::new();
        let err = compile(&instance, &market()).unwrap_err();
        assert!(matches!(err, InstanceError::Validation(_)));
    }

    #[test]
    fn missing_image_is_rejected() {
        let mut instance = base_instance();
        instance.image_address = String::new();
        let err = compile(&instance, &market()).unwrap_err();
        assert!(matches!(err, InstanceError::Validation(_)));
    }

    #[test]
    fn user_env_vars_override_the_defaults() {
        let mut instance = base_instance();
        instance
            .env_vars
            .insert("NODE_ENV".to_string(), "staging".to_string());
        instance
            .env_vars
            .insert("EXTRA".to_string(), "1".to_string());

        let spec = compile(&instance, &market()).unwrap();
        assert_eq!(spec.env.get("NODE_ENV").map(String::as_str), Some("staging"));
        assert_eq!(
            spec.env.get("MCP_INSTANCE_ID").map(String::as_str),
            Some("a1b2c3d4e5f6a7b8")
        );
        assert_eq!(spec.env.get("MCP_PORT").map(String::as_str), Some("8080"));
        assert_eq!(spec.env.get("EXTRA").map(String::as_str), Some("1"));
    }

    #[test]
    fn timeout_labels_only_appear_when_positive() {
        let mut instance = base_instance();
        instance.startup_timeout_ms = 60_000;
        let spec = compile(&instance, &market()).unwrap();
        assert_eq!(
            spec.labels.get(LABEL_STARTUP_TIMEOUT).map(String::as_str),
            Some("60000")
        );
        assert!(spec.labels.get(LABEL_RUNNING_TIMEOUT).is_none());
        assert_eq!(
            spec.labels.get(LABEL_INSTANCE).map(String::as_str),
            Some("a1b2c3d4e5f6a7b8")
        );
    }

    #[test]
    fn target_url_follows_the_effective_protocol() {
        let mut instance = base_instance();
        instance.container_service_name = "mcp-instance-a1b2c3d4-service".to_string();

        assert_eq!(
            derive_target_url(&instance),
            "http://mcp-instance-a1b2c3d4-service:8080/sse"
        );

        instance.mcp_protocol = McpProtocol::StreamableHttp;
        assert_eq!(
            derive_target_url(&instance),
            "http://mcp-instance-a1b2c3d4-service:8080/mcp"
        );

        // Stdio under hosting is wrapped as SSE.
        instance.mcp_protocol = McpProtocol::Stdio;
        assert_eq!(
            derive_target_url(&instance),
            "http://mcp-instance-a1b2c3d4-service:8080/sse"
        );

        instance.mcp_protocol = McpProtocol::Sse;
        instance.service_path = "/custom/path".to_string();
        assert_eq!(
            derive_target_url(&instance),
            "http://mcp-instance-a1b2c3d4-service:8080/custom/path"
        );
    }

    #[test]
    fn public_url_appends_sse_for_streaming_instances() {
        let instance = base_instance();
        assert_eq!(
            derive_public_url("https://mcp.example.com", "mcp-gateway", &instance),
            "https://mcp.example.com/mcp-gateway/a1b2c3d4e5f6a7b8/sse"
        );

        let mut http_instance = base_instance();
        http_instance.mcp_protocol = McpProtocol::StreamableHttp;
        assert_eq!(
            derive_public_url("https://mcp.example.com/", "/mcp-gateway/", &http_instance),
            "https://mcp.example.com/mcp-gateway/a1b2c3d4e5f6a7b8"
        );
    }
}
