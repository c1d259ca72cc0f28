use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub market: MarketSettings,
    #[serde(default)]
    pub hosting: HostingSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// First path segment of every proxied URL.
    #[serde(default = "default_gateway_prefix")]
    pub prefix: String,
    /// Externally visible base URL, used to derive public proxy configs.
    #[serde(default = "default_gateway_domain")]
    pub domain: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            prefix: default_gateway_prefix(),
            domain: default_gateway_domain(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub url: String,
}

/// Where hosted containers download code packages from.
#[derive(Debug, Deserialize, Clone)]
pub struct MarketSettings {
    #[serde(default = "default_market_host")]
    pub host: String,
    #[serde(default = "default_market_port")]
    pub port: u16,
    #[serde(default = "default_market_prefix")]
    pub prefix: String,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            host: default_market_host(),
            port: default_market_port(),
            prefix: default_market_prefix(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostingSettings {
    /// Image of the stock stdio-to-SSE wrapper. Instances running it get
    /// the trailing-slash treatment at the gateway.
    #[serde(default = "default_hosting_image")]
    pub default_image: String,
    /// Bridge network the Docker runtime attaches workloads to.
    #[serde(default = "default_docker_network")]
    pub docker_network: String,
}

impl Default for HostingSettings {
    fn default() -> Self {
        Self {
            default_image: default_hosting_image(),
            docker_network: default_docker_network(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorSettings {
    /// Six-field cron expression with a seconds column.
    #[serde(default = "default_monitor_cron")]
    pub cron: String,
    #[serde(default = "default_monitor_concurrency")]
    pub max_concurrency: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            cron: default_monitor_cron(),
            max_concurrency: default_monitor_concurrency(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8000
}

fn default_gateway_port() -> u16 {
    8010
}

fn default_gateway_prefix() -> String {
    "mcp-gateway".to_string()
}

fn default_gateway_domain() -> String {
    "http://localhost:8010".to_string()
}

fn default_market_host() -> String {
    "mcp-market".to_string()
}

fn default_market_port() -> u16 {
    8900
}

fn default_market_prefix() -> String {
    "api".to_string()
}

fn default_hosting_image() -> String {
    "mcp-hosting".to_string()
}

fn default_docker_network() -> String {
    "mcp-network".to_string()
}

fn default_monitor_cron() -> String {
    "*/30 * * * * *".to_string()
}

fn default_monitor_concurrency() -> usize {
    10
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = env::var("MCP_CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::from_dir(&config_dir)
    }

    pub fn from_dir(config_dir: &str) -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut settings: Settings = Config::builder()
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            // MCP_GATEWAY__PREFIX=mcp sets gateway.prefix, etc.
            .add_source(Environment::with_prefix("MCP").separator("__"))
            .build()?
            .try_deserialize()?;

        // DATABASE_URL wins over both file config and MCP_DATABASE__URL.
        if let Ok(database_url) = env::var("DATABASE_URL") {
            if !database_url.is_empty() {
                settings.database.url = database_url;
            }
        }

        if settings.database.url.is_empty() {
            return Err(ConfigError::Message(
                "database.url must be set (or DATABASE_URL exported)".to_string(),
            ));
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_everything_but_the_database() {
        let settings: Settings = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.gateway.prefix, "mcp-gateway");
        assert_eq!(settings.monitor.cron, "*/30 * * * * *");
        assert_eq!(settings.monitor.max_concurrency, 10);
        assert_eq!(settings.hosting.default_image, "mcp-hosting");
        assert!(settings.database.url.is_empty());
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let settings: Settings = serde_json::from_value(serde_json::json!({
            "gateway": {"prefix": "mcp", "domain": "https://mcp.example.com"},
            "monitor": {"max_concurrency": 4}
        }))
        .unwrap();
        assert_eq!(settings.gateway.prefix, "mcp");
        assert_eq!(settings.gateway.domain, "https://mcp.example.com");
        assert_eq!(settings.gateway.port, 8010);
        assert_eq!(settings.monitor.max_concurrency, 4);
    }
}
