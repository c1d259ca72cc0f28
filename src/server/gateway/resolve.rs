use std::collections::BTreeMap;
use std::time::Duration;

use crate::db::models::{AccessType, Instance, InstanceStatus, McpProtocol};
use crate::server::gateway::GatewayError;

/// Default deadline for non-streaming proxied requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The upstream an inbound gateway request resolves to.
#[derive(Debug, Clone)]
pub struct ResolvedUpstream {
    pub access_type: AccessType,
    /// Effective wire protocol after suffix heuristics; never stdio.
    pub protocol: McpProtocol,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub sse_read_timeout: Option<Duration>,
    /// The instance runs the stock hosting wrapper image, which expects a
    /// trailing slash on non-streaming paths.
    pub default_hosting_image: bool,
}

/// Resolve an instance to its upstream. The stored target URL is
/// authoritative: a `/sse` suffix means SSE and `/mcp` means
/// streamable-http regardless of the declared protocol (legacy rows carry
/// no transport field). Stdio upstreams never pass the gateway boundary.
pub fn resolve(instance: &Instance, default_image: &str) -> Result<ResolvedUpstream, GatewayError> {
    if instance.status != InstanceStatus::Active {
        return Err(GatewayError::unroutable(format!(
            "instance {} is inactive",
            instance.instance_id
        )));
    }

    let (name, entry) = instance
        .target_config
        .as_ref()
        .and_then(|config| config.first_entry())
        .ok_or_else(|| {
            GatewayError::unroutable(format!(
                "instance {} has no upstream configured",
                instance.instance_id
            ))
        })?;

    let Some(url) = entry.url.clone().filter(|url| !url.is_empty()) else {
        // A command without a URL is a local stdio server.
        return Err(GatewayError::unroutable(format!(
            "upstream {} is a stdio command, not proxyable",
            name
        )));
    };

    let path = url.split('?').next().unwrap_or(&url);
    let protocol = if path.ends_with("/sse") {
        McpProtocol::Sse
    } else if path.ends_with("/mcp") {
        McpProtocol::StreamableHttp
    } else if entry.transport.is_none()
        && instance.access_type == AccessType::Hosting
        && instance.mcp_protocol == McpProtocol::Stdio
    {
        // The hosting image wraps stdio servers behind SSE.
        McpProtocol::Sse
    } else if let Some(transport) = entry.transport.as_deref() {
        match transport {
            "sse" => McpProtocol::Sse,
            "streamable-http" => McpProtocol::StreamableHttp,
            other => {
                return Err(GatewayError::unroutable(format!(
                    "upstream {} transport {} is not proxyable",
                    name, other
                )))
            }
        }
    } else {
        instance.effective_protocol()
    };

    if protocol == McpProtocol::Stdio {
        return Err(GatewayError::unroutable(format!(
            "upstream {} speaks stdio, not proxyable",
            name
        )));
    }

    Ok(ResolvedUpstream {
        access_type: instance.access_type,
        protocol,
        url,
        headers: entry.headers.clone().unwrap_or_default(),
        timeout: entry.timeout.map(Duration::from_secs),
        sse_read_timeout: entry.sse_read_timeout.map(Duration::from_secs),
        default_hosting_image: is_default_image(&instance.image_address, default_image),
    })
}

/// Image equality ignoring the tag, so `mcp-hosting:v2` still counts.
fn is_default_image(image: &str, default_image: &str) -> bool {
    if default_image.is_empty() || image.is_empty() {
        return false;
    }
    repository(image) == repository(default_image)
}

fn repository(image: &str) -> &str {
    // A colon after the last slash separates the tag.
    match (image.rfind(':'), image.rfind('/')) {
        (Some(colon), Some(slash)) if colon > slash => &image[..colon],
        (Some(colon), None) => &image[..colon],
        _ => image,
    }
}

/// Scheme plus authority of an upstream URL, for event-channel forwards
/// that replace the whole path.
pub fn origin_of(url: &str) -> Result<String, GatewayError> {
    let rest = url
        .strip_prefix("http://")
        .map(|rest| ("http://", rest))
        .or_else(|| url.strip_prefix("https://").map(|rest| ("https://", rest)));
    let Some((scheme, rest)) = rest else {
        return Err(GatewayError::unroutable(format!(
            "upstream url {} has no http scheme",
            url
        )));
    };
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    if authority.is_empty() {
        return Err(GatewayError::unroutable(format!(
            "upstream url {} has no host",
            url
        )));
    }
    Ok(format!("{}{}", scheme, authority))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{McpServerEntry, McpServersDocument};
    use crate::testutil::hosting_instance;

    fn with_target(url: &str) -> Instance {
        let mut instance = hosting_instance("a1b2c3d4", 1);
        instance.target_config = Some(McpServersDocument::single(
            "upstream",
            McpServerEntry {
                url: Some(url.to_string()),
                ..Default::default()
            },
        ));
        instance
    }

    #[test]
    fn sse_suffix_wins_over_declared_protocol() {
        let mut instance = with_target("http://svc:8080/sse");
        instance.mcp_protocol = McpProtocol::StreamableHttp;
        let resolved = resolve(&instance, "").unwrap();
        assert_eq!(resolved.protocol, McpProtocol::Sse);
        assert_eq!(resolved.url, "http://svc:8080/sse");
    }

    #[test]
    fn mcp_suffix_means_streamable_http() {
        let resolved = resolve(&with_target("http://svc:8080/mcp"), "").unwrap();
        assert_eq!(resolved.protocol, McpProtocol::StreamableHttp);
    }

    #[test]
    fn hosted_stdio_with_untyped_url_is_treated_as_sse() {
        let mut instance = with_target("http://svc:8080");
        instance.mcp_protocol = McpProtocol::Stdio;
        let resolved = resolve(&instance, "").unwrap();
        assert_eq!(resolved.protocol, McpProtocol::Sse);
    }

    #[test]
    fn inactive_instances_are_unroutable() {
        let mut instance = with_target("http://svc:8080/sse");
        instance.status = InstanceStatus::Inactive;
        let err = resolve(&instance, "").unwrap_err();
        assert!(err.to_string().contains("inactive"));
    }

    #[test]
    fn stdio_command_upstreams_are_rejected() {
        let mut instance = hosting_instance("a1b2c3d4", 1);
        instance.target_config = Some(McpServersDocument::single(
            "files",
            McpServerEntry {
                command: Some("npx".to_string()),
                transport: Some("stdio".to_string()),
                ..Default::default()
            },
        ));
        let err = resolve(&instance, "").unwrap_err();
        assert!(err.to_string().contains("stdio"));
    }

    #[test]
    fn timeouts_and_headers_come_from_the_entry() {
        let mut instance = hosting_instance("a1b2c3d4", 1);
        instance.target_config = Some(McpServersDocument::single(
            "upstream",
            McpServerEntry {
                url: Some("http://svc:8080/sse".to_string()),
                headers: Some([("authorization".to_string(), "Bearer t".to_string())].into()),
                timeout: Some(10),
                sse_read_timeout: Some(300),
                ..Default::default()
            },
        ));
        let resolved = resolve(&instance, "").unwrap();
        assert_eq!(resolved.timeout, Some(Duration::from_secs(10)));
        assert_eq!(resolved.sse_read_timeout, Some(Duration::from_secs(300)));
        assert_eq!(
            resolved.headers.get("authorization").map(String::as_str),
            Some("Bearer t")
        );
    }

    #[test]
    fn default_image_matches_ignore_tags() {
        assert!(is_default_image("mcp-hosting:v2", "mcp-hosting"));
        assert!(is_default_image(
            "registry.local:5000/mcp-hosting:v2",
            "registry.local:5000/mcp-hosting"
        ));
        assert!(!is_default_image("userimage:1", "mcp-hosting"));
        assert!(!is_default_image("mcp-hosting:v2", ""));
    }

    #[test]
    fn origin_extraction_strips_path_and_query() {
        assert_eq!(
            origin_of("http://svc:8080/sse?x=1").unwrap(),
            "http://svc:8080"
        );
        assert_eq!(origin_of("https://up.example.com").unwrap(), "https://up.example.com");
        assert!(origin_of("ftp://nope").is_err());
    }
}
