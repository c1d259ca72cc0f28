pub mod resolve;
pub mod sse;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{
    HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_ENCODING,
    CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING,
};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use futures::TryStreamExt;
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, warn};

use crate::db::models::McpProtocol;
use crate::db::InstanceStore;
use resolve::{resolve, ResolvedUpstream, DEFAULT_REQUEST_TIMEOUT};
use sse::{rewritten_body, FrameRewriter};

/// Errors surfaced by the proxy: unroutable paths are 405, upstream
/// failures 502, everything else 500.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Unroutable(String),

    #[error("upstream request failed: {0}")]
    Upstream(anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn unroutable(message: impl Into<String>) -> Self {
        GatewayError::Unroutable(message.into())
    }

    pub fn upstream(err: impl Into<anyhow::Error>) -> Self {
        GatewayError::Upstream(err.into())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            GatewayError::Unroutable(message) => {
                debug!(message, "request rejected as unroutable");
                (StatusCode::METHOD_NOT_ALLOWED, message.clone())
            }
            GatewayError::Upstream(err) => {
                warn!(error = %err, "upstream request failed");
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            GatewayError::Internal(err) => {
                error!(error = ?err, "gateway internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Shared gateway dependencies.
pub struct GatewayState {
    pub instances: Arc<dyn InstanceStore>,
    pub http_client: reqwest::Client,
    pub prefix: String,
    pub default_hosting_image: String,
}

/// Router serving `/<prefix>/<instance-id>[/...]` and nothing else.
pub fn router(state: Arc<GatewayState>) -> Router {
    let prefix = state.prefix.trim_matches('/').to_string();
    Router::new()
        .route(&format!("/{}/{{instance_id}}", prefix), any(proxy_handler))
        .route(
            &format!("/{}/{{instance_id}}/{{*path}}", prefix),
            any(proxy_handler),
        )
        .fallback(unroutable_path)
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

async fn unroutable_path() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "path is not routed by this gateway" })),
    )
        .into_response()
}

/// Panics unwind out of the proxy future (a dropped client aborts the
/// underlying machinery); anything that is not a disconnect becomes a 500.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(text) = err.downcast_ref::<String>() {
        text.clone()
    } else if let Some(text) = err.downcast_ref::<&str>() {
        (*text).to_string()
    } else {
        "request handler panicked".to_string()
    };
    if sse::is_normal_disconnect(&message) {
        debug!(message, "client disconnected mid-request");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    error!(message, "proxy handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
        .into_response()
}

async fn proxy_handler(
    State(state): State<Arc<GatewayState>>,
    Path(params): Path<HashMap<String, String>>,
    req: Request,
) -> Result<Response, GatewayError> {
    let instance_id = params
        .get("instance_id")
        .cloned()
        .ok_or_else(|| GatewayError::unroutable("missing instance id"))?;
    let rest = params.get("path").cloned().unwrap_or_default();

    let instance = state
        .instances
        .get(&instance_id)
        .await?
        .ok_or_else(|| GatewayError::unroutable(format!("unknown instance {}", instance_id)))?;
    let resolved = resolve(&instance, &state.default_hosting_image)?;

    let query = req.uri().query().map(str::to_string);
    let (target_url, is_stream) = upstream_url_for(&resolved, &rest, query.as_deref())?;
    debug!(
        instance_id,
        target = target_url,
        stream = is_stream,
        "proxying request"
    );

    let method = req.method().clone();
    let inbound_headers = req.headers().clone();
    let body_stream = req.into_body().into_data_stream();

    let mut request = state.http_client.request(method.clone(), &target_url);
    request = if is_stream {
        // The read is long-lived; only an explicit sseReadTimeout caps it.
        match resolved.sse_read_timeout {
            Some(timeout) => request.timeout(timeout),
            None => request,
        }
    } else {
        request.timeout(resolved.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
    };

    request = request.headers(outgoing_headers(&inbound_headers, &resolved));
    if method != Method::GET && method != Method::HEAD {
        request = request.body(reqwest::Body::wrap_stream(body_stream));
    }

    let upstream_response = request.send().await.map_err(GatewayError::upstream)?;
    Ok(relay_response(
        upstream_response,
        &state.prefix,
        &instance_id,
    ))
}

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Inbound headers minus hop-by-hop and host, with the configured upstream
/// headers merged on top (config wins).
fn outgoing_headers(inbound: &HeaderMap, resolved: &ResolvedUpstream) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop(name) || name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    for (name, value) in &resolved.headers {
        let Ok(name) = name.parse::<HeaderName>() else {
            warn!(header = name, "dropping unparseable configured header");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            warn!(header = %name, "dropping unparseable configured header value");
            continue;
        };
        headers.insert(name, value);
    }
    headers
}

/// Compute the upstream URL for a request and whether it is a long-lived
/// SSE stream. `rest` is the inbound path with `/<prefix>/<instance-id>/`
/// already stripped.
fn upstream_url_for(
    resolved: &ResolvedUpstream,
    rest: &str,
    query: Option<&str>,
) -> Result<(String, bool), GatewayError> {
    match resolved.protocol {
        McpProtocol::Sse => {
            let is_stream = rest.is_empty() || rest == "sse" || rest.ends_with("/sse");
            if is_stream {
                // Streaming handshake: target the upstream URL exactly.
                Ok((with_query(resolved.url.clone(), query), true))
            } else {
                // Event channel: same host, inbound path sans prefix.
                let origin = resolve::origin_of(&resolved.url)?;
                let mut path = format!("/{}", rest);
                if resolved.default_hosting_image && !path.ends_with('/') {
                    path.push('/');
                }
                Ok((with_query(format!("{}{}", origin, path), query), false))
            }
        }
        McpProtocol::StreamableHttp => {
            let mut url = resolved.url.clone();
            if resolved.default_hosting_image && !url.ends_with('/') {
                url.push('/');
            }
            Ok((with_query(url, query), false))
        }
        // resolve() never yields stdio.
        McpProtocol::Stdio => Err(GatewayError::unroutable("stdio upstream")),
    }
}

fn with_query(mut url: String, query: Option<&str>) -> String {
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(query);
    }
    url
}

/// Relay the upstream response. SSE responses get forced streaming headers
/// and flow through the endpoint-frame rewriter, transparently gunzipped.
fn relay_response(upstream: reqwest::Response, prefix: &str, instance_id: &str) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let upstream_headers = upstream.headers().clone();

    let is_sse = upstream_headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("text/event-stream"))
        .unwrap_or(false);

    let mut headers = HeaderMap::new();
    for (name, value) in &upstream_headers {
        if is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if !is_sse {
        let body = Body::from_stream(upstream.bytes_stream());
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        return response;
    }

    let gzip = upstream_headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);

    headers.remove(CONTENT_LENGTH);
    if gzip {
        headers.remove(CONTENT_ENCODING);
    }
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream;charset=UTF-8"),
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

    let io_stream = upstream
        .bytes_stream()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err));
    let decoded = sse::decode_stream(io_stream, gzip);
    let body = rewritten_body(decoded, FrameRewriter::new(prefix, instance_id));

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::AccessType;
    use std::time::Duration;

    fn resolved(protocol: McpProtocol, url: &str, default_image: bool) -> ResolvedUpstream {
        ResolvedUpstream {
            access_type: AccessType::Hosting,
            protocol,
            url: url.to_string(),
            headers: Default::default(),
            timeout: None,
            sse_read_timeout: Some(Duration::from_secs(300)),
            default_hosting_image: default_image,
        }
    }

    #[test]
    fn sse_handshake_targets_the_upstream_url_exactly() {
        let upstream = resolved(McpProtocol::Sse, "http://svc:8080/sse", false);
        let (url, is_stream) = upstream_url_for(&upstream, "sse", None).unwrap();
        assert!(is_stream);
        assert_eq!(url, "http://svc:8080/sse");
    }

    #[test]
    fn sse_event_channel_strips_the_gateway_prefix() {
        let upstream = resolved(McpProtocol::Sse, "http://svc:8080/sse", false);
        let (url, is_stream) =
            upstream_url_for(&upstream, "messages", Some("sessionId=42")).unwrap();
        assert!(!is_stream);
        assert_eq!(url, "http://svc:8080/messages?sessionId=42");
    }

    #[test]
    fn default_hosting_image_gets_a_trailing_slash_on_the_event_channel() {
        let upstream = resolved(McpProtocol::Sse, "http://svc:8080/sse", true);
        let (url, _) = upstream_url_for(&upstream, "messages", None).unwrap();
        assert_eq!(url, "http://svc:8080/messages/");
    }

    #[test]
    fn streamable_http_targets_the_upstream_verbatim() {
        let upstream = resolved(McpProtocol::StreamableHttp, "http://svc:8080/mcp", false);
        let (url, is_stream) = upstream_url_for(&upstream, "anything", None).unwrap();
        assert!(!is_stream);
        assert_eq!(url, "http://svc:8080/mcp");
    }

    #[test]
    fn streamable_http_on_the_hosting_image_gains_a_trailing_slash() {
        let upstream = resolved(McpProtocol::StreamableHttp, "http://svc:8080/mcp", true);
        let (url, _) = upstream_url_for(&upstream, "", Some("a=1")).unwrap();
        assert_eq!(url, "http://svc:8080/mcp/?a=1");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped_and_config_headers_win() {
        let mut inbound = HeaderMap::new();
        inbound.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        inbound.insert(HOST, HeaderValue::from_static("gateway.local"));
        inbound.insert("x-request-id", HeaderValue::from_static("abc"));
        inbound.insert("authorization", HeaderValue::from_static("Bearer inbound"));

        let mut upstream = resolved(McpProtocol::Sse, "http://svc:8080/sse", false);
        upstream
            .headers
            .insert("authorization".to_string(), "Bearer configured".to_string());

        let outgoing = outgoing_headers(&inbound, &upstream);
        assert!(outgoing.get(CONNECTION).is_none());
        assert!(outgoing.get(HOST).is_none());
        assert_eq!(outgoing.get("x-request-id").unwrap(), "abc");
        assert_eq!(outgoing.get("authorization").unwrap(), "Bearer configured");
    }

    #[test]
    fn query_merging_appends_with_the_right_separator() {
        assert_eq!(
            with_query("http://svc/mcp?v=1".to_string(), Some("a=2")),
            "http://svc/mcp?v=1&a=2"
        );
        assert_eq!(with_query("http://svc/mcp".to_string(), None), "http://svc/mcp");
    }
}
