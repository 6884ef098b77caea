//! Plain request/response forwarding for passthrough routes.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName};
use axum::response::Response;
use canopy_config::ProtocolClass;
use canopy_observability::RelayMetrics;

use crate::error::{GatewayError, Result};
use crate::route::RouteMatch;
use crate::server::GatewayState;

/// Connection-scoped headers that must not cross the proxy.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn is_forwardable(name: &HeaderName) -> bool {
    !HOP_BY_HOP.contains(name) && name.as_str() != "keep-alive"
}

/// Copy end-to-end headers from `source` into a fresh map.
pub fn forwardable_headers(source: &HeaderMap) -> HeaderMap {
    source
        .iter()
        .filter(|(name, _)| is_forwardable(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

pub async fn forward(
    state: Arc<GatewayState>,
    route: RouteMatch,
    request: Request,
) -> Result<Response> {
    let max_body = state.config.relay.max_body_bytes;
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, max_body)
        .await
        .map_err(|e| GatewayError::body_read(e, max_body))?;

    let url = state.upstream.http_url(&route.upstream_path);
    tracing::debug!(method = %parts.method, url = %url, "Forwarding request");

    let upstream = state
        .http
        .request(parts.method, &url)
        .headers(forwardable_headers(&parts.headers))
        .body(body)
        .send()
        .await
        .map_err(|e| {
            RelayMetrics::upstream_failure(ProtocolClass::Passthrough.as_str());
            GatewayError::UpstreamUnavailable(format!("{}: {}", url, e))
        })?;

    let status = upstream.status();
    let headers = forwardable_headers(upstream.headers());
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_hop_by_hop_headers_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gateway:8081"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let forwarded = forwardable_headers(&headers);
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[header::AUTHORIZATION], "Bearer t");
        assert_eq!(forwarded[header::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_repeated_headers_kept() {
        let mut headers = HeaderMap::new();
        headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));
        let forwarded = forwardable_headers(&headers);
        assert_eq!(forwarded.get_all(header::SET_COOKIE).iter().count(), 2);
    }
}
