//! Route table: inbound path prefix to protocol class and upstream path.
//!
//! The table and the upstream target are built once at startup and shared
//! read-only by every session.

use canopy_config::{validate_routes, ProtocolClass, RouteConfig};
use url::Url;

use crate::error::{GatewayError, Result};

/// Backend base address, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    http_base: String,
    ws_base: String,
}

impl UpstreamTarget {
    pub fn parse(base_url: &str) -> Result<Self> {
        let url = Url::parse(base_url)
            .map_err(|e| GatewayError::Config(format!("Invalid upstream '{}': {}", base_url, e)))?;

        let ws_scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(GatewayError::Config(format!(
                    "Unsupported upstream scheme '{}'",
                    other
                )))
            }
        };

        let http_base = url.as_str().trim_end_matches('/').to_string();
        let ws_base = format!("{}{}", ws_scheme, &http_base[url.scheme().len()..]);
        Ok(Self { http_base, ws_base })
    }

    /// Absolute http(s) URL for an upstream path (with optional query).
    pub fn http_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.http_base, path_and_query)
    }

    /// Absolute ws(s) URL for an upstream path (with optional query).
    pub fn ws_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.ws_base, path_and_query)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRoute {
    pub prefix: String,
    pub class: ProtocolClass,
    pub rewrite: Option<String>,
}

impl ProxyRoute {
    fn matches(&self, path: &str) -> bool {
        canopy_config::segment_prefix(&self.prefix, path)
    }

    /// Replace the matched prefix with the rewrite target. The remainder of
    /// the path is kept verbatim.
    pub fn rewrite_path(&self, path: &str) -> String {
        let Some(rewrite) = &self.rewrite else {
            return path.to_string();
        };
        let rest = &path[self.prefix.trim_end_matches('/').len()..];
        let rewritten = format!("{}{}", rewrite.trim_end_matches('/'), rest);
        if rewritten.is_empty() {
            "/".to_string()
        } else {
            rewritten
        }
    }
}

impl From<&RouteConfig> for ProxyRoute {
    fn from(config: &RouteConfig) -> Self {
        Self {
            prefix: config.prefix.clone(),
            class: config.class,
            rewrite: config.rewrite.clone(),
        }
    }
}

/// A resolved inbound path.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub class: ProtocolClass,
    pub prefix: String,
    /// Rewritten path plus the original query string.
    pub upstream_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    /// Longest prefix first.
    routes: Vec<ProxyRoute>,
}

impl RouteTable {
    /// Build the table, rejecting overlapping prefixes across classes.
    pub fn new(routes: &[RouteConfig]) -> Result<Self> {
        validate_routes(routes)?;

        let mut routes: Vec<ProxyRoute> = routes.iter().map(ProxyRoute::from).collect();
        routes.sort_by_key(|r| std::cmp::Reverse(r.prefix.trim_end_matches('/').len()));
        Ok(Self { routes })
    }

    /// Resolve an inbound path. `None` means the request belongs to the
    /// presentation layer.
    pub fn resolve(&self, path: &str, query: Option<&str>) -> Option<RouteMatch> {
        let route = self.routes.iter().find(|r| r.matches(path))?;
        let mut upstream_path = route.rewrite_path(path);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            upstream_path.push('?');
            upstream_path.push_str(query);
        }
        Some(RouteMatch {
            class: route.class,
            prefix: route.prefix.clone(),
            upstream_path,
        })
    }

    pub fn routes(&self) -> &[ProxyRoute] {
        &self.routes
    }
}
