//! Gateway HTTP server - 单一监听地址上的路由分发
//!
//! Every inbound request is classified by path prefix and upgrade intent and
//! handed to the socket relay, the stream relay, plain forwarding or the
//! presentation router.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, FromRequestParts, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use canopy_config::{Config, ConfigManager, ProtocolClass, HEALTH_PATH, METRICS_PATH};
use canopy_observability::logging::create_request_span;
use canopy_observability::MetricsCollector;
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::error::{GatewayError, Result};
use crate::route::{RouteTable, UpstreamTarget};
use crate::session::SessionRegistry;
use crate::{rest, socket_relay, stream_relay, upload};

/// 共享状态 - 启动后只读（会话表除外）
#[derive(Clone)]
pub struct GatewayState {
    pub config: Config,
    pub routes: RouteTable,
    pub upstream: UpstreamTarget,
    pub http: reqwest::Client,
    pub sessions: SessionRegistry,
    metrics: Option<Arc<MetricsCollector>>,
    presentation: Router,
}

/// Transport gateway.
pub struct Gateway {
    state: GatewayState,
}

impl Gateway {
    /// Validate the configuration and build the gateway. Overlapping routes
    /// or a bad upstream fail here, never at request time.
    pub fn new(config: Config) -> Result<Self> {
        ConfigManager::validate(&config)?;
        let routes = RouteTable::new(&config.routes)?;
        let upstream = UpstreamTarget::parse(&config.upstream.base_url)?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.upstream.connect_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to build HTTP client: {}", e)))?;
        let sessions = SessionRegistry::new(config.relay.max_sessions);

        Ok(Self {
            state: GatewayState {
                config,
                routes,
                upstream,
                http,
                sessions,
                metrics: None,
                presentation: Router::new().fallback(presentation_not_found),
            },
        })
    }

    /// Router that serves every path no relay route claims.
    pub fn with_presentation(mut self, presentation: Router) -> Self {
        self.state.presentation = presentation;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.state.metrics = Some(metrics);
        self
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.state.sessions
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// 创建路由
    pub fn router(&self) -> Router {
        let state = Arc::new(self.state.clone());
        let config = &state.config;

        let mut router = Router::new()
            .route(HEALTH_PATH, get(health_handler))
            .route(METRICS_PATH, get(metrics_handler));

        if config.upload.enabled {
            router = router.route(
                &config.upload.path,
                post(upload::upload).layer(DefaultBodyLimit::max(config.upload.max_bytes)),
            );
        }

        let mut router = router
            .fallback(dispatch)
            .layer(TraceLayer::new_for_http());
        if config.server.cors {
            router = router.layer(CorsLayer::permissive());
        }
        router.with_state(state)
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(
            "Canopy gateway listening on http://{} (upstream {})",
            addr,
            self.state.config.upstream.base_url
        );
        for route in self.state.routes.routes() {
            tracing::debug!(
                prefix = %route.prefix,
                class = route.class.as_str(),
                rewrite = route.rewrite.as_deref().unwrap_or("-"),
                "Route registered"
            );
        }

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!("Canopy gateway stopped");
        Ok(())
    }

    /// 运行 HTTP 服务器
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.state.config.server.host, self.state.config.server.port
        )
        .parse()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }
}

/// 健康检查处理器
async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "sessions": state.sessions.len(),
    }))
}

/// 指标导出处理器
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match &state.metrics {
        Some(metrics) if metrics.is_enabled() => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics.render(),
        )
            .into_response(),
        _ => GatewayError::NotFound("metrics are disabled".to_string()).into_response(),
    }
}

async fn presentation_not_found(uri: Uri) -> GatewayError {
    GatewayError::NotFound(uri.path().to_string())
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let has_token = |name: header::HeaderName, token: &str| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case(token))
    };
    has_token(header::CONNECTION, "upgrade") && has_token(header::UPGRADE, "websocket")
}

/// Classify the request and hand it to the matching relay.
async fn dispatch(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let request_id = uuid::Uuid::new_v4().to_string();
    let span = create_request_span(&request_id, &path);

    async move {
        let query = request.uri().query().map(str::to_string);
        let Some(route) = state.routes.resolve(&path, query.as_deref()) else {
            return match state.presentation.clone().oneshot(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
        };

        let upgrade = is_upgrade_request(request.headers());
        let result = match (route.class, upgrade) {
            (ProtocolClass::Upgrade, true) => {
                let (mut parts, _body) = request.into_parts();
                match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
                    Ok(ws) => {
                        socket_relay::relay(state.clone(), route, ws, parts.headers, &path).await
                    }
                    Err(rejection) => Err(GatewayError::BadRequest(rejection.body_text())),
                }
            }
            (ProtocolClass::Upgrade, false) => Err(GatewayError::BadRequest(format!(
                "{} requires a protocol upgrade",
                path
            ))),
            (_, true) => Err(GatewayError::BadRequest(format!(
                "{} does not accept protocol upgrades",
                path
            ))),
            (ProtocolClass::StreamingPost, false) if request.method() != Method::POST => Err(
                GatewayError::MethodNotAllowed(format!("{} {}", request.method(), path)),
            ),
            (ProtocolClass::StreamingPost, false) => {
                stream_relay::relay(state.clone(), route, request).await
            }
            (ProtocolClass::Passthrough, false) => {
                rest::forward(state.clone(), route, request).await
            }
        };

        match result {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }
    .instrument(span)
    .await
}
