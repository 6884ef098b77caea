use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 主配置结构体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub version: String,
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            routes: RouteConfig::defaults(),
            relay: RelayConfig::default(),
            upload: UploadConfig::default(),
            client: ClientConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// 获取配置值的快捷方法
    pub fn get_value(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["version"] => Some(self.version.clone()),
            ["server", "port"] => Some(self.server.port.to_string()),
            ["server", "host"] => Some(self.server.host.clone()),
            ["server", "cors"] => Some(self.server.cors.to_string()),
            ["upstream", "base_url"] => Some(self.upstream.base_url.clone()),
            ["upstream", "connect_timeout_secs"] => {
                Some(self.upstream.connect_timeout_secs.to_string())
            }
            ["relay", "close_grace_ms"] => Some(self.relay.close_grace_ms.to_string()),
            ["relay", "max_sessions"] => Some(self.relay.max_sessions.to_string()),
            ["relay", "max_body_bytes"] => Some(self.relay.max_body_bytes.to_string()),
            ["upload", "enabled"] => Some(self.upload.enabled.to_string()),
            ["upload", "path"] => Some(self.upload.path.clone()),
            ["upload", "target_path"] => Some(self.upload.target_path.clone()),
            ["client", "gateway_url"] => Some(self.client.gateway_url.clone()),
            ["client", "socket_path"] => Some(self.client.socket_path.clone()),
            ["client", "stream_path"] => Some(self.client.stream_path.clone()),
            ["client", "base_delay_ms"] => Some(self.client.base_delay_ms.to_string()),
            ["client", "max_delay_ms"] => Some(self.client.max_delay_ms.to_string()),
            ["client", "connect_timeout_ms"] => Some(self.client.connect_timeout_ms.to_string()),
            ["logging", "level"] => Some(self.logging.level.as_str().to_string()),
            ["logging", "json_format"] => Some(self.logging.json_format.to_string()),
            ["metrics", "enabled"] => Some(self.metrics.enabled.to_string()),
            _ => None,
        }
    }

    /// 设置配置值
    pub fn set_value(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["server", "port"] => {
                self.server.port = value.parse().map_err(|_| {
                    ConfigError::Validation(format!("Invalid port number: {}", value))
                })?;
            }
            ["server", "host"] => {
                self.server.host = value.to_string();
            }
            ["server", "cors"] => {
                self.server.cors = parse_bool(value)?;
            }
            ["upstream", "base_url"] => {
                self.upstream.base_url = value.to_string();
            }
            ["upstream", "connect_timeout_secs"] => {
                self.upstream.connect_timeout_secs = parse_number(value)?;
            }
            ["relay", "close_grace_ms"] => {
                self.relay.close_grace_ms = parse_number(value)?;
            }
            ["relay", "max_sessions"] => {
                self.relay.max_sessions = parse_number(value)?;
            }
            ["relay", "max_body_bytes"] => {
                self.relay.max_body_bytes = parse_number(value)?;
            }
            ["upload", "enabled"] => {
                self.upload.enabled = parse_bool(value)?;
            }
            ["upload", "path"] => {
                self.upload.path = value.to_string();
            }
            ["upload", "target_path"] => {
                self.upload.target_path = value.to_string();
            }
            ["client", "gateway_url"] => {
                self.client.gateway_url = value.to_string();
            }
            ["client", "socket_path"] => {
                self.client.socket_path = value.to_string();
            }
            ["client", "stream_path"] => {
                self.client.stream_path = value.to_string();
            }
            ["client", "base_delay_ms"] => {
                self.client.base_delay_ms = parse_number(value)?;
            }
            ["client", "max_delay_ms"] => {
                self.client.max_delay_ms = parse_number(value)?;
            }
            ["client", "connect_timeout_ms"] => {
                self.client.connect_timeout_ms = parse_number(value)?;
            }
            ["logging", "level"] => {
                self.logging.level = value.parse()?;
            }
            ["logging", "json_format"] => {
                self.logging.json_format = parse_bool(value)?;
            }
            ["metrics", "enabled"] => {
                self.metrics.enabled = parse_bool(value)?;
            }
            _ => return Err(ConfigError::KeyNotFound(key.to_string())),
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> ConfigResult<bool> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid boolean: {}", value)))
}

fn parse_number<T: std::str::FromStr>(value: &str) -> ConfigResult<T> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid number: {}", value)))
}

/// Server 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            host: "127.0.0.1".to_string(),
            cors: true,
        }
    }
}

/// 上游后端配置，进程生命周期内不可变
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// 后端基础地址 (e.g., "http://127.0.0.1:8000")
    pub base_url: String,
    /// 连接上游的超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// 网关自身的健康检查路径
pub const HEALTH_PATH: &str = "/health";
/// 网关自身的指标路径
pub const METRICS_PATH: &str = "/metrics";
/// 路由与上传路径不得占用的路径
pub const RESERVED_PATHS: &[&str] = &[HEALTH_PATH, METRICS_PATH];

/// 路由协议类别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolClass {
    /// 协议升级后的双向持久通道
    Upgrade,
    /// POST 请求，响应为无界的分块事件流
    StreamingPost,
    /// 普通 JSON REST 请求
    Passthrough,
}

impl ProtocolClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolClass::Upgrade => "upgrade",
            ProtocolClass::StreamingPost => "streaming_post",
            ProtocolClass::Passthrough => "passthrough",
        }
    }
}

impl std::fmt::Display for ProtocolClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 路由配置: 入站路径前缀 -> (协议类别, 重写前缀)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    pub prefix: String,
    pub class: ProtocolClass,
    /// 替换匹配前缀的上游前缀；为空时路径原样转发
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<String>,
}

impl RouteConfig {
    pub fn new(prefix: &str, class: ProtocolClass, rewrite: Option<&str>) -> Self {
        Self {
            prefix: prefix.to_string(),
            class,
            rewrite: rewrite.map(str::to_string),
        }
    }

    /// 默认路由表
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("/ws", ProtocolClass::Upgrade, Some("/api/v1/ws")),
            Self::new(
                "/stream",
                ProtocolClass::StreamingPost,
                Some("/api/v1/chat/stream"),
            ),
            Self::new("/api", ProtocolClass::Passthrough, Some("/api/v1")),
        ]
    }

    /// 按路径段匹配: `/ws` 匹配 `/ws` 和 `/ws/chat`，但不匹配 `/wsx`
    pub fn matches(&self, path: &str) -> bool {
        segment_prefix(&self.prefix, path)
    }

    /// 两个前缀是否重叠（相等或其中一个是另一个的段前缀）
    pub fn overlaps(&self, other: &RouteConfig) -> bool {
        segment_prefix(&self.prefix, &other.prefix) || segment_prefix(&other.prefix, &self.prefix)
    }
}

/// `prefix` 是否是 `path` 的段前缀
pub fn segment_prefix(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Relay 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    /// 一端关闭后等待另一端完成关闭的宽限期（毫秒）
    pub close_grace_ms: u64,
    /// 最大并发会话数
    pub max_sessions: usize,
    /// 流式 POST 请求体上限（字节）
    pub max_body_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            close_grace_ms: 2000,
            max_sessions: 1000,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

/// 文件上传边界配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadConfig {
    pub enabled: bool,
    /// 入站路径
    pub path: String,
    /// 上游路径
    pub target_path: String,
    /// 附加的服务凭据
    #[serde(flatten)]
    pub auth: AuthSettings,
    pub max_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/api/upload".to_string(),
            target_path: "/api/v1/files".to_string(),
            auth: AuthSettings::Bearer {
                env: "CANOPY_SERVICE_TOKEN".to_string(),
            },
            max_bytes: 20 * 1024 * 1024,
        }
    }
}

/// Authentication settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "auth_type", rename_all = "snake_case")]
pub enum AuthSettings {
    /// API Key authentication - reads from environment variable
    ApiKey { env: String },
    /// Bearer token authentication - reads from environment variable
    Bearer { env: String },
    /// No authentication
    #[default]
    None,
}

impl AuthSettings {
    /// Resolve the credential into a `(header name, header value)` pair.
    ///
    /// Returns `Ok(None)` when no credential is configured and an error when
    /// the configured environment variable is missing.
    pub fn header(&self) -> ConfigResult<Option<(&'static str, String)>> {
        match self {
            Self::ApiKey { env } => std::env::var(env)
                .map(|key| Some(("x-api-key", key)))
                .map_err(|_| ConfigError::EnvVarNotFound(env.clone())),
            Self::Bearer { env } => std::env::var(env)
                .map(|token| Some(("authorization", format!("Bearer {}", token))))
                .map_err(|_| ConfigError::EnvVarNotFound(env.clone())),
            Self::None => Ok(None),
        }
    }
}

/// 客户端配置（canopy CLI 使用）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub gateway_url: String,
    pub socket_path: String,
    pub stream_path: String,
    /// 重连退避基准（毫秒）
    pub base_delay_ms: u64,
    /// 重连退避上限（毫秒）
    pub max_delay_ms: u64,
    /// 抖动比例 0.0 - 1.0
    pub jitter_factor: f64,
    /// 单次握手超时（毫秒），超时按连接丢失处理
    #[serde(default = "default_client_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_client_connect_timeout() -> u64 {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://127.0.0.1:8081".to_string(),
            socket_path: "/ws".to_string(),
            stream_path: "/stream".to_string(),
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
            connect_timeout_ms: default_client_connect_timeout(),
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    #[serde(default)]
    pub json_format: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    /// 模块级别覆盖 (e.g., "canopy_gateway" -> "debug")
    #[serde(default)]
    pub module_levels: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            ansi_colors: true,
            module_levels: HashMap::new(),
        }
    }
}

/// Metrics 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    /// 是否在 /metrics 暴露 Prometheus 指标
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.routes.len(), 3);
        assert_eq!(config.routes[0].class, ProtocolClass::Upgrade);
    }

    #[test]
    fn test_segment_prefix() {
        assert!(segment_prefix("/ws", "/ws"));
        assert!(segment_prefix("/ws", "/ws/chat"));
        assert!(segment_prefix("/ws/", "/ws/chat"));
        assert!(!segment_prefix("/ws", "/wsx"));
        assert!(!segment_prefix("/ws/chat", "/ws"));
    }

    #[test]
    fn test_route_overlap() {
        let api = RouteConfig::new("/api", ProtocolClass::Passthrough, None);
        let stream = RouteConfig::new("/api/chat/stream", ProtocolClass::StreamingPost, None);
        let ws = RouteConfig::new("/ws", ProtocolClass::Upgrade, None);

        assert!(api.overlaps(&stream));
        assert!(stream.overlaps(&api));
        assert!(!api.overlaps(&ws));
    }

    #[test]
    fn test_protocol_class_serialization() {
        let route = RouteConfig::new("/stream", ProtocolClass::StreamingPost, Some("/api/v1/chat"));
        let json = serde_json::to_string(&route).unwrap();
        assert!(json.contains("\"streaming_post\""));

        let route: RouteConfig =
            serde_json::from_str(r#"{"prefix":"/ws","class":"upgrade"}"#).unwrap();
        assert_eq!(route.class, ProtocolClass::Upgrade);
        assert!(route.rewrite.is_none());
    }

    #[test]
    fn test_get_set_value() {
        let mut config = Config::default();
        config.set_value("relay.max_sessions", "12").unwrap();
        assert_eq!(config.get_value("relay.max_sessions").as_deref(), Some("12"));

        config.set_value("logging.level", "debug").unwrap();
        assert_eq!(config.get_value("logging.level").as_deref(), Some("debug"));

        assert!(config.set_value("server.port", "not-a-port").is_err());
        assert!(matches!(
            config.set_value("nope.key", "1"),
            Err(ConfigError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_auth_settings_header() {
        std::env::set_var("CANOPY_TEST_UPLOAD_TOKEN", "secret");
        let auth = AuthSettings::Bearer {
            env: "CANOPY_TEST_UPLOAD_TOKEN".to_string(),
        };
        let (name, value) = auth.header().unwrap().unwrap();
        assert_eq!(name, "authorization");
        assert_eq!(value, "Bearer secret");

        let missing = AuthSettings::ApiKey {
            env: "CANOPY_TEST_MISSING_KEY".to_string(),
        };
        assert!(matches!(missing.header(), Err(ConfigError::EnvVarNotFound(_))));
        assert!(AuthSettings::None.header().unwrap().is_none());
    }
}
