pub mod config;
pub mod manager;

pub use config::{
    segment_prefix, AuthSettings, ClientConfig, Config, ConfigError, ConfigResult, LogLevel,
    LoggingConfig, MetricsConfig, ProtocolClass, RelayConfig, RouteConfig, ServerConfig,
    UploadConfig, UpstreamConfig, HEALTH_PATH, METRICS_PATH, RESERVED_PATHS,
};
pub use manager::{validate_routes, ConfigManager};

use std::path::PathBuf;

/// 展开路径中的 ~ 为用户主目录
pub fn expand_tilde(path: &str) -> Option<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None => Some(PathBuf::from(path)),
    }
}
