use crate::config::{
    Config, ConfigError, ConfigResult, ProtocolClass, RouteConfig, RESERVED_PATHS,
};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// 配置管理器
///
/// 上游地址与路由表在进程生命周期内不可变；`reload` 重新读取文件，
/// 服务端只从中取日志级别。
#[derive(Clone)]
pub struct ConfigManager {
    path: PathBuf,
    config: Arc<RwLock<Config>>,
}

impl ConfigManager {
    /// 加载配置文件；文件不存在时写入默认配置
    pub async fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            info!("Config file not found, writing defaults to {:?}", path);
            let manager = Self::new(Config::default(), path.to_path_buf());
            manager.save().await?;
            return Ok(manager);
        }

        info!("Loading config from {:?}", path);
        let config = Self::read_file(path).await?;
        Ok(Self::new(config, path.to_path_buf()))
    }

    async fn read_file(path: &Path) -> ConfigResult<Config> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&Self::expand_env_vars(&content)?)?)
    }

    /// 以内存中的配置创建管理器，不读文件
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            path,
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// 获取配置快照
    pub async fn snapshot(&self) -> Config {
        self.config.read().await.clone()
    }

    /// 保存配置到文件（父目录不存在时创建）
    pub async fn save(&self) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(&*self.config.read().await)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, content).await?;
        info!("Config saved to {:?}", self.path);
        Ok(())
    }

    /// 重新读取文件；校验失败时保留当前配置
    pub async fn reload(&self) -> ConfigResult<()> {
        let config = Self::read_file(&self.path).await?;
        Self::validate(&config)?;
        *self.config.write().await = config;
        info!("Config reloaded from {:?}", self.path);
        Ok(())
    }

    /// 修改后写回文件；闭包出错时内存中的配置保持不变
    pub async fn update<F>(&self, f: F) -> ConfigResult<()>
    where
        F: FnOnce(&mut Config) -> ConfigResult<()>,
    {
        let mut next = self.snapshot().await;
        f(&mut next)?;
        *self.config.write().await = next;
        self.save().await
    }

    /// 验证配置，启动时失败即退出
    pub fn validate(config: &Config) -> ConfigResult<()> {
        if config.server.port == 0 {
            return Err(ConfigError::Validation(
                "Server port cannot be 0".to_string(),
            ));
        }

        // 上游地址必须存在且为 http(s)
        if config.upstream.base_url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Upstream base_url is required".to_string(),
            ));
        }
        let upstream = url::Url::parse(&config.upstream.base_url).map_err(|e| {
            ConfigError::Validation(format!(
                "Invalid upstream base_url '{}': {}",
                config.upstream.base_url, e
            ))
        })?;
        if !matches!(upstream.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "Upstream base_url must be http or https, got '{}'",
                upstream.scheme()
            )));
        }

        if config.relay.close_grace_ms == 0 {
            return Err(ConfigError::Validation(
                "Relay close_grace_ms must be greater than 0".to_string(),
            ));
        }
        if config.relay.max_sessions == 0 {
            return Err(ConfigError::Validation(
                "Relay max_sessions must be greater than 0".to_string(),
            ));
        }

        validate_routes(&config.routes)?;

        if config.upload.enabled {
            if !config.upload.path.starts_with('/') || !config.upload.target_path.starts_with('/') {
                return Err(ConfigError::Validation(
                    "Upload path and target_path must start with '/'".to_string(),
                ));
            }
            let upload_path = config.upload.path.trim_end_matches('/');
            if RESERVED_PATHS.iter().any(|reserved| *reserved == upload_path) {
                return Err(ConfigError::Validation(format!(
                    "Upload path '{}' is reserved by the gateway",
                    config.upload.path
                )));
            }
            let shadows_special = config.routes.iter().any(|route| {
                route.class != ProtocolClass::Passthrough && route.matches(&config.upload.path)
            });
            if shadows_special {
                return Err(ConfigError::Validation(format!(
                    "Upload path '{}' falls under an upgrade or streaming route",
                    config.upload.path
                )));
            }
        }

        if config.client.base_delay_ms > config.client.max_delay_ms {
            return Err(ConfigError::Validation(
                "Client base_delay_ms cannot exceed max_delay_ms".to_string(),
            ));
        }

        Ok(())
    }

    /// 展开 `${VAR}` 与 `${VAR:-default}`，未设置且无默认值时报错
    pub fn expand_env_vars(content: &str) -> ConfigResult<String> {
        let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| ConfigError::Validation(format!("Invalid env pattern: {}", e)))?;

        let mut expanded = String::with_capacity(content.len());
        let mut last = 0;
        for cap in pattern.captures_iter(content) {
            let Some(whole) = cap.get(0) else { continue };
            let name = &cap[1];
            let value = match (std::env::var(name), cap.get(2)) {
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.as_str().to_string(),
                (Err(_), None) => return Err(ConfigError::EnvVarNotFound(name.to_string())),
            };
            expanded.push_str(&content[last..whole.start()]);
            expanded.push_str(&value);
            last = whole.end();
        }
        expanded.push_str(&content[last..]);

        Ok(expanded)
    }

    /// 获取配置文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// 校验路由表：前缀格式、重复与跨类别重叠、保留路径冲突
pub fn validate_routes(routes: &[RouteConfig]) -> ConfigResult<()> {
    for route in routes {
        if !route.prefix.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "Route prefix '{}' must start with '/'",
                route.prefix
            )));
        }
        if let Some(rewrite) = &route.rewrite {
            if !rewrite.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "Route rewrite '{}' must start with '/'",
                    rewrite
                )));
            }
        }
        if let Some(reserved) = RESERVED_PATHS.iter().find(|path| route.matches(path)) {
            return Err(ConfigError::Validation(format!(
                "Route prefix '{}' shadows the gateway's own '{}'",
                route.prefix, reserved
            )));
        }
    }

    for (i, a) in routes.iter().enumerate() {
        for b in &routes[i + 1..] {
            if a.prefix.trim_end_matches('/') == b.prefix.trim_end_matches('/') {
                return Err(ConfigError::Validation(format!(
                    "Duplicate route prefix '{}'",
                    a.prefix
                )));
            }
            if a.class != b.class && a.overlaps(b) {
                return Err(ConfigError::Validation(format!(
                    "Route prefix '{}' ({}) overlaps '{}' ({})",
                    a.prefix, a.class, b.prefix, b.class
                )));
            }
        }
    }

    Ok(())
}
