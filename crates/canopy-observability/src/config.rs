//! 观测性配置
//!
//! 由 canopy-config 的主配置转换而来；测试中可直接用构建方法组装。

use std::collections::HashMap;

/// 观测性配置
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.logging.level = level.into();
        self
    }

    pub fn with_json_format(mut self, json: bool) -> Self {
        self.logging.json_format = json;
        self
    }

    /// 添加模块级别覆盖，例如 `("canopy_gateway", "debug")`
    pub fn with_module_level(
        mut self,
        module: impl Into<String>,
        level: impl Into<String>,
    ) -> Self {
        self.logging.module_levels.insert(module.into(), level.into());
        self
    }

    pub fn without_metrics(mut self) -> Self {
        self.metrics.enabled = false;
        self
    }
}

impl From<&canopy_config::Config> for Config {
    fn from(config: &canopy_config::Config) -> Self {
        Self {
            logging: LoggingConfig {
                level: config.logging.level.as_str().to_string(),
                json_format: config.logging.json_format,
                module_levels: config.logging.module_levels.clone(),
                ansi_colors: config.logging.ansi_colors,
                source_location: true,
            },
            metrics: MetricsConfig {
                enabled: config.metrics.enabled,
            },
        }
    }
}

/// 日志输出配置
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// 基础过滤级别，语法同 `RUST_LOG`
    pub level: String,
    pub json_format: bool,
    pub module_levels: HashMap<String, String>,
    /// JSON 输出时忽略
    pub ansi_colors: bool,
    /// 输出事件所在模块与行号
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            json_format: false,
            module_levels: HashMap::new(),
            ansi_colors: true,
            source_location: true,
        }
    }
}

/// 指标配置
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}
