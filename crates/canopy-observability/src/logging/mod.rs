//! 结构化日志模块
//!
//! 提供基于 tracing 的结构化日志功能。

use std::sync::Arc;

use parking_lot::RwLock;
use tracing_subscriber::{
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::config::{Config, LoggingConfig};
use crate::error::{ObservabilityError, Result};

/// 日志级别重新加载句柄类型
type ReloadHandle = Handle<EnvFilter, Registry>;

/// 日志管理器
#[derive(Debug)]
pub struct LogManager {
    /// 配置
    config: LoggingConfig,

    /// 过滤器重新加载句柄
    reload_handle: Option<Arc<RwLock<ReloadHandle>>>,
}

impl LogManager {
    /// 创建并安装全局日志订阅者
    ///
    /// 进程内已存在全局订阅者时返回错误。
    pub fn new(config: &Config) -> Result<Self> {
        let mut manager = Self {
            config: config.logging.clone(),
            reload_handle: None,
        };

        manager.init()?;

        Ok(manager)
    }

    fn init(&mut self) -> Result<()> {
        let filter = self.build_filter()?;
        let (filter, reload_handle) = reload::Layer::new(filter);

        let registry = tracing_subscriber::registry().with(filter);

        let installed = if self.config.json_format {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(self.config.source_location)
                .with_line_number(self.config.source_location)
                .with_ansi(false);

            registry.with(layer).try_init()
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(self.config.source_location)
                .with_line_number(self.config.source_location)
                .with_ansi(self.config.ansi_colors);

            registry.with(layer).try_init()
        };

        installed.map_err(|e| ObservabilityError::Subscriber(e.to_string()))?;
        self.reload_handle = Some(Arc::new(RwLock::new(reload_handle)));

        tracing::info!(
            target: "canopy_observability",
            "Log manager initialized with level: {}",
            self.config.level
        );

        Ok(())
    }

    /// 构建环境过滤器
    fn build_filter(&self) -> Result<EnvFilter> {
        build_filter(&self.config)
    }

    /// 动态更新日志级别（保留模块级别覆盖）
    pub fn update_level(&mut self, level: &str) -> Result<()> {
        let mut next = self.config.clone();
        next.level = level.to_string();
        let new_filter = build_filter(&next)?;

        let handle = self
            .reload_handle
            .as_ref()
            .ok_or_else(|| ObservabilityError::Reload("log manager not initialized".to_string()))?;

        handle
            .write()
            .modify(|filter| *filter = new_filter)
            .map_err(|e| ObservabilityError::Reload(e.to_string()))?;

        self.config.level = level.to_string();

        tracing::info!(
            target: "canopy_observability",
            "Log level updated to: {}",
            level
        );

        Ok(())
    }

    /// 获取当前配置
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }
}

/// 根据日志配置构建过滤器（基础级别 + 模块级别覆盖）
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| ObservabilityError::invalid_filter(&config.level, e))?;

    for (module, level) in &config.module_levels {
        let directive = format!("{}={}", module, level);
        let parsed = directive
            .parse()
            .map_err(|e| ObservabilityError::invalid_filter(&directive, e))?;
        filter = filter.add_directive(parsed);
    }

    Ok(filter)
}

/// 创建带有请求上下文的 span
pub fn create_request_span(request_id: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        request_id = %request_id,
        path = %path,
    )
}

/// 创建带有传输会话上下文的 span
pub fn create_session_span(session_id: &str, class: &str) -> tracing::Span {
    tracing::info_span!(
        "session",
        session_id = %session_id,
        class = %class,
    )
}
