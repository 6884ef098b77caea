//! Canopy Observability Infrastructure
//!
//! 提供统一的日志与指标功能。

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::Config;
pub use error::{ObservabilityError, Result};
pub use logging::LogManager;
pub use metrics::{MetricsCollector, RelayMetrics};

use parking_lot::RwLock;
use std::sync::Arc;

/// 进程级日志与指标句柄
#[derive(Debug)]
pub struct Observability {
    log_manager: RwLock<LogManager>,
    metrics: Arc<MetricsCollector>,
}

impl Observability {
    /// 安装全局订阅者与指标记录器（每个进程调用一次）
    pub fn init(config: Config) -> Result<Self> {
        let log_manager = RwLock::new(LogManager::new(&config)?);
        let metrics = Arc::new(MetricsCollector::new(&config)?);

        tracing::info!(
            target: "canopy_observability",
            json = config.logging.json_format,
            metrics = config.metrics.enabled,
            "Observability initialized"
        );

        Ok(Self {
            log_manager,
            metrics,
        })
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    /// 动态更新基础日志级别
    pub fn update_log_level(&self, level: &str) -> Result<()> {
        self.log_manager.write().update_level(level)
    }
}
