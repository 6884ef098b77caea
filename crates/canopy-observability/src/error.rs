//! 观测性错误类型

/// 日志与指标初始化、热更新时的错误
#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    /// 过滤指令无法解析
    #[error("Invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    /// 全局日志订阅者已存在或安装失败
    #[error("Failed to install log subscriber: {0}")]
    Subscriber(String),

    /// 过滤器热更新失败
    #[error("Failed to reload log filter: {0}")]
    Reload(String),

    /// 全局指标记录器已存在或安装失败
    #[error("Failed to install metrics recorder: {0}")]
    Recorder(String),
}

impl ObservabilityError {
    pub(crate) fn invalid_filter(
        directive: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidFilter {
            directive: directive.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservabilityError>;
