//! 指标收集模块
//!
//! 提供基于 metrics 库的指标收集功能。

use metrics::{describe_counter, describe_gauge, Unit};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::{Config, MetricsConfig};
#[cfg(feature = "prometheus")]
use crate::error::ObservabilityError;
use crate::error::Result;

/// 指标收集器
pub struct MetricsCollector {
    /// Prometheus 句柄
    #[cfg(feature = "prometheus")]
    handle: Option<PrometheusHandle>,

    /// 配置
    config: MetricsConfig,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("config", &self.config)
            .finish()
    }
}

impl MetricsCollector {
    /// 创建新的指标收集器；启用时安装全局 recorder
    pub fn new(config: &Config) -> Result<Self> {
        let mut collector = Self {
            #[cfg(feature = "prometheus")]
            handle: None,
            config: config.metrics.clone(),
        };

        collector.init()?;

        Ok(collector)
    }

    fn init(&mut self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        #[cfg(feature = "prometheus")]
        {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();

            metrics::set_global_recorder(recorder)
                .map_err(|e| ObservabilityError::Recorder(e.to_string()))?;

            self.handle = Some(handle);
        }

        RelayMetrics::describe();

        tracing::info!(
            target: "canopy_observability",
            "Metrics collector initialized"
        );

        Ok(())
    }

    /// 是否启用
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// 获取 Prometheus 格式的指标
    pub fn render(&self) -> String {
        #[cfg(feature = "prometheus")]
        {
            self.handle
                .as_ref()
                .map(|h| h.render())
                .unwrap_or_default()
        }
        #[cfg(not(feature = "prometheus"))]
        {
            String::new()
        }
    }
}

/// 传输会话与中继指标记录器
pub struct RelayMetrics;

impl RelayMetrics {
    const SESSIONS_ACTIVE: &'static str = "canopy_sessions_active";
    const SESSIONS_OPENED: &'static str = "canopy_sessions_opened_total";
    const SESSIONS_CLOSED: &'static str = "canopy_sessions_closed_total";
    const FRAMES_RELAYED: &'static str = "canopy_socket_frames_total";
    const CHUNKS_RELAYED: &'static str = "canopy_stream_chunks_total";
    const STREAMS_TRUNCATED: &'static str = "canopy_stream_truncated_total";
    const STREAMS_CANCELLED: &'static str = "canopy_stream_cancelled_total";
    const UPSTREAM_FAILURES: &'static str = "canopy_upstream_failures_total";

    fn describe() {
        describe_gauge!(Self::SESSIONS_ACTIVE, Unit::Count, "Number of active transport sessions");
        describe_counter!(Self::SESSIONS_OPENED, Unit::Count, "Transport sessions opened");
        describe_counter!(Self::SESSIONS_CLOSED, Unit::Count, "Transport sessions closed");
        describe_counter!(Self::FRAMES_RELAYED, Unit::Count, "Socket frames relayed");
        describe_counter!(Self::CHUNKS_RELAYED, Unit::Count, "Event-stream chunks relayed");
        describe_counter!(
            Self::STREAMS_TRUNCATED,
            Unit::Count,
            "Event streams ended by an upstream failure"
        );
        describe_counter!(
            Self::STREAMS_CANCELLED,
            Unit::Count,
            "Event streams cancelled by inbound disconnect"
        );
        describe_counter!(Self::UPSTREAM_FAILURES, Unit::Count, "Upstream connection failures");
    }

    /// 记录会话创建
    pub fn session_opened(class: &'static str) {
        metrics::counter!(Self::SESSIONS_OPENED, "class" => class).increment(1);
        metrics::gauge!(Self::SESSIONS_ACTIVE, "class" => class).increment(1.0);
    }

    /// 记录会话销毁
    pub fn session_closed(class: &'static str) {
        metrics::counter!(Self::SESSIONS_CLOSED, "class" => class).increment(1);
        metrics::gauge!(Self::SESSIONS_ACTIVE, "class" => class).decrement(1.0);
    }

    /// 记录转发的帧
    pub fn frame_relayed(direction: &'static str) {
        metrics::counter!(Self::FRAMES_RELAYED, "direction" => direction).increment(1);
    }

    /// 记录转发的流分块
    pub fn chunk_relayed(bytes: usize) {
        metrics::counter!(Self::CHUNKS_RELAYED).increment(1);
        metrics::counter!("canopy_stream_bytes_total").increment(bytes as u64);
    }

    pub fn stream_truncated() {
        metrics::counter!(Self::STREAMS_TRUNCATED).increment(1);
    }

    pub fn stream_cancelled() {
        metrics::counter!(Self::STREAMS_CANCELLED).increment(1);
    }

    /// 记录上游失败
    pub fn upstream_failure(class: &'static str) {
        metrics::counter!(Self::UPSTREAM_FAILURES, "class" => class).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_collector_renders_nothing() {
        let collector = MetricsCollector::new(&Config::default().without_metrics()).unwrap();
        assert!(!collector.is_enabled());
        assert!(collector.render().is_empty());
    }

    #[cfg(feature = "prometheus")]
    #[test]
    fn test_metrics_collector_render() {
        let collector = MetricsCollector::new(&Config::default()).unwrap();

        RelayMetrics::session_opened("upgrade");
        RelayMetrics::chunk_relayed(42);

        let rendered = collector.render();
        assert!(rendered.contains("canopy_sessions_opened_total"));
        assert!(rendered.contains("canopy_stream_chunks_total"));
    }
}
