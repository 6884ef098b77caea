use anyhow::Context;
use canopy_config::ConfigManager;
use canopy_gateway::Gateway;
use canopy_observability::Observability;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(name = "canopy-server")]
#[command(about = "Canopy transport gateway")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(long, env = "DEBUG", default_value = "false")]
    debug: bool,

    /// Listen port (overrides config)
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Listen host (overrides config)
    #[arg(long, env = "CANOPY_HOST")]
    host: Option<String>,

    /// Upstream base URL (overrides config)
    #[arg(long, env = "CANOPY_UPSTREAM")]
    upstream: Option<String>,

    /// Log level (overrides config)
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Config file path
    #[arg(long, env = "CANOPY_CONFIG", default_value = "~/.canopy/config.json")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 展开配置文件路径
    let config_path = canopy_config::expand_tilde(&cli.config)
        .unwrap_or_else(|| std::path::PathBuf::from(&cli.config));

    // 加载配置
    let config_manager = ConfigManager::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // CLI 参数覆盖配置文件（不写回磁盘）
    let mut config = config_manager.snapshot().await;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(upstream) = &cli.upstream {
        config.upstream.base_url = upstream.clone();
    }
    ConfigManager::validate(&config).context("Invalid configuration")?;

    // 初始化日志与指标
    let log_level = cli.log_level.clone().or_else(|| cli.debug.then(|| "debug".to_string()));
    let mut observability_config = canopy_observability::Config::from(&config);
    if let Some(level) = log_level {
        observability_config = observability_config.with_log_level(&level);
    }
    let observability = Arc::new(
        Observability::init(observability_config).context("Failed to initialize observability")?,
    );

    tracing::info!("Config loaded from {:?}", config_manager.path());
    tracing::info!("Starting Canopy gateway on {}:{}", config.server.host, config.server.port);
    tracing::info!("  Upstream: {}", config.upstream.base_url);
    tracing::info!("  Routes: {}", config.routes.len());
    let upload = if config.upload.enabled {
        config.upload.path.as_str()
    } else {
        "disabled"
    };
    tracing::info!("  Upload: {}", upload);
    if cli.debug {
        tracing::debug!("  CORS: {}", config.server.cors);
        tracing::debug!("  Max sessions: {}", config.relay.max_sessions);
        tracing::debug!("  Close grace: {}ms", config.relay.close_grace_ms);
    }

    let config_manager = Arc::new(config_manager);
    tokio::spawn(reload_on_hangup(Arc::clone(&config_manager), Arc::clone(&observability)));

    let gateway = Gateway::new(config)
        .context("Failed to start gateway")?
        .with_metrics(observability.metrics());

    gateway.run(shutdown_signal()).await?;
    Ok(())
}

/// SIGHUP 时重新读取配置文件并应用新的日志级别（其余配置需重启生效）
#[cfg(unix)]
async fn reload_on_hangup(config_manager: Arc<ConfigManager>, observability: Arc<Observability>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!("Failed to listen for SIGHUP: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        if let Err(e) = config_manager.reload().await {
            tracing::error!("Failed to reload config: {}", e);
            continue;
        }
        let level = config_manager.snapshot().await.logging.level;
        match observability.update_log_level(level.as_str()) {
            Ok(()) => tracing::info!("Log level reloaded: {}", level.as_str()),
            Err(e) => tracing::error!("Failed to apply log level: {}", e),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(
    _config_manager: Arc<ConfigManager>,
    _observability: Arc<Observability>,
) {
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
