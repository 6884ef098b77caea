use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use eventsource_client::Client;
use futures::StreamExt;
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;

use canopy_core::{
    spawn_ticker, AnswerValue, ClientEvent, ClientRuntime, ClientStore, ConnectionSnapshot,
    ConnectionStatus, ModalEvent, StoreEvent, StreamFrame, StreamMonitor, StreamOutcome,
};

mod transport;

use transport::{BackoffPolicy, ReconnectingSocket};

#[derive(Parser)]
#[command(name = "canopy")]
#[command(about = "Client tool for the Canopy gateway")]
#[command(version)]
struct Cli {
    /// Gateway URL (overrides config)
    #[arg(long, env = "CANOPY_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Enable debug mode
    #[arg(long, short, default_value = "false")]
    debug: bool,

    /// Config file path
    #[arg(long, env = "CANOPY_CONFIG", default_value = "~/.canopy/config.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 监视连接状态（自动重连）
    Watch,
    /// 发送消息并读取事件流
    Stream {
        /// 消息内容
        message: String,
        #[arg(long)]
        session_id: Option<String>,
    },
    /// 检查网关健康状态
    Health,
    /// 配置管理命令
    Config(ConfigArgs),
}

#[derive(Args, Clone)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// 获取配置值
    Get {
        /// 配置键 (如: server.port, upstream.base_url)
        key: String,
    },
    /// 设置配置值
    Set {
        /// 配置键 (如: server.port, upstream.base_url)
        key: String,
        /// 配置值
        value: String,
    },
    /// 初始化默认配置
    Init {
        /// 强制覆盖已有配置
        #[arg(long, default_value = "false")]
        force: bool,
    },
    /// 显示当前配置
    Show,
}

#[derive(Serialize)]
struct StreamRequest<'a> {
    message: &'a str,
    session_id: &'a str,
}

/// A line typed while watching.
#[derive(Debug, PartialEq)]
enum Input {
    Reset,
    Answer { question: String, value: AnswerValue },
    Submit,
    Quit,
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    match line {
        "r" | "reset" => return Some(Input::Reset),
        "s" | "submit" => return Some(Input::Submit),
        "q" | "quit" | "exit" => return Some(Input::Quit),
        _ => {}
    }
    // `a q=v` picks one option, `m q=v1,v2` picks several.
    let (rest, multiple) = match line.split_once(' ')? {
        ("a" | "answer", rest) => (rest, false),
        ("m" | "multi", rest) => (rest, true),
        _ => return None,
    };
    let (question, value) = rest.split_once('=')?;
    let value = if multiple {
        AnswerValue::Multiple(
            value
                .split(',')
                .map(str::trim)
                .filter(|choice| !choice.is_empty())
                .map(str::to_string)
                .collect(),
        )
    } else {
        AnswerValue::Single(value.trim().to_string())
    };
    Some(Input::Answer {
        question: question.trim().to_string(),
        value,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 展开配置文件路径
    let config_path = canopy_config::expand_tilde(&cli.config)
        .unwrap_or_else(|| PathBuf::from(&cli.config));

    if cli.debug {
        eprintln!("{}", "[DEBUG] Debug mode enabled".dimmed());
        eprintln!("{}", format!("[DEBUG] Config path: {:?}", config_path).dimmed());
    }

    match cli.command {
        Commands::Watch => {
            let mut client = load_client_config(&config_path).await?;
            if let Some(url) = cli.gateway_url {
                client.gateway_url = url;
            }
            watch(&client, cli.debug).await
        }
        Commands::Stream { message, session_id } => {
            let mut client = load_client_config(&config_path).await?;
            if let Some(url) = cli.gateway_url {
                client.gateway_url = url;
            }
            stream_message(&client, session_id, &message, cli.debug).await
        }
        Commands::Health => {
            let mut client = load_client_config(&config_path).await?;
            if let Some(url) = cli.gateway_url {
                client.gateway_url = url;
            }
            check_health(&client, cli.debug).await
        }
        Commands::Config(args) => handle_config(args, &config_path).await,
    }
}

#[derive(serde::Deserialize)]
struct HealthResponse {
    status: String,
    sessions: usize,
}

async fn check_health(client: &canopy_config::ClientConfig, debug: bool) -> anyhow::Result<()> {
    let url = format!("{}/health", client.gateway_url.trim_end_matches('/'));
    if debug {
        eprintln!("{}", format!("[DEBUG] GET {}", url).dimmed());
    }

    let response = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await?;
    if !response.status().is_success() {
        println!("{}", format!("❌ Gateway returned {}", response.status()).red());
        std::process::exit(1);
    }

    let health: HealthResponse = response.json().await?;
    println!(
        "{}",
        format!("✅ {} ({} active sessions)", health.status, health.sessions).green()
    );
    Ok(())
}

async fn load_client_config(path: &PathBuf) -> anyhow::Result<canopy_config::ClientConfig> {
    let manager = canopy_config::ConfigManager::load(path).await?;
    Ok(manager.snapshot().await.client)
}

fn print_connection(snapshot: &ConnectionSnapshot) {
    let line = match snapshot.status {
        ConnectionStatus::Connected => "● connected".green().to_string(),
        ConnectionStatus::Connecting if snapshot.is_reconnecting => format!(
            "◌ reconnecting (attempt {})",
            snapshot.reconnect_counter
        )
        .yellow()
        .to_string(),
        ConnectionStatus::Connecting => "◌ connecting".yellow().to_string(),
        ConnectionStatus::Disconnected => "○ disconnected".red().to_string(),
    };
    println!("{}", line);
}

fn print_modal(event: &ModalEvent) {
    match event {
        ModalEvent::Opened { batch_id, remaining_seconds } => println!(
            "{}",
            format!("❓ Questions {} ({}s to answer)", batch_id, remaining_seconds).cyan()
        ),
        ModalEvent::Tick { remaining_seconds, .. } if *remaining_seconds % 10 == 0 => {
            println!("{}", format!("   {}s left", remaining_seconds).dimmed())
        }
        ModalEvent::Tick { .. } => {}
        ModalEvent::Expired { batch_id } => println!(
            "{}",
            format!("⏰ Time is up for {} (submit or wait for the server)", batch_id).yellow()
        ),
        ModalEvent::AnswerChanged { question, .. } => {
            println!("{}", format!("   answered: {}", question).dimmed())
        }
        ModalEvent::Submitted { batch_id } => {
            println!("{}", format!("✅ Submitted {}", batch_id).green())
        }
        ModalEvent::Closed { batch_id } => println!("{}", format!("Closed {}", batch_id).dimmed()),
        ModalEvent::Reset => println!("{}", "Questions reset".dimmed()),
    }
}

async fn watch(client: &canopy_config::ClientConfig, debug: bool) -> anyhow::Result<()> {
    let url = transport::socket_url(&client.gateway_url, &client.socket_path)?;
    println!("{}", format!("🔌 Watching {}", url).cyan().bold());
    println!(
        "{}",
        "Commands: r reconnect, a <q>=<answer>, m <q>=<a>,<b>, s submit, q quit".dimmed()
    );

    let (runtime, events) = ClientRuntime::new(ClientStore::default());
    let mut notifications = runtime.subscribe();
    let store = runtime.spawn();
    let ticker = spawn_ticker(events.clone(), Duration::from_secs(1));

    let (frames_tx, mut frames) = tokio::sync::mpsc::unbounded_channel();
    let (transport, transport_task) =
        ReconnectingSocket::new(url, BackoffPolicy::from(client), events.clone())
            .with_connect_timeout(Duration::from_millis(client.connect_timeout_ms))
            .with_frames(frames_tx)
            .spawn();

    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Ok(StoreEvent::Connection(snapshot)) => print_connection(&snapshot),
                Ok(StoreEvent::Modal(event)) => print_modal(&event),
                Ok(StoreEvent::Rejected { reason }) => {
                    println!("{}", format!("❌ {}", reason).red())
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    if debug {
                        let skipped = format!("[DEBUG] Skipped {} notifications", skipped);
                        eprintln!("{}", skipped.dimmed());
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                // Modal actions may arrive from the backend; status stays with the transport.
                match serde_json::from_str::<ClientEvent>(&frame) {
                    Ok(ClientEvent::Status { .. }) | Ok(ClientEvent::Tick) => {}
                    Ok(event) => {
                        let _ = events.send(event);
                    }
                    Err(_) => println!("{} {}", "«".dimmed(), frame),
                }
                if debug {
                    eprintln!("{}", format!("[DEBUG] Frame: {}", frame).dimmed());
                }
            },
            line = stdin.next_line() => {
                let Ok(Some(line)) = line else {
                    transport.shutdown()?;
                    break;
                };
                match parse_input(&line) {
                    Some(Input::Reset) => {
                        println!("{}", "↻ Reconnecting".cyan());
                        transport.force_reset()?;
                    }
                    Some(Input::Answer { question, value }) => {
                        events.send(ClientEvent::SetAnswer { question, value })?;
                    }
                    Some(Input::Submit) => events.send(ClientEvent::Submit)?,
                    Some(Input::Quit) => {
                        transport.shutdown()?;
                        break;
                    }
                    None if line.trim().is_empty() => {}
                    None => println!("{}", format!("Unknown command: {}", line.trim()).dimmed()),
                }
            }
        }
    }

    transport_task.await?;
    ticker.abort();
    drop(events);
    let store = store.await?;
    print_connection(&store.connection().snapshot());
    Ok(())
}

async fn stream_message(
    client: &canopy_config::ClientConfig,
    session_id: Option<String>,
    message: &str,
    debug: bool,
) -> anyhow::Result<()> {
    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let url = format!("{}{}", client.gateway_url.trim_end_matches('/'), client.stream_path);
    let body = serde_json::to_string(&StreamRequest {
        message,
        session_id: &session_id,
    })?;

    if debug {
        eprintln!("{}", format!("[DEBUG] POST {}", url).dimmed());
        eprintln!("{}", format!("[DEBUG] Request body: {}", body).dimmed());
    }

    println!("{}", format!("🚀 Starting stream session: {}", session_id).cyan());
    println!("{}", "─".repeat(50).dimmed());

    let sse_client = eventsource_client::ClientBuilder::for_url(&url)?
        .method("POST".to_string())
        .header("content-type", "application/json")?
        .body(body)
        .reconnect(eventsource_client::ReconnectOptions::reconnect(false).build())
        .build();

    let mut stream = sse_client.stream();
    let mut monitor = StreamMonitor::new();
    let start = Instant::now();

    while let Some(event) = stream.next().await {
        match event {
            Ok(eventsource_client::SSE::Event(event)) => {
                if debug {
                    eprintln!("{}", format!("[DEBUG] Raw event: {}", event.data).dimmed());
                }
                match monitor.observe(&event.data) {
                    StreamFrame::Token(content) => {
                        print!("{}", content.green());
                        io::stdout().flush()?;
                    }
                    StreamFrame::Error(message) => {
                        println!();
                        println!("{}", format!("❌ Error: {}", message).red());
                    }
                    StreamFrame::Done => break,
                    StreamFrame::Other(value) => {
                        if debug {
                            eprintln!("{}", format!("[DEBUG] Ignored frame: {}", value).dimmed());
                        }
                    }
                }
            }
            Ok(eventsource_client::SSE::Comment(comment)) => {
                if debug {
                    eprintln!("{}", format!("[DEBUG] SSE Comment: {}", comment).dimmed());
                }
            }
            Ok(_) => {}
            Err(e) => {
                if debug {
                    eprintln!("{}", format!("[DEBUG] SSE Error: {:?}", e).dimmed());
                }
                break;
            }
        }
    }

    println!();
    println!("{}", "─".repeat(50).dimmed());
    match monitor.finish() {
        StreamOutcome::Completed => println!(
            "{}",
            format!(
                "✨ Stream complete ({} events in {:?})",
                monitor.frames(),
                start.elapsed()
            )
            .cyan()
        ),
        StreamOutcome::Failed => println!("{}", "❌ Stream reported an error".red()),
        StreamOutcome::Truncated => println!(
            "{}",
            format!(
                "⚠️  Stream ended without a completion marker after {} events",
                monitor.frames()
            )
            .yellow()
        ),
    }

    Ok(())
}

async fn handle_config(args: ConfigArgs, config_path: &PathBuf) -> anyhow::Result<()> {
    use canopy_config::{Config, ConfigManager};

    match args.command {
        ConfigCommands::Get { key } => {
            let manager = ConfigManager::load(config_path).await?;
            let config = manager.snapshot().await;

            match config.get_value(&key) {
                Some(value) => {
                    println!("{}", format!("{} = {}", key, value).green());
                }
                None => {
                    println!("{}", format!("❌ Key not found: {}", key).red());
                    std::process::exit(1);
                }
            }
        }
        ConfigCommands::Set { key, value } => {
            let manager = ConfigManager::load(config_path).await?;
            manager
                .update(|config| {
                    config.set_value(&key, &value)?;
                    ConfigManager::validate(config)
                })
                .await?;
            println!("{}", format!("✅ Set {} = {}", key, value).green());
        }
        ConfigCommands::Init { force } => {
            if config_path.exists() && !force {
                let exists = format!("⚠️  Config already exists at {:?}", config_path);
                println!("{}", exists.yellow());
                println!("{}", "Use --force to overwrite".dimmed());
                return Ok(());
            }

            let manager = ConfigManager::new(Config::default(), config_path.clone());
            manager.save().await?;

            println!("{}", format!("✅ Config initialized at {:?}", config_path).green());
            println!("{}", "You can edit this file to customize your settings".dimmed());
        }
        ConfigCommands::Show => {
            let manager = ConfigManager::load(config_path).await?;
            let config = manager.snapshot().await;

            println!("{}", "📋 Current Configuration:".cyan().bold());
            println!();
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("r"), Some(Input::Reset));
        assert_eq!(parse_input(" reset \n"), Some(Input::Reset));
        assert_eq!(parse_input("s"), Some(Input::Submit));
        assert_eq!(parse_input("quit"), Some(Input::Quit));
        assert_eq!(
            parse_input("a Which model? = fast"),
            Some(Input::Answer {
                question: "Which model?".to_string(),
                value: AnswerValue::Single("fast".to_string()),
            })
        );
        assert_eq!(
            parse_input("m Tools = search, , code"),
            Some(Input::Answer {
                question: "Tools".to_string(),
                value: AnswerValue::Multiple(vec!["search".to_string(), "code".to_string()]),
            })
        );
        assert_eq!(parse_input("x q=v"), None);
        assert_eq!(parse_input("a no separator"), None);
        assert_eq!(parse_input("hello"), None);
    }

    #[test]
    fn test_stream_request_body() {
        let body = serde_json::to_value(StreamRequest {
            message: "hi",
            session_id: "s-1",
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "message": "hi", "session_id": "s-1" }));
    }
}
