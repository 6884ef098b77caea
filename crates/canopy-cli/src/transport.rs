//! Reconnecting socket transport.
//!
//! Owns the socket to the gateway, retries with exponential backoff and
//! reports every status change into the client event queue. The connection
//! tracker never sees the socket itself, only these status events.

use std::time::Duration;

use canopy_config::ClientConfig;
use canopy_core::{ClientEvent, ConnectionStatus, EventSender};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid gateway URL '{0}': {1}")]
    InvalidUrl(String, String),

    #[error("Transport stopped")]
    Stopped,
}

/// Backoff parameters for reconnect attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl From<&ClientConfig> for BackoffPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter_factor: config.jitter_factor,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(calculate_backoff_delay(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            rand::random::<f64>(),
        ))
    }
}

/// `min(max, base * 2^attempt)` scaled by `1 ± jitter`. `random` is in
/// `[0, 1)` and picks the point inside the jitter band.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn calculate_backoff_delay(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);
    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor.clamp(0.0, 1.0);
    ((capped as f64) * jitter).round().max(0.0) as u64
}

/// Turn the gateway's http(s) base URL into the socket URL.
pub fn socket_url(gateway_url: &str, socket_path: &str) -> Result<String, TransportError> {
    let invalid = |reason: String| TransportError::InvalidUrl(gateway_url.to_string(), reason);
    let mut url = url::Url::parse(gateway_url).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{}'", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch scheme".to_string()))?;
    Ok(format!("{}{}", url.as_str().trim_end_matches('/'), socket_path))
}

#[derive(Debug)]
enum Command {
    ForceReset,
    Shutdown,
}

/// Control handle for a running transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl TransportHandle {
    /// Drop the current connection and reconnect immediately with a fresh
    /// backoff schedule.
    pub fn force_reset(&self) -> Result<(), TransportError> {
        self.commands
            .send(Command::ForceReset)
            .map_err(|_| TransportError::Stopped)
    }

    pub fn shutdown(&self) -> Result<(), TransportError> {
        self.commands
            .send(Command::Shutdown)
            .map_err(|_| TransportError::Stopped)
    }
}

/// Handshake timeout used unless the config sets one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ReconnectingSocket {
    url: String,
    backoff: BackoffPolicy,
    connect_timeout: Duration,
    events: EventSender,
    frames: Option<mpsc::UnboundedSender<String>>,
}

enum Outcome {
    Lost,
    Reset,
    Shutdown,
}

impl From<Option<Command>> for Outcome {
    fn from(command: Option<Command>) -> Self {
        match command {
            Some(Command::ForceReset) => Outcome::Reset,
            Some(Command::Shutdown) | None => Outcome::Shutdown,
        }
    }
}

impl ReconnectingSocket {
    pub fn new(url: String, backoff: BackoffPolicy, events: EventSender) -> Self {
        Self {
            url,
            backoff,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            events,
            frames: None,
        }
    }

    /// A dial that has not finished its handshake within `timeout` counts
    /// as a lost connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Forward inbound text frames to `frames`.
    pub fn with_frames(mut self, frames: mpsc::UnboundedSender<String>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn spawn(self) -> (TransportHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        (TransportHandle { commands: tx }, task)
    }

    fn emit(&self, status: ConnectionStatus) -> bool {
        self.events.send(ClientEvent::status(status)).is_ok()
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut attempt: u32 = 0;

        loop {
            if !self.emit(ConnectionStatus::Connecting) {
                return;
            }

            let dial = tokio::time::timeout(
                self.connect_timeout,
                tokio_tungstenite::connect_async(self.url.as_str()),
            );
            let dialed = tokio::select! {
                dialed = dial => Ok(dialed),
                command = commands.recv() => Err(Outcome::from(command)),
            };

            let outcome = match dialed {
                Ok(Ok(Ok((socket, _)))) => {
                    attempt = 0;
                    if !self.emit(ConnectionStatus::Connected) {
                        return;
                    }
                    self.pump(socket, &mut commands).await
                }
                Ok(Ok(Err(_))) | Ok(Err(_)) => Outcome::Lost,
                Err(outcome) => outcome,
            };

            let delay = match outcome {
                Outcome::Shutdown => break,
                Outcome::Reset => {
                    attempt = 0;
                    Duration::ZERO
                }
                Outcome::Lost => {
                    let delay = self.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                command = commands.recv() => match command {
                    Some(Command::ForceReset) => attempt = 0,
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        self.emit(ConnectionStatus::Disconnected);
    }

    async fn pump<S>(
        &self,
        socket: tokio_tungstenite::WebSocketStream<S>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Outcome
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = socket.split();
        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(frames) = &self.frames {
                            let _ = frames.send(text);
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Outcome::Lost,
                    Some(Ok(_)) => {}
                },
                command = commands.recv() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Outcome::from(command);
                }
            }
        }
    }
}
