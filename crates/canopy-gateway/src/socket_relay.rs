//! Bidirectional socket relay for upgrade routes.
//!
//! The upstream socket is dialed before the inbound upgrade is accepted, so
//! a dead upstream yields a 502 instead of an upgraded socket that closes
//! immediately. After that, frames are spliced in both directions without
//! being inspected.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{
    CloseFrame as InboundCloseFrame, Message as InboundMessage, WebSocket, WebSocketUpgrade,
};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use canopy_config::ProtocolClass;
use canopy_observability::logging::create_session_span;
use canopy_observability::RelayMetrics;
use futures_util::future::{self, BoxFuture, Either};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::Instrument;

use crate::error::{GatewayError, Result};
use crate::route::RouteMatch;
use crate::server::GatewayState;
use crate::session::{SessionGuard, SessionState};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound headers carried over to the upstream dial.
const FORWARDED_HEADERS: [header::HeaderName; 3] = [
    header::AUTHORIZATION,
    header::COOKIE,
    header::SEC_WEBSOCKET_PROTOCOL,
];

/// Close code sent to the client when the upstream drops without a close
/// frame.
const UPSTREAM_LOST: u16 = 1011;

/// Dial the upstream, then accept the inbound upgrade and splice the two.
pub async fn relay(
    state: Arc<GatewayState>,
    route: RouteMatch,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    inbound_path: &str,
) -> Result<Response> {
    let session = state.sessions.open(ProtocolClass::Upgrade, inbound_path)?;
    let span = create_session_span(session.id(), ProtocolClass::Upgrade.as_str());

    let url = state.upstream.ws_url(&route.upstream_path);
    let timeout = Duration::from_secs(state.config.upstream.connect_timeout_secs);
    let (upstream, protocol) = dial(&url, &headers, timeout).instrument(span.clone()).await?;

    let grace = Duration::from_millis(state.config.relay.close_grace_ms);
    let ws = match protocol {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };

    Ok(ws.on_upgrade(move |socket| splice(socket, upstream, session, grace).instrument(span)))
}

async fn dial(
    url: &str,
    headers: &HeaderMap,
    timeout: Duration,
) -> Result<(UpstreamSocket, Option<String>)> {
    let mut request = url
        .into_client_request()
        .map_err(|e| {
            GatewayError::Config(format!("Invalid upstream socket URL '{}': {}", url, e))
        })?;
    for name in FORWARDED_HEADERS.iter() {
        if let Some(value) = headers.get(name) {
            request.headers_mut().insert(name.clone(), value.clone());
        }
    }

    tracing::debug!(url, "Dialing upstream socket");
    let failure = |reason: String| {
        RelayMetrics::upstream_failure(ProtocolClass::Upgrade.as_str());
        GatewayError::UpstreamUnavailable(format!("{}: {}", url, reason))
    };

    let dial = tokio_tungstenite::connect_async(request);
    let (socket, response) = tokio::time::timeout(timeout, dial)
        .await
        .map_err(|_| failure(format!("timed out after {:?}", timeout)))?
        .map_err(|e| failure(e.to_string()))?;

    let protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Ok((socket, protocol))
}

/// Run both directions until one ends, then give the other `grace` to
/// finish its close handshake.
async fn splice(
    inbound: WebSocket,
    upstream: UpstreamSocket,
    session: SessionGuard,
    grace: Duration,
) {
    session.set_state(SessionState::Open);
    tracing::info!("Socket relay established");

    let (mut client_tx, mut client_rx) = inbound.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream: BoxFuture<'static, ()> = Box::pin(async move {
        while let Some(message) = client_rx.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!("Inbound socket error: {}", e);
                    break;
                }
            };
            let closing = matches!(message, InboundMessage::Close(_));
            if upstream_tx.send(into_upstream(message)).await.is_err() {
                return;
            }
            RelayMetrics::frame_relayed("upstream");
            if closing {
                return;
            }
        }
        let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
    });

    let upstream_to_client: BoxFuture<'static, ()> = Box::pin(async move {
        while let Some(message) = upstream_rx.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("Upstream socket error: {}", e);
                    break;
                }
            };
            let closing = matches!(message, UpstreamMessage::Close(_));
            let Some(message) = into_inbound(message) else {
                continue;
            };
            if client_tx.send(message).await.is_err() {
                return;
            }
            RelayMetrics::frame_relayed("inbound");
            if closing {
                return;
            }
        }
        let _ = client_tx
            .send(InboundMessage::Close(Some(InboundCloseFrame {
                code: UPSTREAM_LOST,
                reason: "upstream connection lost".into(),
            })))
            .await;
    });

    let first = future::select(client_to_upstream, upstream_to_client).await;
    let (closed_first, remaining) = match first {
        Either::Left(((), rest)) => ("inbound", rest),
        Either::Right(((), rest)) => ("upstream", rest),
    };

    session.set_state(SessionState::Draining);
    tracing::debug!(closed_first, "Socket relay draining");
    if tokio::time::timeout(grace, remaining).await.is_err() {
        tracing::debug!(?grace, "Close grace period elapsed, dropping peer");
    }
    tracing::info!(closed_first, "Socket relay closed");
}

fn into_upstream(message: InboundMessage) -> UpstreamMessage {
    match message {
        InboundMessage::Text(text) => UpstreamMessage::Text(text),
        InboundMessage::Binary(data) => UpstreamMessage::Binary(data),
        InboundMessage::Ping(data) => UpstreamMessage::Ping(data),
        InboundMessage::Pong(data) => UpstreamMessage::Pong(data),
        InboundMessage::Close(frame) => UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        })),
    }
}

/// Raw frames never surface from a reading socket, so they map to nothing.
fn into_inbound(message: UpstreamMessage) -> Option<InboundMessage> {
    Some(match message {
        UpstreamMessage::Text(text) => InboundMessage::Text(text),
        UpstreamMessage::Binary(data) => InboundMessage::Binary(data),
        UpstreamMessage::Ping(data) => InboundMessage::Ping(data),
        UpstreamMessage::Pong(data) => InboundMessage::Pong(data),
        UpstreamMessage::Close(frame) => InboundMessage::Close(frame.map(|f| InboundCloseFrame {
            code: f.code.into(),
            reason: f.reason,
        })),
        UpstreamMessage::Frame(_) => return None,
    })
}
