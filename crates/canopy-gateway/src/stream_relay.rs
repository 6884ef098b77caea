//! Event-stream relay for streaming POST routes.
//!
//! The upstream byte stream is wrapped in [`RelayBody`] and handed to hyper
//! as the response body. Hyper polls it only when the inbound connection
//! can take more bytes, so a slow reader throttles the upstream read.
//! Dropping the response (client went away) drops the upstream stream in
//! the same poll.

use std::convert::Infallible;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use canopy_config::ProtocolClass;
use canopy_observability::logging::create_session_span;
use canopy_observability::RelayMetrics;
use futures_util::{Stream, StreamExt};
use tracing::Instrument;

use crate::error::{GatewayError, Result};
use crate::route::RouteMatch;
use crate::server::GatewayState;
use crate::session::{SessionGuard, SessionState};

/// Inbound headers carried over to the upstream POST.
const FORWARDED_HEADERS: [header::HeaderName; 4] = [
    header::CONTENT_TYPE,
    header::AUTHORIZATION,
    header::ACCEPT,
    header::COOKIE,
];

/// Longest upstream error body echoed back verbatim.
const MAX_ERROR_MESSAGE: usize = 512;

/// Response body that forwards upstream chunks one at a time.
pub struct RelayBody<S> {
    inner: Pin<Box<S>>,
    session: Option<SessionGuard>,
    chunks: usize,
    finished: bool,
}

impl<S> RelayBody<S> {
    pub fn new(inner: S, session: Option<SessionGuard>) -> Self {
        Self {
            inner: Box::pin(inner),
            session,
            chunks: 0,
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        // Releases the registry slot now rather than when hyper drops us.
        self.session.take();
    }

    fn session_id(&self) -> &str {
        self.session.as_ref().map(SessionGuard::id).unwrap_or("-")
    }
}

impl<S, E> Stream for RelayBody<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Display,
{
    type Item = std::result::Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.chunks += 1;
                RelayMetrics::chunk_relayed(chunk.len());
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Bytes already went out with a 200; end the body early and
                // let the client notice the missing completion marker.
                tracing::warn!(
                    session_id = this.session_id(),
                    chunks = this.chunks,
                    "Upstream stream failed mid-flight: {}",
                    e
                );
                RelayMetrics::stream_truncated();
                this.finish();
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                tracing::debug!(
                    session_id = this.session_id(),
                    chunks = this.chunks,
                    "Upstream stream complete"
                );
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for RelayBody<S> {
    fn drop(&mut self) {
        if !self.finished {
            RelayMetrics::stream_cancelled();
            tracing::info!(
                session_id = self.session_id(),
                chunks = self.chunks,
                "Client disconnected, cancelling upstream stream"
            );
        }
    }
}

/// Set the event-stream response headers.
pub fn event_stream_headers(headers: &mut HeaderMap) {
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
}

/// Message for an upstream failure that happened before any byte streamed.
fn upstream_error_message(status: StatusCode, body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) if !text.trim().is_empty() && text.len() <= MAX_ERROR_MESSAGE => {
            text.trim().to_string()
        }
        _ => status
            .canonical_reason()
            .unwrap_or("Upstream error")
            .to_string(),
    }
}

/// Collect at most `limit` bytes. A failing stream yields what was read so
/// far.
async fn read_prefix<S, E>(stream: S, limit: usize) -> Vec<u8>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
{
    let mut stream = Box::pin(stream);
    let mut prefix = Vec::new();
    while prefix.len() < limit {
        match stream.next().await {
            Some(Ok(chunk)) => prefix.extend_from_slice(&chunk),
            Some(Err(_)) | None => break,
        }
    }
    prefix.truncate(limit);
    prefix
}

/// Relay one streaming POST to the upstream and stream the answer back.
pub async fn relay(
    state: Arc<GatewayState>,
    route: RouteMatch,
    request: Request,
) -> Result<Response> {
    let session = state
        .sessions
        .open(ProtocolClass::StreamingPost, request.uri().path())?;
    let span = create_session_span(session.id(), ProtocolClass::StreamingPost.as_str());
    open_stream(state, route, request, session).instrument(span).await
}

async fn open_stream(
    state: Arc<GatewayState>,
    route: RouteMatch,
    request: Request,
    session: SessionGuard,
) -> Result<Response> {
    let max_body = state.config.relay.max_body_bytes;
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, max_body)
        .await
        .map_err(|e| GatewayError::body_read(e, max_body))?;

    let url = state.upstream.http_url(&route.upstream_path);
    let mut upstream = state.http.post(&url).body(body);
    for name in FORWARDED_HEADERS.iter() {
        if let Some(value) = parts.headers.get(name) {
            upstream = upstream.header(name, value.clone());
        }
    }

    tracing::debug!(url = %url, "Opening upstream stream");
    let response = upstream.send().await.map_err(|e| {
        RelayMetrics::upstream_failure(ProtocolClass::StreamingPost.as_str());
        GatewayError::UpstreamUnavailable(format!("{}: {}", url, e))
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = read_prefix(response.bytes_stream(), MAX_ERROR_MESSAGE + 1).await;
        tracing::warn!(url = %url, status = status.as_u16(), "Upstream refused stream");
        return Err(GatewayError::Upstream {
            status,
            message: upstream_error_message(status, &body),
        });
    }

    session.set_state(SessionState::Open);
    let body = RelayBody::new(response.bytes_stream(), Some(session));
    let mut response = Response::new(Body::from_stream(body));
    event_stream_headers(response.headers_mut());
    Ok(response)
}
