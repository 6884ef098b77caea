//! End-to-end relay tests against an in-process mock backend.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{CloseFrame as ServerCloseFrame, Message as ServerMessage, WebSocketUpgrade};
use axum::extract::{Multipart, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use canopy_config::{AuthSettings, Config};
use canopy_gateway::{Gateway, SessionRegistry};
use futures_util::{stream, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);
const SLOW_CHUNKS: usize = 50;

/// Observes the slow upstream stream.
#[derive(Clone, Default)]
struct SlowStream {
    produced: Arc<AtomicUsize>,
    dropped: Arc<AtomicBool>,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Echoes frames. `/bye` closes with 4000 after one frame and `/drop`
/// vanishes without a close frame.
async fn ws_echo(uri: Uri, ws: WebSocketUpgrade) -> Response {
    let path = uri.path().to_string();
    ws.on_upgrade(|mut socket| async move {
        if path.ends_with("/bye") || path.ends_with("/drop") {
            let _ = socket.send(ServerMessage::Text("hi".to_string())).await;
            if path.ends_with("/bye") {
                let _ = socket
                    .send(ServerMessage::Close(Some(ServerCloseFrame {
                        code: 4000,
                        reason: "bye".into(),
                    })))
                    .await;
                while let Some(Ok(_)) = socket.recv().await {}
            }
            return;
        }
        while let Some(Ok(message)) = socket.recv().await {
            match message {
                ServerMessage::Text(_) | ServerMessage::Binary(_) => {
                    if socket.send(message).await.is_err() {
                        break;
                    }
                }
                ServerMessage::Close(_) => break,
                _ => {}
            }
        }
    })
}

async fn sse_ok(headers: HeaderMap, body: String) -> Response {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none")
        .to_string();
    let chunks = vec![
        format!("data: {}\n\n", body),
        format!("data: auth={}\n\n", auth),
        "data: [DONE]\n\n".to_string(),
    ];
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(stream::iter(chunks.into_iter().map(Ok::<_, Infallible>))))
        .unwrap()
}

async fn sse_slow(State(slow): State<SlowStream>) -> Response {
    let flag = DropFlag(slow.dropped.clone());
    let chunks = stream::unfold((0usize, flag, slow.produced), |(n, flag, produced)| async move {
        if n == SLOW_CHUNKS {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        produced.fetch_add(1, Ordering::SeqCst);
        Some((Ok::<_, Infallible>(format!("data: {}\n\n", n)), (n + 1, flag, produced)))
    });
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(chunks))
        .unwrap()
}

async fn files(headers: HeaderMap, mut multipart: Multipart) -> impl IntoResponse {
    let mut fields = Vec::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let size = field.bytes().await.map(|b| b.len()).unwrap_or(0);
        fields.push(json!({ "name": name, "size": size }));
    }
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (StatusCode::CREATED, Json(json!({ "fields": fields, "auth": auth })))
}

fn upstream_router(slow: SlowStream) -> Router {
    Router::new()
        .route("/api/v1/ws/*rest", get(ws_echo))
        .route("/api/v1/chat/stream", post(sse_ok))
        .route(
            "/api/v1/chat/stream/limited",
            post(|| async { StatusCode::TOO_MANY_REQUESTS }),
        )
        .route("/api/v1/chat/stream/slow", post(sse_slow))
        .route("/api/v1/echo", get(|uri: Uri| async move { uri.to_string() }))
        .route("/api/v1/files", post(files))
        .with_state(slow)
}

async fn spawn(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// An address nothing is listening on.
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn boot_gateway(
    upstream: SocketAddr,
    configure: impl FnOnce(&mut Config),
) -> (SocketAddr, SessionRegistry) {
    let mut config = Config::default();
    config.upstream.base_url = format!("http://{}", upstream);
    config.relay.close_grace_ms = 500;
    config.upload.auth = AuthSettings::None;
    configure(&mut config);

    let gateway = Gateway::new(config).unwrap();
    let sessions = gateway.sessions().clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(gateway.serve(listener, std::future::pending()));
    (addr, sessions)
}

async fn boot() -> (SocketAddr, SessionRegistry, SlowStream) {
    let slow = SlowStream::default();
    let upstream = spawn(upstream_router(slow.clone())).await;
    let (addr, sessions) = boot_gateway(upstream, |_| {}).await;
    (addr, sessions, slow)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_concurrent_sockets_are_isolated() {
    let (addr, sessions, _) = boot().await;

    let mut sockets = Vec::new();
    for i in 0..10 {
        let (mut socket, _) = timeout(TIMEOUT, connect_async(format!("ws://{}/ws/chat", addr)))
            .await
            .unwrap()
            .unwrap();
        socket.send(Message::Text(format!("hello-{}", i))).await.unwrap();
        sockets.push(socket);
    }
    for (i, socket) in sockets.iter_mut().enumerate() {
        let reply = timeout(TIMEOUT, socket.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(reply, Message::Text(format!("hello-{}", i)));
    }
    assert_eq!(sessions.len(), 10);

    let mut closed = sockets.remove(0);
    closed.close(None).await.unwrap();
    drop(closed);
    assert!(wait_until(|| sessions.len() == 9).await);

    for (i, socket) in sockets.iter_mut().enumerate() {
        socket.send(Message::Binary(vec![i as u8; 4])).await.unwrap();
        let reply = timeout(TIMEOUT, socket.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(reply, Message::Binary(vec![i as u8; 4]));
    }
}

async fn open_socket(
    addr: SocketAddr,
    path: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (mut socket, _) = timeout(TIMEOUT, connect_async(format!("ws://{}{}", addr, path)))
        .await
        .unwrap()
        .unwrap();
    let first = timeout(TIMEOUT, socket.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(first, Message::Text("hi".to_string()));
    socket
}

#[tokio::test]
async fn test_upstream_close_reaches_client() {
    let (addr, sessions, _) = boot().await;
    let mut socket = open_socket(addr, "/ws/bye").await;

    match timeout(TIMEOUT, socket.next()).await.unwrap().unwrap().unwrap() {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4000);
            assert_eq!(frame.reason, "bye");
        }
        other => panic!("expected close frame, got {:?}", other),
    }
    assert!(wait_until(|| sessions.is_empty()).await);
}

#[tokio::test]
async fn test_upstream_loss_closes_client_with_1011() {
    let (addr, sessions, _) = boot().await;
    let mut socket = open_socket(addr, "/ws/drop").await;

    match timeout(TIMEOUT, socket.next()).await.unwrap().unwrap().unwrap() {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1011);
            assert_eq!(frame.reason, "upstream connection lost");
        }
        other => panic!("expected close frame, got {:?}", other),
    }
    assert!(wait_until(|| sessions.is_empty()).await);
}

#[tokio::test]
async fn test_socket_dial_failure_is_502() {
    let (addr, sessions) = boot_gateway(dead_addr().await, |_| {}).await;

    let err = timeout(TIMEOUT, connect_async(format!("ws://{}/ws/chat", addr)))
        .await
        .unwrap()
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
        other => panic!("expected HTTP rejection, got {:?}", other),
    }
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn test_socket_capacity_is_503() {
    let slow = SlowStream::default();
    let upstream = spawn(upstream_router(slow)).await;
    let (addr, _) = boot_gateway(upstream, |c| c.relay.max_sessions = 1).await;

    let (_first, _) = connect_async(format!("ws://{}/ws/chat", addr)).await.unwrap();
    let err = connect_async(format!("ws://{}/ws/chat", addr)).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
        other => panic!("expected HTTP rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_chunks_relayed_with_headers() {
    let (addr, sessions, _) = boot().await;

    let response = client()
        .post(format!("http://{}/stream", addr))
        .header(header::AUTHORIZATION, "Bearer user-token")
        .header(header::CONTENT_TYPE, "application/json")
        .body(r#"{"message":"hi"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache, no-transform");
    assert_eq!(headers["x-accel-buffering"], "no");

    let body = response.text().await.unwrap();
    assert_eq!(
        body,
        "data: {\"message\":\"hi\"}\n\ndata: auth=Bearer user-token\n\ndata: [DONE]\n\n"
    );
    assert!(wait_until(|| sessions.is_empty()).await);
}

#[tokio::test]
async fn test_stream_upstream_refusal_is_json() {
    let (addr, _, _) = boot().await;

    let response = client()
        .post(format!("http://{}/stream/limited", addr))
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "UPSTREAM_ERROR");
    assert_eq!(body["status"], 429);
    assert_eq!(body["error"], "Too Many Requests");
}

#[tokio::test]
async fn test_stream_upstream_unreachable_is_502() {
    let (addr, _) = boot_gateway(dead_addr().await, |_| {}).await;

    let response = client()
        .post(format!("http://{}/stream", addr))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "UPSTREAM_UNAVAILABLE");
    assert_eq!(body["error"], "Upstream service unavailable");
}

#[tokio::test]
async fn test_client_disconnect_cancels_upstream() {
    let (addr, sessions, slow) = boot().await;

    let mut response = client()
        .post(format!("http://{}/stream/slow", addr))
        .body("{}")
        .send()
        .await
        .unwrap();
    let mut received = 0;
    while received < 2 {
        let chunk = timeout(TIMEOUT, response.chunk()).await.unwrap().unwrap().unwrap();
        received += chunk.windows(2).filter(|w| *w == b"\n\n").count();
    }
    drop(response);

    assert!(wait_until(|| slow.dropped.load(Ordering::SeqCst)).await);
    assert!(slow.produced.load(Ordering::SeqCst) < SLOW_CHUNKS);
    assert!(wait_until(|| sessions.is_empty()).await);
}

#[tokio::test]
async fn test_stream_body_limit() {
    let slow = SlowStream::default();
    let upstream = spawn(upstream_router(slow)).await;
    let (addr, _) = boot_gateway(upstream, |c| c.relay.max_body_bytes = 16).await;

    let response = client()
        .post(format!("http://{}/stream", addr))
        .body(vec![b'x'; 64])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_passthrough_rewrites_path_and_keeps_query() {
    let (addr, _, _) = boot().await;

    let response = client()
        .get(format!("http://{}/api/echo?x=1&y=two", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "/api/v1/echo?x=1&y=two");
}

#[tokio::test]
async fn test_upload_forwarded_with_credentials() {
    std::env::set_var("CANOPY_TEST_UPLOAD_TOKEN", "service-secret");
    let slow = SlowStream::default();
    let upstream = spawn(upstream_router(slow)).await;
    let (addr, _) = boot_gateway(upstream, |c| {
        c.upload.auth = AuthSettings::Bearer {
            env: "CANOPY_TEST_UPLOAD_TOKEN".to_string(),
        };
    })
    .await;

    let form = reqwest::multipart::Form::new()
        .text("session_id", "s-1")
        .part(
            "file",
            reqwest::multipart::Part::bytes(b"hello file".to_vec()).file_name("notes.txt"),
        );
    let response = client()
        .post(format!("http://{}/api/upload", addr))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["auth"], "Bearer service-secret");
    let names: Vec<_> = body["fields"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["session_id", "file"]);
}

#[tokio::test]
async fn test_upload_missing_field_rejected() {
    let (addr, _, _) = boot().await;

    let form = reqwest::multipart::Form::new().text("session_id", "s-1");
    let response = client()
        .post(format!("http://{}/api/upload", addr))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_UPLOAD");
}

#[tokio::test]
async fn test_upload_without_token_is_configuration_error() {
    let slow = SlowStream::default();
    let upstream = spawn(upstream_router(slow)).await;
    let (addr, _) = boot_gateway(upstream, |c| {
        c.upload.auth = AuthSettings::Bearer {
            env: "CANOPY_TEST_UNSET_UPLOAD_TOKEN".to_string(),
        };
    })
    .await;

    let form = reqwest::multipart::Form::new()
        .text("session_id", "s-1")
        .part("file", reqwest::multipart::Part::bytes(b"x".to_vec()).file_name("x.txt"));
    let response = client()
        .post(format!("http://{}/api/upload", addr))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "CONFIGURATION_ERROR");
}
