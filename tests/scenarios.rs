//! End-to-end scenario tests for the six literal scenarios named in the
//! design notes: happy path, tunnel offline, alias routing, oversize body,
//! rate limiting, and client reconnection. Each test binds the control
//! channel and ingress listeners on ephemeral loopback ports and drives a
//! hand-rolled "fake client" directly over the frame codec, rather than
//! shelling out to the separate `tunnel-client` binary.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use codec::{decode_body, encode_body, Frame, FrameCodec};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::{net::{TcpListener, TcpStream}, sync::watch};
use tokio_util::codec::Framed;
use tunnel_relay::{config::Config, server::SharedState};

const TOKEN: &str = "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6";

fn base_config() -> Config {
    Config {
        internal_secret: None,
        http_addr: "127.0.0.1:0".parse().unwrap(),
        control_addr: "127.0.0.1:0".parse().unwrap(),
        max_request_size: 10 * 1024 * 1024,
        rate_limit_requests: 1000,
        request_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(15),
        heartbeat_timeout: Duration::from_secs(45),
        alias_cache_ttl: Duration::from_secs(60),
        alias_cache_neg_ttl: Duration::from_secs(10),
        log_level: "info".into(),
        alias_resolver_url: None,
        reserved_aliases: vec!["internal".into(), "www".into(), "api".into(), "admin".into()],
    }
}

/// Binds both listeners on ephemeral ports and spawns the relay's two
/// server tasks. The returned `watch::Sender` must be kept alive for the
/// duration of the test: dropping it makes the receiver's `changed()`
/// resolve immediately, which both server loops read as "shut down now".
async fn start_relay(config: Config) -> (SocketAddr, SocketAddr, Arc<SharedState>, watch::Sender<bool>) {
    let state = Arc::new(SharedState::new(Arc::new(config)));

    let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ingress_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_addr = control_listener.local_addr().unwrap();
    let ingress_addr = ingress_listener.local_addr().unwrap();

    let (tx, rx) = watch::channel(false);

    tokio::spawn(tunnel_relay::server::control::run(control_listener, state.clone(), rx.clone()));
    tokio::spawn(tunnel_relay::server::ingress::run(ingress_listener, state.clone(), rx));

    (control_addr, ingress_addr, state, tx)
}

async fn register(control_addr: SocketAddr, token: &str, target_port: u16) -> Framed<TcpStream, FrameCodec> {
    let stream = TcpStream::connect(control_addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::default());

    framed
        .send(Frame::Register {
            token: token.to_string(),
            target_port,
        })
        .await
        .unwrap();

    match framed.next().await.unwrap().unwrap() {
        Frame::Registered { ok: true, .. } => framed,
        other => panic!("expected registered{{ok:true}}, got {other:?}"),
    }
}

/// Spawns a task that answers every `request` frame with a fixed status and
/// body, incrementing `seen` once per request it observes.
fn serve_fixed_response(
    mut framed: Framed<TcpStream, FrameCodec>,
    status: u16,
    body: &'static str,
    seen: Arc<AtomicUsize>,
) {
    tokio::spawn(async move {
        while let Some(Ok(frame)) = framed.next().await {
            if let Frame::Request { id, .. } = frame {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = framed
                    .send(Frame::Response {
                        id,
                        status,
                        headers: HashMap::new(),
                        body: encode_body(body.as_bytes()),
                    })
                    .await;
            }
        }
    });
}

#[tokio::test]
async fn happy_path() {
    let (control_addr, ingress_addr, state, _tx) = start_relay(base_config()).await;

    let framed = register(control_addr, TOKEN, 3000).await;
    serve_fixed_response(framed, 200, "ok", Arc::new(AtomicUsize::new(0)));

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{ingress_addr}/"))
        .header("host", format!("{TOKEN}.example"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    let snapshot = state
        .counters
        .snapshot_by_token()
        .into_iter()
        .find(|(k, _)| k == TOKEN)
        .unwrap()
        .1;
    assert_eq!(snapshot.requests, 1);
    assert!(snapshot.bytes_out >= 2);
    assert_eq!(snapshot.last_status, 200);
}

#[tokio::test]
async fn tunnel_offline() {
    let (_control_addr, ingress_addr, state, _tx) = start_relay(base_config()).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{ingress_addr}/"))
        .header("host", format!("{TOKEN}.example"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert_eq!(response.text().await.unwrap(), "tunnel offline");

    let snapshot = state
        .counters
        .snapshot_by_token()
        .into_iter()
        .find(|(k, _)| k == TOKEN)
        .unwrap()
        .1;
    assert_eq!(snapshot.requests, 1);
    assert_eq!(snapshot.last_status, 502);
}

async fn start_alias_resolver(expected_token: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));

    async fn resolve_alias(
        Query(params): Query<HashMap<String, String>>,
        State((token, hits)): State<(&'static str, Arc<AtomicUsize>)>,
    ) -> Response {
        hits.fetch_add(1, Ordering::SeqCst);
        match params.get("alias").map(String::as_str) {
            Some("myapp") => Json(json!({ "token": token })).into_response(),
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    let app = Router::new()
        .route("/internal/resolve-alias", get(resolve_alias))
        .with_state((expected_token, hits.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, app).into_future());

    (addr, hits)
}

#[tokio::test]
async fn alias_routing_is_cached() {
    let (resolver_addr, hits) = start_alias_resolver(TOKEN).await;

    let mut config = base_config();
    config.internal_secret = Some("secret".into());
    config.alias_resolver_url = Some(format!("http://{resolver_addr}"));

    let (control_addr, ingress_addr, _state, _tx) = start_relay(config).await;

    let framed = register(control_addr, TOKEN, 3000).await;
    serve_fixed_response(framed, 200, "ok", Arc::new(AtomicUsize::new(0)));

    let client = reqwest::Client::new();

    for _ in 0..2 {
        let response = client
            .get(format!("http://{ingress_addr}/"))
            .header("host", "myapp.example")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    // Second request hits the positive cache instead of the resolver again.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn oversize_body_is_rejected_without_dispatch() {
    let (control_addr, ingress_addr, _state, _tx) = start_relay(base_config()).await;

    let framed = register(control_addr, TOKEN, 3000).await;
    let seen = Arc::new(AtomicUsize::new(0));
    serve_fixed_response(framed, 200, "ok", seen.clone());

    let oversized = vec![0u8; 12 * 1024 * 1024];
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{ingress_addr}/upload"))
        .header("host", format!("{TOKEN}.example"))
        .body(oversized)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 413);
    assert_eq!(seen.load(Ordering::SeqCst), 0, "no request frame should reach the client");
}

#[tokio::test]
async fn rate_limit_trips_after_burst() {
    let mut config = base_config();
    config.rate_limit_requests = 5;
    let (control_addr, ingress_addr, state, _tx) = start_relay(config).await;

    let framed = register(control_addr, TOKEN, 3000).await;
    serve_fixed_response(framed, 200, "ok", Arc::new(AtomicUsize::new(0)));

    let client = reqwest::Client::new();
    let mut statuses = Vec::new();
    let mut retry_after = None;

    for _ in 0..6 {
        let response = client
            .get(format!("http://{ingress_addr}/"))
            .header("host", format!("{TOKEN}.example"))
            .send()
            .await
            .unwrap();
        if response.status() == 429 {
            retry_after = response
                .headers()
                .get("retry-after")
                .map(|v| v.to_str().unwrap().to_string());
        }
        statuses.push(response.status().as_u16());
    }

    assert_eq!(statuses, vec![200, 200, 200, 200, 200, 429]);
    assert!(retry_after.is_some(), "429 response must carry Retry-After");

    let snapshot = state
        .counters
        .snapshot_by_token()
        .into_iter()
        .find(|(k, _)| k == TOKEN)
        .unwrap()
        .1;
    assert_eq!(snapshot.requests, 6, "the rate-limited request is still counted");
}

#[tokio::test]
async fn client_reconnection_recovers_after_disconnect() {
    let (control_addr, ingress_addr, _state, _tx) = start_relay(base_config()).await;

    // First registration never answers and is dropped mid-flight: the caller
    // must see a 502 rather than hang.
    let framed = register(control_addr, TOKEN, 3000).await;
    drop(framed);

    // Give the control server's reader loop a moment to observe the close
    // and unregister the token before the next request is dispatched.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{ingress_addr}/"))
        .header("host", format!("{TOKEN}.example"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    // Reconnect: the same token can register again and serve normally.
    let framed = register(control_addr, TOKEN, 3000).await;
    serve_fixed_response(framed, 200, "ok", Arc::new(AtomicUsize::new(0)));

    let response = client
        .get(format!("http://{ingress_addr}/"))
        .header("host", format!("{TOKEN}.example"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn frame_roundtrip_encode_decode() {
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    let frames = vec![
        Frame::Register { token: TOKEN.to_string(), target_port: 3000 },
        Frame::Registered { ok: true, code: None, message: None },
        Frame::Ping { ts: 42 },
        Frame::Pong { ts: 42 },
        Frame::Error { id: Some(7), code: "X".into(), message: "y".into() },
    ];

    for frame in frames {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    // decode_body(encode_body(x)) round-trips too.
    let body = b"some request body bytes";
    assert_eq!(decode_body(&encode_body(body)).unwrap(), body);
}
