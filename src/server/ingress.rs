//! HTTP ingress dispatcher: accepts plaintext HTTP from the fronting proxy,
//! resolves the caller's identity from `Host`, pairs the request with its
//! client's control channel, and streams the response back. Built on
//! `axum`, consistent with the teacher's own HTTP-API era (`src/api.rs`).

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::SystemTime};

use axum::{
    body::{Body, Bytes, to_bytes},
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use codec::{encode_body, Frame};
use serde_json::json;
use service::{pending::PendingOutcome, Identity};
use tokio::{net::TcpListener, sync::oneshot, time::timeout};

use crate::{error::IngressError, identity};

use super::SharedState;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub async fn run(
    listener: TcpListener,
    state: Arc<SharedState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    log::info!("ingress listening: {}", state.config.http_addr);

    let app = Router::new()
        .route("/internal/connected-tokens", get(connected_tokens))
        .route("/internal/traffic-stats", get(traffic_stats))
        .route("/internal/metrics", get(metrics_endpoint))
        .fallback(dispatch)
        .with_state(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await?;

    Ok(())
}

fn authorized(state: &SharedState, headers: &HeaderMap) -> bool {
    match &state.config.internal_secret {
        Some(secret) => headers
            .get("x-relay-internal-secret")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == secret),
        None => false,
    }
}

async fn connected_tokens(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let connected = state.registry.connected();

    let tokens: Vec<_> = connected.iter().map(|handle| handle.token.clone()).collect();
    let tunnels: Vec<_> = connected
        .iter()
        .map(|handle| {
            json!({
                "token": handle.token,
                "clientIp": handle.remote_addr.to_string(),
                "targetPort": handle.target_port,
                "connectedAt": handle.connected_at,
            })
        })
        .collect();

    Json(json!({ "tokens": tokens, "tunnels": tunnels })).into_response()
}

async fn traffic_stats(State(state): State<Arc<SharedState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let by_token = state.counters.snapshot_by_token();
    let by_alias = state.counters.snapshot_by_alias();

    let (mut requests, mut bytes_in, mut bytes_out) = (0u64, 0u64, 0u64);
    for (_, snapshot) in by_token.iter().chain(by_alias.iter()) {
        requests += snapshot.requests;
        bytes_in += snapshot.bytes_in;
        bytes_out += snapshot.bytes_out;
    }

    let entry_json = |snapshot: &service::counters::CounterSnapshot| {
        json!({
            "requests": snapshot.requests,
            "bytesIn": snapshot.bytes_in,
            "bytesOut": snapshot.bytes_out,
            "lastSeenAt": snapshot.last_seen_at,
            "lastStatus": snapshot.last_status,
        })
    };

    Json(json!({
        "relayRunId": state.run_id,
        "since": state.started_at.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs(),
        "timestamp": SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs(),
        "totals": { "requests": requests, "bytesIn": bytes_in, "bytesOut": bytes_out },
        "byToken": by_token.iter().map(|(k, v)| json!({ "token": k, "stats": entry_json(v) })).collect::<Vec<_>>(),
        "byAlias": by_alias.iter().map(|(k, v)| json!({ "alias": k, "stats": entry_json(v) })).collect::<Vec<_>>(),
    }))
    .into_response()
}

#[cfg(feature = "prometheus")]
async fn metrics_endpoint() -> Response {
    let mut buf = Vec::new();
    match crate::metrics::generate_metrics(&mut buf) {
        Ok(()) => (StatusCode::OK, buf).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(not(feature = "prometheus"))]
async fn metrics_endpoint() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

async fn dispatch(
    State(state): State<Arc<SharedState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    match handle(state, remote_addr, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle(
    state: Arc<SharedState>,
    remote_addr: SocketAddr,
    request: Request<Body>,
) -> Result<Response, IngressError> {
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or(IngressError::BadRequest("missing host header"))?
        .to_string();

    let identity = identity::classify(&host, &state.config.reserved_aliases)
        .map_err(|_| IngressError::BadRequest("invalid host header"))?;

    let token = resolve_token(&state, &identity).await?;

    let (parts, body) = request.into_parts();
    let body = to_bytes(body, state.config.max_request_size)
        .await
        .map_err(|_| IngressError::TooLarge)?;

    if body.len() > state.config.max_request_size {
        return Err(IngressError::TooLarge);
    }

    // Every request that makes it past identity resolution and the size
    // check is counted on receipt, even if it is about to be rejected for
    // being offline or rate-limited: the counters track what the caller
    // experienced, not just what reached a client.
    state.counters.record_received(&identity, body.len() as u64);
    #[cfg(feature = "prometheus")]
    {
        crate::metrics::METRICS.requests_total.inc();
        crate::metrics::METRICS.bytes_in_total.inc_by(body.len() as u64);
    }

    let handle = match state.registry.lookup(&token) {
        Some(handle) => handle,
        None => {
            state.counters.record_completed(&identity, 0, 502);
            return Err(IngressError::TunnelOffline);
        }
    };

    if !state.rate_limiter.check(identity.as_str()) {
        state.counters.record_completed(&identity, 0, 429);
        return Err(IngressError::RateLimited(state.rate_limiter.retry_after_secs()));
    }

    let mut headers = HashMap::new();
    for (name, value) in parts.headers.iter() {
        let name = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            headers.insert(name, v.to_string());
        }
    }
    headers.insert("x-forwarded-for".to_string(), remote_addr.ip().to_string());

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let id = handle.next_request_id();
    let (tx, rx) = oneshot::channel();
    handle.pending().insert(id, tx);

    let frame = Frame::Request {
        id,
        method: parts.method.as_str().to_string(),
        path,
        headers,
        body: encode_body(&body),
        remote_addr: remote_addr.to_string(),
    };

    if !handle.try_send(frame) {
        handle.pending().remove(id);
        state.registry.unregister(&token, &handle);
        state.counters.record_completed(&identity, 0, 502);
        return Err(IngressError::TunnelOffline);
    }

    let outcome = timeout(state.config.request_timeout, rx).await;

    let response = match outcome {
        Ok(Ok(PendingOutcome::Response { status, headers: resp_headers, body })) => {
            state.counters.record_completed(&identity, body.len() as u64, status);
            #[cfg(feature = "prometheus")]
            crate::metrics::METRICS.bytes_out_total.inc_by(body.len() as u64);
            build_response(status, &resp_headers, body)
        }
        Ok(Ok(PendingOutcome::Error { code, message })) => {
            log::debug!("client reported error for request {id}: {code} {message}");
            state.counters.record_completed(&identity, 0, 502);
            return Err(IngressError::Upstream(format!("{code}: {message}")));
        }
        Ok(Ok(PendingOutcome::Disconnected)) => {
            state.counters.record_completed(&identity, 0, 502);
            return Err(IngressError::TunnelOffline);
        }
        Ok(Ok(PendingOutcome::Timeout)) | Ok(Err(_)) => {
            state.counters.record_completed(&identity, 0, 504);
            return Err(IngressError::Timeout);
        }
        Err(_) => {
            handle.pending().remove(id);
            state.counters.record_completed(&identity, 0, 504);
            return Err(IngressError::Timeout);
        }
    };

    Ok(response)
}

async fn resolve_token(state: &SharedState, identity: &Identity) -> Result<String, IngressError> {
    match identity {
        Identity::Token(token) => Ok(token.clone()),
        Identity::Alias(alias) => state
            .alias
            .resolve(alias)
            .await
            .map_err(|e| match e {
                crate::alias::ResolveError::NotFound | crate::alias::ResolveError::Disabled => {
                    IngressError::TunnelOffline
                }
                crate::alias::ResolveError::Upstream(detail) => IngressError::Upstream(detail),
            }),
    }
}

fn build_response(status: u16, headers: &HashMap<String, String>, body: Vec<u8>) -> Response {
    let mut builder = Response::builder().status(
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
    );

    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from(Bytes::from(body)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
