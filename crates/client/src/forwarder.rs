//! The client forwarder: one outer reconnect loop wrapping one live control
//! connection. While connected it concurrently reads frames (dispatching
//! `request`s to per-request workers and `ping`s into `pong` replies),
//! emits its own heartbeat, and owns a dedicated writer task that
//! serializes everything going back to the relay — the same "single writer
//! per connection" discipline the relay itself uses.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, anyhow, bail};
use codec::{Frame, FrameCodec, decode_body, encode_body};
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use reqwest::Client;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    time::timeout,
};
use tokio_util::codec::Framed;

use crate::{backoff::Backoff, config::Config, stats::Stats};

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Run forever, reconnecting with backoff, until `shutdown` is signalled.
pub async fn run(config: Config, stats: Arc<Stats>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = Backoff::default();

    loop {
        if *shutdown.borrow() {
            return;
        }

        let started = Instant::now();
        match connect_and_run(&config, &stats, &mut shutdown).await {
            Ok(()) => {
                info!("tunnel client shutting down");
                return;
            }
            Err(e) => {
                stats.record_error();
                stats.mark_disconnected();
                backoff.note_uptime(started.elapsed());

                let delay = backoff.delay();
                warn!(
                    "control connection failed (attempt {}): {e:#}; retrying in {:?}",
                    backoff.attempt(),
                    delay
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }

                stats.record_reconnect();
            }
        }
    }
}

async fn connect_and_run(
    config: &Config,
    stats: &Arc<Stats>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let stream = TcpStream::connect((config.relay_host.as_str(), config.relay_port))
        .await
        .context("connecting to relay control port")?;
    stream.set_nodelay(true).ok();

    let mut framed = Framed::new(stream, FrameCodec::new(config.max_frame_bytes));

    framed
        .send(Frame::Register {
            token: config.token.clone(),
            target_port: config.local_port,
        })
        .await
        .context("writing register frame")?;

    let registered = timeout(Duration::from_secs(10), framed.next())
        .await
        .map_err(|_| anyhow!("timed out waiting for registered"))?
        .ok_or_else(|| anyhow!("relay closed the connection before registering"))?
        .context("reading registered frame")?;

    match registered {
        Frame::Registered { ok: true, .. } => {}
        Frame::Registered {
            ok: false,
            code,
            message,
        } => bail!("registration rejected: {code:?} {message:?}"),
        other => bail!("expected registered frame, got {other:?}"),
    }

    info!("registered with relay as {}", config.token);
    stats.mark_connected();

    let (sink, mut read_half) = framed.split();
    let (tx, rx) = mpsc::channel::<Frame>(64);

    let mut writer_sink = sink;
    let writer = tokio::spawn(async move {
        let mut rx = rx;
        while let Some(frame) = rx.recv().await {
            if writer_sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let client = Client::builder()
        .build()
        .context("building local HTTP client")?;

    let last_pong_ms = Arc::new(AtomicU64::new(now_ms()));
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await; // first tick fires immediately; skip it

    let outcome: anyhow::Result<()> = loop {
        tokio::select! {
            frame = read_half.next() => {
                match frame {
                    Some(Ok(Frame::Request { id, method, path, headers, body, remote_addr })) => {
                        stats.record_request();
                        let tx = tx.clone();
                        let client = client.clone();
                        let local_port = config.local_port;
                        let max_frame_bytes = config.max_frame_bytes;
                        let request_timeout = config.request_timeout;
                        let stats = stats.clone();

                        tokio::spawn(async move {
                            let response = handle_request(
                                &client, local_port, max_frame_bytes, request_timeout,
                                id, method, path, headers, body, remote_addr,
                            ).await;

                            if matches!(&response, Frame::Error { .. }) {
                                stats.record_error();
                            }

                            let _ = tx.send(response).await;
                        });
                    }
                    Some(Ok(Frame::Ping { ts })) => {
                        let _ = tx.send(Frame::Pong { ts }).await;
                    }
                    Some(Ok(Frame::Pong { .. })) => {
                        last_pong_ms.store(now_ms(), Ordering::Relaxed);
                    }
                    Some(Ok(other)) => {
                        warn!("ignoring unexpected frame from relay: {other:?}");
                    }
                    Some(Err(e)) => break Err(anyhow!("control channel read error: {e}")),
                    None => break Err(anyhow!("relay closed the control connection")),
                }
            }
            _ = heartbeat.tick() => {
                if tx.send(Frame::Ping { ts: now_ms() }).await.is_err() {
                    break Err(anyhow!("writer task gone"));
                }

                let idle = now_ms().saturating_sub(last_pong_ms.load(Ordering::Relaxed));
                if idle > config.heartbeat_timeout.as_millis() as u64 {
                    break Err(anyhow!("no pong within heartbeat timeout"));
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break Ok(());
                }
            }
        }
    };

    drop(tx);
    let _ = writer.await;
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn handle_request(
    client: &Client,
    local_port: u16,
    max_frame_bytes: usize,
    request_timeout: Duration,
    id: u64,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: String,
    _remote_addr: String,
) -> Frame {
    let body = match decode_body(&body) {
        Ok(b) => b,
        Err(_) => return text_response(id, 400, "invalid request encoding"),
    };

    if body.len() > max_frame_bytes {
        return text_response(id, 413, "request entity too large");
    }

    let method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(_) => return text_response(id, 400, "invalid method"),
    };

    let url = format!("http://127.0.0.1:{local_port}{path}");
    let mut builder = client.request(method, &url).timeout(request_timeout);

    for (name, value) in &headers {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header("host", format!("127.0.0.1:{local_port}"));
    builder = builder.body(body);

    let response = match builder.send().await {
        Ok(r) => r,
        Err(e) if e.is_timeout() => return text_response(id, 504, "local backend timed out"),
        Err(_) => return text_response(id, 502, "local backend connection refused"),
    };

    let status = response.status().as_u16();
    let mut resp_headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            resp_headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
        }
    }

    let body = match response.bytes().await {
        Ok(b) if b.len() > max_frame_bytes => {
            return Frame::error(Some(id), "PAYLOAD_TOO_LARGE", "response body too large");
        }
        Ok(b) => b,
        Err(_) => return text_response(id, 502, "local backend closed before sending a body"),
    };

    Frame::Response {
        id,
        status,
        headers: resp_headers,
        body: encode_body(&body),
    }
}

fn text_response(id: u64, status: u16, text: &str) -> Frame {
    Frame::Response {
        id,
        status,
        headers: HashMap::from([("content-type".to_string(), "text/plain".to_string())]),
        body: encode_body(text.as_bytes()),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
