//! Control-channel server: accepts inbound client connections, validates
//! the `register` frame, and runs a reader/writer task pair per
//! registration. Grounded on the teacher's TCP transport accept loop
//! (per-connection spawn, `tokio::select!`-driven read loop, cleanup on
//! disconnect), generalized from a raw byte handler to a
//! `Framed<TcpStream, FrameCodec>` handler with a dedicated writer task fed
//! by a bounded channel — the one correctness-critical design choice named
//! in the design notes.

use std::{sync::Arc, time::Duration};

use codec::{Frame, FrameCodec, decode_body};
use futures::{SinkExt, StreamExt};
use service::{pending::PendingOutcome, registry::ClientHandle};
use tokio::{net::TcpListener, sync::{mpsc, watch}, time::timeout};
use tokio_util::codec::Framed;

use crate::identity::is_valid_token;

use super::SharedState;

const WRITER_QUEUE_CAPACITY: usize = 256;
const REGISTER_DEADLINE: Duration = Duration::from_secs(10);
const DRAIN_WINDOW: Duration = Duration::from_secs(2);

pub async fn run(listener: TcpListener, state: Arc<SharedState>, mut shutdown: watch::Receiver<bool>) {
    log::info!("control channel listening: {}", state.config.control_addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("control accept failed: {e}");
                        continue;
                    }
                };

                socket.set_nodelay(true).ok();
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, remote_addr, state).await {
                        log::debug!("control connection from {remote_addr} ended: {e}");
                    }
                });
            }
            _ = shutdown.changed() => {
                log::info!("control channel no longer accepting new connections");
                break;
            }
        }
    }
}

/// Fails every outstanding pending request with a `SHUTTING_DOWN` error and
/// evicts every registration, so connected clients see a clean close rather
/// than a dropped socket.
pub fn shutdown_registrations(state: &SharedState) {
    for handle in state.registry.connected() {
        for sender in handle.pending().drain() {
            let _ = sender.send(PendingOutcome::Error {
                code: "SHUTTING_DOWN".to_string(),
                message: "relay is shutting down".to_string(),
            });
        }
        handle.notify_closed();
    }
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    remote_addr: std::net::SocketAddr,
    state: Arc<SharedState>,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, FrameCodec::new(state.config.max_request_size));

    let first = timeout(REGISTER_DEADLINE, framed.next())
        .await
        .map_err(|_| anyhow::anyhow!("register deadline elapsed"))?
        .ok_or_else(|| anyhow::anyhow!("connection closed before registering"))??;

    let (token, target_port) = match first {
        Frame::Register { token, target_port } => (token, target_port),
        other => {
            anyhow::bail!("expected register frame, got {other:?}");
        }
    };

    if !is_valid_token(&token) {
        let _ = framed
            .send(Frame::registered_err("INVALID_TOKEN", "token is not well-formed"))
            .await;
        anyhow::bail!("rejected malformed token from {remote_addr}");
    }

    let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
    let handle = ClientHandle::new(token.clone(), target_port, remote_addr, writer_tx);

    let outcome = state.registry.register(handle.clone());
    if let Some(displaced) = outcome.displaced {
        log::info!("registration for {token} displaced a prior connection, draining");
        displaced.notify_closed();
        let pending = displaced.pending().drain();
        tokio::spawn(async move {
            tokio::time::sleep(DRAIN_WINDOW).await;
            for sender in pending {
                let _ = sender.send(PendingOutcome::Disconnected);
            }
        });
    }

    #[cfg(feature = "prometheus")]
    crate::metrics::METRICS.connected_clients.inc();

    let (mut sink, mut stream) = framed.split();
    sink.send(Frame::registered_ok()).await?;
    log::info!("client registered: token={token} target_port={target_port} addr={remote_addr}");

    let mut writer_rx = writer_rx;
    let writer = tokio::spawn(async move {
        while let Some(frame) = writer_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut last_frame = tokio::time::Instant::now();
    let heartbeat_timeout = state.config.heartbeat_timeout;

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Frame::Response { id, status, headers, body })) => {
                        last_frame = tokio::time::Instant::now();
                        let outcome = match decode_body(&body) {
                            Ok(body) => PendingOutcome::Response { status, headers, body },
                            Err(_) => PendingOutcome::Error {
                                code: "MALFORMED_BODY".to_string(),
                                message: "response body was not valid base64".to_string(),
                            },
                        };
                        if !handle.pending().complete(id, outcome) {
                            log::debug!("dropping unmatched or duplicate response id={id} for token={token}");
                        }
                    }
                    Some(Ok(Frame::Error { id: Some(id), code, message })) => {
                        last_frame = tokio::time::Instant::now();
                        if !handle.pending().complete(id, PendingOutcome::Error { code, message }) {
                            log::debug!("dropping unmatched or duplicate error id={id} for token={token}");
                        }
                    }
                    Some(Ok(Frame::Ping { ts })) => {
                        last_frame = tokio::time::Instant::now();
                        if !handle.try_send(Frame::Pong { ts }) {
                            break;
                        }
                    }
                    Some(Ok(Frame::Pong { .. })) => {
                        last_frame = tokio::time::Instant::now();
                    }
                    Some(Ok(other)) => {
                        log::warn!("ignoring unexpected frame from {token}: {other:?}");
                    }
                    Some(Err(e)) => {
                        log::warn!("control read error for {token}: {e}");
                        break;
                    }
                    None => break,
                }
            }
            _ = handle.closed.notified() => {
                log::debug!("registration for {token} closed by eviction");
                break;
            }
            _ = tokio::time::sleep(heartbeat_timeout) => {
                if last_frame.elapsed() >= heartbeat_timeout {
                    log::info!("dropping {token}: no frames within heartbeat timeout");
                    break;
                }
            }
        }
    }

    state.registry.unregister(&token, &handle);
    for sender in handle.pending().drain() {
        let _ = sender.send(PendingOutcome::Disconnected);
    }

    writer.abort();
    #[cfg(feature = "prometheus")]
    crate::metrics::METRICS.connected_clients.dec();

    log::info!("client disconnected: token={token} addr={remote_addr}");
    Ok(())
}
