use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `{ connected, requests, errors, reconnects, startedAt, lastConnectedAt }`
/// per the client forwarder's public contract.
#[derive(Default)]
pub struct Stats {
    connected: AtomicBool,
    requests: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
    started_at: AtomicU64,
    last_connected_at: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        let stats = Self::default();
        stats.started_at.store(now(), Ordering::Relaxed);
        stats
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
        self.last_connected_at.store(now(), Ordering::Relaxed);
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            started_at: self.started_at.load(Ordering::Relaxed),
            last_connected_at: self.last_connected_at.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StatsSnapshot {
    pub connected: bool,
    pub requests: u64,
    pub errors: u64,
    pub reconnects: u64,
    #[serde(rename = "startedAt")]
    pub started_at: u64,
    #[serde(rename = "lastConnectedAt")]
    pub last_connected_at: u64,
}
