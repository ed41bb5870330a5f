//! Per-token and per-alias traffic counters, kept in memory with atomic
//! increments. Grounded on the statistics module's atomic-counter newtype
//! style: a `Count` wraps an `AtomicU64` with relaxed ordering, since these
//! numbers are monitoring data, not synchronization primitives.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU16, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::RwLock;

use crate::{Identity, Table};

#[derive(Default)]
pub struct Count(AtomicU64);

impl Count {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn add(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::Relaxed) + n
    }
}

/// One identity's accumulated traffic counters.
#[derive(Default)]
pub struct Entry {
    pub requests: Count,
    pub bytes_in: Count,
    pub bytes_out: Count,
    last_seen_at: AtomicU64,
    last_status: AtomicU16,
}

impl Entry {
    pub fn last_seen_at(&self) -> u64 {
        self.last_seen_at.load(Ordering::Relaxed)
    }

    pub fn last_status(&self) -> u16 {
        self.last_status.load(Ordering::Relaxed)
    }

    fn touch(&self, status: u16) {
        self.last_seen_at.store(now(), Ordering::Relaxed);
        self.last_status.store(status, Ordering::Relaxed);
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Counters keyed by token and by alias, monotonic for the lifetime of one
/// relay run. A `relayRunId` stamped at startup lets the control plane
/// compute deltas across relay restarts rather than relying on these ever
/// decreasing.
#[derive(Default)]
pub struct Counters {
    by_token: RwLock<Table<String, Arc<Entry>>>,
    by_alias: RwLock<Table<String, Arc<Entry>>>,
}

impl Counters {
    fn entry(table: &RwLock<Table<String, Arc<Entry>>>, key: &str) -> Arc<Entry> {
        if let Some(entry) = table.read().get(key) {
            return entry.clone();
        }

        table
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Entry::default()))
            .clone()
    }

    pub fn entry_for(&self, identity: &Identity) -> Arc<Entry> {
        match identity {
            Identity::Token(token) => Self::entry(&self.by_token, token),
            Identity::Alias(alias) => Self::entry(&self.by_alias, alias),
        }
    }

    pub fn entry_for_token(&self, token: &str) -> Arc<Entry> {
        Self::entry(&self.by_token, token)
    }

    /// Record the receipt of a request: `requests += 1`, `bytesIn += len`.
    /// Called once per request, regardless of how it resolves.
    pub fn record_received(&self, identity: &Identity, body_len: u64) {
        let entry = self.entry_for(identity);
        entry.requests.add(1);
        entry.bytes_in.add(body_len);
    }

    /// Record the completion of a request: `bytesOut += len`,
    /// `lastStatus := status`, `lastSeenAt := now`.
    pub fn record_completed(&self, identity: &Identity, body_len: u64, status: u16) {
        let entry = self.entry_for(identity);
        entry.bytes_out.add(body_len);
        entry.touch(status);
    }

    pub fn snapshot_by_token(&self) -> Vec<(String, CounterSnapshot)> {
        self.by_token
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), CounterSnapshot::from(v.as_ref())))
            .collect()
    }

    pub fn snapshot_by_alias(&self) -> Vec<(String, CounterSnapshot)> {
        self.by_alias
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), CounterSnapshot::from(v.as_ref())))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CounterSnapshot {
    pub requests: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub last_seen_at: u64,
    pub last_status: u16,
}

impl From<&Entry> for CounterSnapshot {
    fn from(entry: &Entry) -> Self {
        Self {
            requests: entry.requests.get(),
            bytes_in: entry.bytes_in.get(),
            bytes_out: entry.bytes_out.get(),
            last_seen_at: entry.last_seen_at(),
            last_status: entry.last_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic_within_a_run() {
        let counters = Counters::default();
        let identity = Identity::Token("a".repeat(32));

        counters.record_received(&identity, 10);
        counters.record_completed(&identity, 20, 200);
        counters.record_received(&identity, 5);
        counters.record_completed(&identity, 0, 502);

        let snapshot = counters
            .snapshot_by_token()
            .into_iter()
            .find(|(k, _)| k == &"a".repeat(32))
            .unwrap()
            .1;

        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.bytes_in, 15);
        assert_eq!(snapshot.bytes_out, 20);
        assert_eq!(snapshot.last_status, 502);
    }

    #[test]
    fn token_and_alias_counters_are_independent() {
        let counters = Counters::default();
        counters.record_received(&Identity::Alias("myapp".into()), 1);
        assert!(counters.snapshot_by_token().is_empty());
        assert_eq!(counters.snapshot_by_alias().len(), 1);
    }
}
