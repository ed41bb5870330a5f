//! The pending-request map pairs an ingress request with the eventual
//! `response`/`error` frame that answers it. It is the natural
//! representation of "a concurrent map from request id to a one-shot
//! completion object": the ingress task awaits a [`tokio::sync::oneshot`]
//! receiver, the control connection's reader completes it when the matching
//! frame arrives, and a deadline timer completes it with [`PendingOutcome::Timeout`].

use std::collections::HashMap as StdHashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum PendingOutcome {
    Response {
        status: u16,
        headers: StdHashMap<String, String>,
        body: Vec<u8>,
    },
    Error {
        code: String,
        message: String,
    },
    Timeout,
    Disconnected,
}

/// Per-registration map of in-flight request ids to their completion
/// channel. Never contains two entries with the same id at once: an id is
/// only reused after its prior entry has been removed.
#[derive(Default)]
pub struct PendingMap {
    inner: Mutex<StdHashMap<u64, oneshot::Sender<PendingOutcome>>>,
}

impl PendingMap {
    pub fn insert(&self, id: u64, tx: oneshot::Sender<PendingOutcome>) {
        self.inner.lock().insert(id, tx);
    }

    /// Complete the pending entry for `id`, if one exists. Returns `false`
    /// for an id with no entry (already completed, already timed out, or a
    /// duplicate response the caller must drop and log).
    pub fn complete(&self, id: u64, outcome: PendingOutcome) -> bool {
        match self.inner.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `id` without completing it (the caller is
    /// about to complete the receiver itself, e.g. on timeout).
    pub fn remove(&self, id: u64) -> Option<oneshot::Sender<PendingOutcome>> {
        self.inner.lock().remove(&id)
    }

    /// Drain every outstanding entry, for connection teardown: each sender
    /// is returned so the caller can fail them all (e.g. with `502`).
    pub fn drain(&self) -> Vec<oneshot::Sender<PendingOutcome>> {
        self.inner.lock().drain().map(|(_, tx)| tx).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_delivers_to_the_matching_waiter() {
        let pending = PendingMap::default();
        let (tx, rx) = oneshot::channel();
        pending.insert(1, tx);

        assert!(pending.complete(1, PendingOutcome::Timeout));
        assert!(matches!(rx.await.unwrap(), PendingOutcome::Timeout));
        assert!(pending.is_empty());
    }

    #[test]
    fn duplicate_completion_is_reported_as_unmatched() {
        let pending = PendingMap::default();
        let (tx, _rx) = oneshot::channel();
        pending.insert(1, tx);

        assert!(pending.complete(1, PendingOutcome::Timeout));
        assert!(!pending.complete(1, PendingOutcome::Timeout));
    }

    #[test]
    fn drain_returns_every_outstanding_sender() {
        let pending = PendingMap::default();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        pending.insert(1, tx1);
        pending.insert(2, tx2);

        assert_eq!(pending.drain().len(), 2);
        assert!(pending.is_empty());
    }
}
