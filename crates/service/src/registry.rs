//! The client registry is the relay's single source of truth for "which
//! client owns which token right now." It mirrors the shape of a session
//! table: an [`ahash`](https://docs.rs/ahash)-backed map guarded by a single
//! [`parking_lot::RwLock`], with each entry reference-counted so that a
//! lookup can be held across an `await` without pinning the table lock.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use codec::Frame;
use parking_lot::RwLock;
use tokio::sync::{Notify, mpsc};

use crate::{Table, pending::PendingMap};

/// A live client registration: one token, one control-channel write lane.
pub struct ClientHandle {
    pub token: String,
    pub target_port: u16,
    pub remote_addr: std::net::SocketAddr,
    pub connected_at: u64,
    writer: mpsc::Sender<Frame>,
    pending: PendingMap,
    next_request_id: AtomicU64,
    /// Signalled once when this handle is displaced or torn down, so the
    /// connection's own tasks can stop promptly instead of polling state.
    pub closed: Notify,
}

impl ClientHandle {
    pub fn new(
        token: String,
        target_port: u16,
        remote_addr: std::net::SocketAddr,
        writer: mpsc::Sender<Frame>,
    ) -> Arc<Self> {
        Arc::new(Self {
            token,
            target_port,
            remote_addr,
            connected_at: now(),
            writer,
            pending: PendingMap::default(),
            next_request_id: AtomicU64::new(0),
            closed: Notify::new(),
        })
    }

    pub fn pending(&self) -> &PendingMap {
        &self.pending
    }

    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Enqueue a frame on this registration's single writer lane. Returns
    /// `false` if the writer's bounded queue is full or the connection is
    /// already gone; per the backpressure policy, the caller must treat
    /// this as equivalent to the registration being dropped rather than
    /// blocking.
    pub fn try_send(&self, frame: Frame) -> bool {
        self.writer.try_send(frame).is_ok()
    }

    pub fn notify_closed(&self) {
        self.closed.notify_waiters();
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct RegisterOutcome {
    pub displaced: Option<Arc<ClientHandle>>,
}

/// Authoritative in-process map from token to the currently connected
/// client. At most one handle per token; a second `register` for the same
/// token evicts (and returns) the first.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<Table<String, Arc<ClientHandle>>>,
}

impl ClientRegistry {
    /// # Test
    ///
    /// ```
    /// use std::net::SocketAddr;
    /// use tokio::sync::mpsc;
    /// use tunnel_relay_service::registry::{ClientHandle, ClientRegistry};
    ///
    /// let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    /// let (tx, _rx) = mpsc::channel(8);
    /// let registry = ClientRegistry::default();
    ///
    /// let first = ClientHandle::new("a".repeat(32), 3000, addr, tx.clone());
    /// assert!(registry.register(first.clone()).displaced.is_none());
    ///
    /// let second = ClientHandle::new("a".repeat(32), 3001, addr, tx);
    /// let outcome = registry.register(second.clone());
    /// assert!(outcome.displaced.is_some());
    ///
    /// assert_eq!(registry.lookup(&"a".repeat(32)).unwrap().target_port, 3001);
    /// ```
    pub fn register(&self, handle: Arc<ClientHandle>) -> RegisterOutcome {
        let displaced = self.clients.write().insert(handle.token.clone(), handle);
        RegisterOutcome { displaced }
    }

    pub fn lookup(&self, token: &str) -> Option<Arc<ClientHandle>> {
        self.clients.read().get(token).cloned()
    }

    /// Only succeeds if the handle currently registered for `token` is
    /// exactly the one supplied, so a disconnecting registration never
    /// unregisters the registration that displaced it.
    pub fn unregister(&self, token: &str, handle: &Arc<ClientHandle>) -> bool {
        let mut clients = self.clients.write();
        let matches = clients.get(token).is_some_and(|cur| Arc::ptr_eq(cur, handle));
        if matches {
            clients.remove(token);
        }
        matches
    }

    pub fn connected(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(token: &str, port: u16) -> Arc<ClientHandle> {
        let (tx, _rx) = mpsc::channel(8);
        ClientHandle::new(token.to_string(), port, "127.0.0.1:1".parse().unwrap(), tx)
    }

    #[test]
    fn unregister_is_idempotent_and_race_tolerant() {
        let registry = ClientRegistry::default();
        let first = handle(&"b".repeat(32), 1);
        registry.register(first.clone());

        let second = handle(&"b".repeat(32), 2);
        let outcome = registry.register(second.clone());
        assert!(outcome.displaced.is_some());

        // The displaced handle no longer owns the slot; unregistering it must
        // not evict the handle that replaced it.
        assert!(!registry.unregister(&"b".repeat(32), &first));
        assert!(registry.lookup(&"b".repeat(32)).is_some());

        assert!(registry.unregister(&"b".repeat(32), &second));
        assert!(registry.lookup(&"b".repeat(32)).is_none());

        // Idempotent: unregistering again is a no-op, not an error.
        assert!(!registry.unregister(&"b".repeat(32), &second));
    }
}
