use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use natrelay_proto::CorrelationId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};

pub type ClientId = String;

/// Why a frame could not be handed to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    Closed,
    /// Outbound buffer full; the client is not keeping up.
    Backlogged,
}

/// One connected peer.
pub struct ClientHandle {
    pub id: ClientId,
    pub remote: String,
    pub connected_at: DateTime<Utc>,
    started: Instant,
    tx: mpsc::Sender<Bytes>,
    closed: AtomicBool,
    close_signal: Notify,
    last_activity: Mutex<Instant>,
    pending: Mutex<HashSet<CorrelationId>>,
    owned: Mutex<HashSet<String>>,
}

impl ClientHandle {
    pub fn new(id: ClientId, remote: String, tx: mpsc::Sender<Bytes>) -> Self {
        let now = Instant::now();
        Self {
            id,
            remote,
            connected_at: Utc::now(),
            started: now,
            tx,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            last_activity: Mutex::new(now),
            pending: Mutex::new(HashSet::new()),
            owned: Mutex::new(HashSet::new()),
        }
    }

    pub fn deliver(&self, frame: Bytes) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backlogged,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sets the closed flag; true only for the first caller.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Asks the connection task to drop the stream.
    pub fn disconnect(&self) {
        self.close_signal.notify_one();
    }

    pub async fn disconnected(&self) {
        self.close_signal.notified().await
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn add_pending(&self, ids: &[CorrelationId]) {
        self.pending.lock().extend(ids.iter().cloned());
    }

    pub fn complete(&self, id: &CorrelationId) {
        self.pending.lock().remove(id);
    }

    pub fn complete_all(&self, ids: &[CorrelationId]) {
        let mut pending = self.pending.lock();
        for id in ids {
            pending.remove(id);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn take_pending(&self) -> Vec<CorrelationId> {
        self.pending.lock().drain().collect()
    }

    pub fn own(&self, resource: String) {
        self.owned.lock().insert(resource);
    }

    pub fn disown(&self, resource: &str) {
        self.owned.lock().remove(resource);
    }

    pub fn owned(&self) -> Vec<String> {
        let mut owned: Vec<String> = self.owned.lock().iter().cloned().collect();
        owned.sort();
        owned
    }

    pub fn take_owned(&self) -> Vec<String> {
        self.owned.lock().drain().collect()
    }
}

/// All connected clients, keyed by id.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientHandle>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    pub fn register(&self, client: Arc<ClientHandle>) {
        log::debug!("registering client {}", client.id);
        self.clients.insert(client.id.clone(), client);
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<ClientHandle>> {
        log::debug!("unregistering client {}", id);
        self.clients.remove(id).map(|(_, client)| client)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClientHandle>> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Clients ordered by connection time, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        let mut clients: Vec<Arc<ClientHandle>> =
            self.clients.iter().map(|e| e.value().clone()).collect();
        clients.sort_by_key(|c| c.started());
        clients
    }

    /// Hands `frame` to every open client. Returns the clients that could not
    /// keep up.
    pub fn broadcast(&self, frame: &Bytes) -> Vec<Arc<ClientHandle>> {
        let mut backlogged = Vec::new();
        for entry in self.clients.iter() {
            let client = entry.value();
            if let Err(DeliveryError::Backlogged) = client.deliver(frame.clone()) {
                backlogged.push(client.clone());
            }
        }
        backlogged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;

    fn client(id: &str, capacity: usize) -> (Arc<ClientHandle>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(ClientHandle::new(id.to_string(), "test".to_string(), tx)),
            rx,
        )
    }

    #[test]
    fn empty_once_the_last_client_leaves() {
        let registry = ClientRegistry::new();
        assert!(registry.is_empty());
        let (a, _a_rx) = client("a", 1);
        registry.register(a);
        assert!(!registry.is_empty());
        assert!(registry.unregister("a").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_skips_closed_and_reports_backlog() {
        let registry = ClientRegistry::new();
        let (a, mut a_rx) = client("a", 4);
        let (b, _b_rx) = client("b", 1);
        let (c, mut c_rx) = client("c", 4);
        registry.register(a);
        registry.register(b.clone());
        registry.register(c.clone());
        c.mark_closed();

        b.deliver(Bytes::from_static(b"fill")).unwrap();
        let backlogged = registry.broadcast(&Bytes::from_static(b"event\n"));

        assert_equal!(a_rx.try_recv().unwrap(), Bytes::from_static(b"event\n"));
        assert!(c_rx.try_recv().is_err());
        assert_equal!(backlogged.len(), 1);
        assert_equal!(backlogged[0].id, "b");
    }

    #[test]
    fn closed_flag_is_set_once() {
        let (a, _rx) = client("a", 1);
        assert!(a.mark_closed());
        assert!(!a.mark_closed());
        assert_equal!(
            a.deliver(Bytes::from_static(b"x")),
            Err(DeliveryError::Closed)
        );
    }

    #[test]
    fn pending_and_owned_bookkeeping() {
        let (a, _rx) = client("a", 1);
        a.add_pending(&[CorrelationId::Number(1), CorrelationId::Number(2)]);
        a.complete(&CorrelationId::Number(1));
        assert_equal!(a.pending_count(), 1);
        a.own("p1".to_string());
        a.own("p2".to_string());
        a.disown("p1");
        assert_equal!(a.owned(), vec!["p2".to_string()]);
        assert_equal!(a.take_pending(), vec![CorrelationId::Number(2)]);
        assert_equal!(a.pending_count(), 0);
    }

    #[test]
    fn snapshot_is_oldest_first() {
        let registry = ClientRegistry::new();
        let (first, _r1) = client("first", 1);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let (second, _r2) = client("second", 1);
        registry.register(second);
        registry.register(first);
        let ids: Vec<String> = registry.snapshot().iter().map(|c| c.id.clone()).collect();
        assert_equal!(ids, vec!["first".to_string(), "second".to_string()]);
    }
}
