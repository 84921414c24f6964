use crate::tcp::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::{handshake, secure, Connection, Listener, Transport, TransportError};
use async_trait::async_trait;
use natrelay_proto::{Keypair, PublicKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PIPE_CAPACITY: usize = 256 * 1024;
const BACKLOG: usize = 64;

type Registry = Arc<Mutex<HashMap<PublicKey, mpsc::Sender<DuplexStream>>>>;

/// In-process transport; clones share one key namespace.
///
/// Streams are `tokio::io::duplex` pipes and still run the full handshake
/// and record encryption, so they behave like the TCP transport minus the
/// sockets.
#[derive(Clone)]
pub struct MemoryTransport {
    listeners: Registry,
    handshake_timeout: Duration,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self {
            listeners: Registry::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn is_listening(&self, public_key: &PublicKey) -> bool {
        self.listeners
            .lock()
            .get(public_key)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Hands the listener a stream without running the dialer side.
    #[cfg(test)]
    fn connect_raw(&self, public_key: &PublicKey) -> Option<DuplexStream> {
        let tx = self.listeners.lock().get(public_key).cloned()?;
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        tx.try_send(remote).ok()?;
        Some(local)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, keypair: &Keypair) -> Result<Box<dyn Listener>, TransportError> {
        let public_key = keypair.public_key();
        let (tx, rx) = mpsc::channel(BACKLOG);
        {
            let mut listeners = self.listeners.lock();
            if listeners.get(&public_key).is_some_and(|tx| !tx.is_closed()) {
                return Err(TransportError::KeyInUse(public_key));
            }
            listeners.insert(public_key, tx.clone());
        }
        log::debug!("memory listener up for {}", public_key);

        let (ready_tx, ready_rx) = mpsc::channel(BACKLOG);
        let task = tokio::spawn(accept_loop(
            rx,
            keypair.clone(),
            self.handshake_timeout,
            ready_tx,
        ));
        Ok(Box::new(MemoryListener {
            public_key,
            registered: tx,
            incoming: ready_rx,
            listeners: self.listeners.clone(),
            task: Some(task),
        }))
    }

    async fn connect(&self, public_key: &PublicKey) -> Result<Connection, TransportError> {
        let tx = self
            .listeners
            .lock()
            .get(public_key)
            .cloned()
            .ok_or(TransportError::Unreachable(*public_key))?;

        let (mut local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send(remote)
            .await
            .map_err(|_| TransportError::Unreachable(*public_key))?;

        let session = tokio::time::timeout(
            self.handshake_timeout,
            handshake::dial(&mut local, public_key),
        )
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;
        let remote = format!("memory:{}", public_key);
        Ok(Connection {
            stream: secure::wrap(local, session, remote.clone()),
            remote,
        })
    }
}

async fn accept_loop(
    mut pending: mpsc::Receiver<DuplexStream>,
    keypair: Keypair,
    handshake_timeout: Duration,
    tx: mpsc::Sender<Result<Connection, TransportError>>,
) {
    let mut serial = 0u64;
    while let Some(mut stream) = pending.recv().await {
        serial += 1;
        let remote = format!("memory-peer-{}", serial);
        let keypair = keypair.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result =
                tokio::time::timeout(handshake_timeout, handshake::accept(&mut stream, &keypair))
                    .await
                    .map_err(|_| TransportError::HandshakeTimeout)
                    .and_then(|r| r);
            let conn = result.map(|session| Connection {
                stream: secure::wrap(stream, session, remote.clone()),
                remote: remote.clone(),
            });
            if let Err(e) = &conn {
                log::debug!("handshake with {} failed: {}", remote, e);
            }
            let _ = tx.send(conn).await;
        });
    }
}

struct MemoryListener {
    public_key: PublicKey,
    registered: mpsc::Sender<DuplexStream>,
    incoming: mpsc::Receiver<Result<Connection, TransportError>>,
    listeners: Registry,
    task: Option<JoinHandle<()>>,
}

impl MemoryListener {
    fn unregister(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();
        self.incoming.close();
        let mut listeners = self.listeners.lock();
        if listeners
            .get(&self.public_key)
            .is_some_and(|tx| tx.same_channel(&self.registered))
        {
            listeners.remove(&self.public_key);
        }
    }
}

#[async_trait]
impl Listener for MemoryListener {
    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    async fn accept(&mut self) -> Option<Result<Connection, TransportError>> {
        self.task.as_ref()?;
        self.incoming.recv().await
    }

    async fn close(&mut self) {
        self.unregister();
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connect_reaches_listener() {
        let transport = MemoryTransport::new();
        let keypair = Keypair::from_seed(b"relay");
        let mut listener = transport.listen(&keypair).await.unwrap();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap().unwrap();
            let mut buf = [0u8; 4];
            conn.stream.read_exact(&mut buf).await.unwrap();
            conn.stream.write_all(&buf).await.unwrap();
            listener
        });

        let mut conn = transport.connect(&keypair.public_key()).await.unwrap();
        conn.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.stream.read_exact(&mut buf).await.unwrap();
        k9::assert_equal!(&buf, b"ping");
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn unknown_key_is_unreachable() {
        let transport = MemoryTransport::new();
        let key = Keypair::from_seed(b"nobody").public_key();
        assert!(matches!(
            transport.connect(&key).await,
            Err(TransportError::Unreachable(k)) if k == key
        ));
    }

    #[tokio::test]
    async fn key_is_exclusive_until_closed() {
        let transport = MemoryTransport::new();
        let keypair = Keypair::from_seed(b"relay");

        let mut first = transport.listen(&keypair).await.unwrap();
        assert!(matches!(
            transport.listen(&keypair).await,
            Err(TransportError::KeyInUse(_))
        ));

        first.close().await;
        assert!(!transport.is_listening(&keypair.public_key()));
        let _second = transport.listen(&keypair).await.unwrap();
        assert!(transport.is_listening(&keypair.public_key()));
    }

    #[tokio::test]
    async fn silent_dialer_does_not_hold_up_others() {
        let transport = MemoryTransport::new().with_handshake_timeout(Duration::from_millis(200));
        let keypair = Keypair::from_seed(b"relay");
        let mut listener = transport.listen(&keypair).await.unwrap();

        let _silent = transport.connect_raw(&keypair.public_key()).unwrap();
        let dialer = {
            let transport = transport.clone();
            let key = keypair.public_key();
            tokio::spawn(async move { transport.connect(&key).await })
        };

        let first = tokio::time::timeout(Duration::from_millis(150), listener.accept())
            .await
            .expect("accept waited on the silent dialer")
            .unwrap();
        assert!(first.is_ok());
        assert!(dialer.await.unwrap().is_ok());

        let second = listener.accept().await.unwrap();
        assert!(matches!(second, Err(TransportError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn stranger_without_the_key_is_rejected() {
        let transport = MemoryTransport::new();
        let keypair = Keypair::from_seed(b"relay");
        let mut listener = transport.listen(&keypair).await.unwrap();

        let mut stranger = transport.connect_raw(&keypair.public_key()).unwrap();
        stranger
            .write_all(&natrelay_proto::frame::encode_frame(1, &[7u8; 48]))
            .await
            .unwrap();
        stranger
            .write_all(b"{\"id\":1,\"method\":\"navigate\"}\n")
            .await
            .unwrap();

        assert!(matches!(
            listener.accept().await,
            Some(Err(TransportError::Handshake(_)))
        ));
    }
}
