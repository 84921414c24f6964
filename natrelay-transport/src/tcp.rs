use crate::{handshake, secure, Connection, Listener, Transport, TransportError};
use async_trait::async_trait;
use natrelay_proto::{Keypair, PublicKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const BACKLOG: usize = 64;

/// TCP transport. Listening binds `bind`; dialing resolves the public key
/// through a static table of known peers. Every connection is encrypted
/// once the handshake completes.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    bind: SocketAddr,
    peers: HashMap<PublicKey, SocketAddr>,
    handshake_timeout: Duration,
}

impl TcpTransport {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            peers: HashMap::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Dial-only transport that knows a single peer.
    pub fn dialer(public_key: PublicKey, addr: SocketAddr) -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], 0))).with_peer(public_key, addr)
    }

    pub fn with_peer(mut self, public_key: PublicKey, addr: SocketAddr) -> Self {
        self.peers.insert(public_key, addr);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, keypair: &Keypair) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(self.bind)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.bind,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        log::info!(
            "listening on {} for peers of {}",
            local_addr,
            keypair.public_key()
        );

        let (tx, rx) = mpsc::channel(BACKLOG);
        let task = tokio::spawn(accept_loop(
            listener,
            keypair.clone(),
            self.handshake_timeout,
            tx,
        ));
        Ok(Box::new(TcpPeerListener {
            public_key: keypair.public_key(),
            local_addr,
            incoming: rx,
            task: Some(task),
        }))
    }

    async fn connect(&self, public_key: &PublicKey) -> Result<Connection, TransportError> {
        let addr = *self
            .peers
            .get(public_key)
            .ok_or(TransportError::Unreachable(*public_key))?;

        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        let session = tokio::time::timeout(
            self.handshake_timeout,
            handshake::dial(&mut stream, public_key),
        )
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;

        let remote = addr.to_string();
        Ok(Connection {
            stream: secure::wrap(stream, session, remote.clone()),
            remote,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    keypair: Keypair,
    handshake_timeout: Duration,
    tx: mpsc::Sender<Result<Connection, TransportError>>,
) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                continue;
            }
        };
        stream.set_nodelay(true).ok();

        let keypair = keypair.clone();
        let tx = tx.clone();
        // Handshakes run off the accept path so a silent peer cannot stall others.
        tokio::spawn(async move {
            let result =
                tokio::time::timeout(handshake_timeout, handshake::accept(&mut stream, &keypair))
                    .await
                    .map_err(|_| TransportError::HandshakeTimeout)
                    .and_then(|r| r);
            let conn = result.map(|session| Connection {
                stream: secure::wrap(stream, session, peer.to_string()),
                remote: peer.to_string(),
            });
            if let Err(e) = &conn {
                log::debug!("handshake with {} failed: {}", peer, e);
            }
            let _ = tx.send(conn).await;
        });
    }
}

struct TcpPeerListener {
    public_key: PublicKey,
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Result<Connection, TransportError>>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Listener for TcpPeerListener {
    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    async fn accept(&mut self) -> Option<Result<Connection, TransportError>> {
        self.task.as_ref()?;
        self.incoming.recv().await
    }

    async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            self.incoming.close();
            log::info!("stopped listening on {}", self.local_addr);
        }
    }
}

impl Drop for TcpPeerListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn bound_listener(keypair: &Keypair) -> (Box<dyn Listener>, SocketAddr) {
        let transport = TcpTransport::new("127.0.0.1:0".parse().unwrap());
        let listener = transport.listen(keypair).await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn dial_by_key_over_tcp() {
        let keypair = Keypair::from_seed(b"tcp-relay");
        let (mut listener, addr) = bound_listener(&keypair).await;

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap().unwrap();
            conn.stream.write_all(b"hi").await.unwrap();
            conn.stream.flush().await.unwrap();
            listener
        });

        let dialer = TcpTransport::dialer(keypair.public_key(), addr);
        let mut conn = dialer.connect(&keypair.public_key()).await.unwrap();
        let mut buf = [0u8; 2];
        conn.stream.read_exact(&mut buf).await.unwrap();
        k9::assert_equal!(&buf, b"hi");
        server.await.unwrap().close().await;
    }

    #[tokio::test]
    async fn dialing_an_imposter_fails() {
        let real = Keypair::from_seed(b"real").public_key();
        let imposter = Keypair::from_seed(b"imposter");
        let (mut listener, addr) = bound_listener(&imposter).await;
        let server = tokio::spawn(async move {
            let accepted = listener.accept().await.unwrap();
            (listener, accepted.is_err())
        });

        let dialer = TcpTransport::dialer(real, addr);
        assert!(dialer.connect(&real).await.is_err());
        let (mut listener, rejected) = server.await.unwrap();
        assert!(rejected);
        listener.close().await;
    }

    #[tokio::test]
    async fn stranger_is_not_admitted_and_sees_no_plaintext() {
        let keypair = Keypair::from_seed(b"tcp-relay");
        let (mut listener, addr) = bound_listener(&keypair).await;

        let mut stranger = TcpStream::connect(addr).await.unwrap();
        stranger
            .write_all(&natrelay_proto::frame::encode_frame(1, &[7u8; 48]))
            .await
            .unwrap();
        stranger
            .write_all(b"{\"id\":1,\"method\":\"navigate\"}\n")
            .await
            .unwrap();

        let accepted = listener.accept().await.unwrap();
        assert!(matches!(accepted, Err(TransportError::Handshake(_))));
        let mut rest = Vec::new();
        stranger.read_to_end(&mut rest).await.unwrap_or_default();
        assert!(rest.is_empty());
        listener.close().await;
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let dialer = TcpTransport::new("127.0.0.1:0".parse().unwrap());
        let key = Keypair::from_seed(b"x").public_key();
        assert!(matches!(
            dialer.connect(&key).await,
            Err(TransportError::Unreachable(_))
        ));
    }
}
