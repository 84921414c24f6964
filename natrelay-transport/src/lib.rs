//! Key-addressed duplex streams.
//!
//! A relay listens under its public key; a connector dials that key. The
//! two run a Noise handshake that only succeeds when the dialer knows the
//! key and the listener holds the matching secret. Both ends then get a
//! byte stream that is sealed on the wire. [`TcpTransport`] resolves keys
//! through a static peer table, [`MemoryTransport`] keeps everything
//! in-process for tests.

use async_trait::async_trait;
use natrelay_proto::{Keypair, PublicKey};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

mod backoff;
mod error;
mod handshake;
mod memory;
mod secure;
mod tcp;

pub use backoff::Backoff;
pub use error::TransportError;
pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type PeerStream = Box<dyn PeerIo>;

/// An encrypted stream plus a description of the far end for logs.
pub struct Connection {
    pub stream: PeerStream,
    pub remote: String,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Starts accepting peers that dial `keypair`'s public key.
    async fn listen(&self, keypair: &Keypair) -> Result<Box<dyn Listener>, TransportError>;

    /// Opens a stream to whoever serves `public_key`.
    async fn connect(&self, public_key: &PublicKey) -> Result<Connection, TransportError>;
}

#[async_trait]
pub trait Listener: Send + 'static {
    fn public_key(&self) -> PublicKey;

    /// Socket address peers dial, for transports that have one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Next peer that finished the handshake; `None` once the listener has closed.
    async fn accept(&mut self) -> Option<Result<Connection, TransportError>>;

    /// Stops accepting. The key becomes free for another listener.
    async fn close(&mut self);
}
