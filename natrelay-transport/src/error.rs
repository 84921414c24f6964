use natrelay_proto::frame::DecodeError;
use natrelay_proto::handshake::HandshakeError;
use natrelay_proto::PublicKey;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("key {0} is already being served")]
    KeyInUse(PublicKey),
    #[error("no route to peer {0}")]
    Unreachable(PublicKey),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("malformed handshake frame: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
