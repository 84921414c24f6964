//! Peer handshake and record encryption.
//!
//! Peers run Noise NK. The dialer must already know the listener's static
//! key, which is the Montgomery form of the relay's ed25519 public key, to
//! produce a first message the listener can decrypt. A peer that does not
//! know the key never gets past it. After the two handshake messages both
//! sides hold a [`Session`], and every byte of the protocol stream travels
//! in sealed RECORD frames.

use crate::frame::{DecodeError, Frame, TYPE_HANDSHAKE, TYPE_RECORD};
use crate::keys::{KeyError, Keypair, PublicKey};
use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, StatelessTransportState};
use std::sync::Arc;
use thiserror::Error;

pub const NOISE_PARAMS: &str = "Noise_NK_25519_ChaChaPoly_BLAKE2s";

/// Largest plaintext sealed into one record.
pub const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;

const PROLOGUE: &[u8] = b"natrelay-handshake-v1";
const MAX_MESSAGE_LEN: usize = 65_535;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("peer key unusable: {0}")]
    Key(#[from] KeyError),
    #[error("noise: {0}")]
    Noise(String),
    #[error("record {0} failed to decrypt")]
    BadRecord(u64),
}

impl From<snow::Error> for HandshakeError {
    fn from(err: snow::Error) -> Self {
        HandshakeError::Noise(err.to_string())
    }
}

fn params() -> Result<NoiseParams, HandshakeError> {
    Ok(NOISE_PARAMS.parse()?)
}

/// Dialer side of the handshake.
pub struct Initiator {
    state: HandshakeState,
}

impl Initiator {
    /// Prepares a handshake with whoever holds the secret behind `remote`.
    pub fn new(remote: &PublicKey) -> Result<Self, HandshakeError> {
        let remote_static = remote.agreement_key()?;
        let state = Builder::new(params()?)
            .prologue(PROLOGUE)
            .remote_public_key(&remote_static)
            .build_initiator()?;
        Ok(Self { state })
    }

    /// First message, `-> e, es`.
    pub fn hello(&mut self) -> Result<Frame, HandshakeError> {
        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        let len = self.state.write_message(&[], &mut buf)?;
        buf.truncate(len);
        Ok(Frame {
            typ: TYPE_HANDSHAKE,
            payload: buf,
        })
    }

    /// Reads the listener's reply, `<- e, ee`.
    pub fn finish(mut self, reply: &Frame) -> Result<Session, HandshakeError> {
        let message = reply.expect_type(TYPE_HANDSHAKE)?;
        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        self.state.read_message(message, &mut buf)?;
        Session::from_handshake(self.state)
    }
}

/// Listener side of the handshake.
pub struct Responder {
    state: HandshakeState,
}

impl Responder {
    pub fn new(keypair: &Keypair) -> Result<Self, HandshakeError> {
        let secret = keypair.agreement_secret();
        let state = Builder::new(params()?)
            .prologue(PROLOGUE)
            .local_private_key(&secret)
            .build_responder()?;
        Ok(Self { state })
    }

    /// Answers the dialer's first message. Fails unless the dialer
    /// encrypted it to this listener's key.
    pub fn respond(mut self, hello: &Frame) -> Result<(Frame, Session), HandshakeError> {
        let message = hello.expect_type(TYPE_HANDSHAKE)?;
        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        self.state.read_message(message, &mut buf)?;
        let len = self.state.write_message(&[], &mut buf)?;
        buf.truncate(len);
        let reply = Frame {
            typ: TYPE_HANDSHAKE,
            payload: buf,
        };
        Ok((reply, Session::from_handshake(self.state)?))
    }
}

/// Keys agreed by a finished handshake.
#[derive(Debug)]
pub struct Session {
    transport: Arc<StatelessTransportState>,
}

impl Session {
    fn from_handshake(state: HandshakeState) -> Result<Self, HandshakeError> {
        Ok(Self {
            transport: Arc::new(state.into_stateless_transport_mode()?),
        })
    }

    /// Splits into independent halves for the two directions.
    pub fn split(self) -> (Sealer, Opener) {
        let sealer = Sealer {
            transport: self.transport.clone(),
            nonce: 0,
        };
        let opener = Opener {
            transport: self.transport,
            nonce: 0,
        };
        (sealer, opener)
    }
}

pub struct Sealer {
    transport: Arc<StatelessTransportState>,
    nonce: u64,
}

impl Sealer {
    /// Encrypts at most [`MAX_RECORD_PLAINTEXT`] bytes into one record.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Frame, HandshakeError> {
        debug_assert!(plaintext.len() <= MAX_RECORD_PLAINTEXT);
        let mut buf = vec![0u8; plaintext.len() + TAG_LEN];
        let len = self
            .transport
            .write_message(self.nonce, plaintext, &mut buf)?;
        buf.truncate(len);
        self.nonce += 1;
        Ok(Frame {
            typ: TYPE_RECORD,
            payload: buf,
        })
    }
}

pub struct Opener {
    transport: Arc<StatelessTransportState>,
    nonce: u64,
}

impl Opener {
    /// Decrypts the next record. Records must be opened in the order they
    /// were sealed.
    pub fn open(&mut self, record: &Frame) -> Result<Vec<u8>, HandshakeError> {
        let ciphertext = record.expect_type(TYPE_RECORD)?;
        let mut buf = vec![0u8; ciphertext.len()];
        let len = self
            .transport
            .read_message(self.nonce, ciphertext, &mut buf)
            .map_err(|_| HandshakeError::BadRecord(self.nonce))?;
        buf.truncate(len);
        self.nonce += 1;
        Ok(buf)
    }
}
