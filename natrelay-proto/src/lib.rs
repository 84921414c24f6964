//! Wire-level pieces shared by the relay and its connector.
//!
//! * [`keys`]: seed-derived ed25519 identities and hex public keys
//! * [`frame`] / [`handshake`]: the length-prefixed frames two peers
//!   exchange, and the Noise handshake and record encryption carried in them
//! * [`assembler`]: splits the backend protocol byte stream into frames
//! * [`correlation`] / [`envelope`]: read routing metadata out of frames

pub mod assembler;
pub mod correlation;
pub mod envelope;
pub mod frame;
pub mod handshake;
pub mod keys;

pub use assembler::{FrameAssembler, ProtocolFrame};
pub use correlation::CorrelationId;
pub use keys::{Keypair, PublicKey};
