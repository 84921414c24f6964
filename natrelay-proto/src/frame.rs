use thiserror::Error;

/// Type byte plus the largest Noise message; anything larger is a confused
/// or hostile peer.
pub const MAX_FRAME_LEN: u32 = 1 + 65_535;

pub const TYPE_HANDSHAKE: u8 = 1;
pub const TYPE_RECORD: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub typ: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("declared length {0} exceeds max {MAX_FRAME_LEN}")]
    LengthTooLarge(u32),
    #[error("declared length {0} is invalid")]
    InvalidLength(u32),
    #[error("expected frame type {expected}, got {actual}")]
    UnexpectedType { expected: u8, actual: u8 },
}

impl Frame {
    pub fn encode_to_vec(&self) -> Vec<u8> {
        encode_frame(self.typ, &self.payload)
    }

    /// Validates a 4-byte little-endian header and returns the body length
    /// (type byte plus payload) that follows it.
    pub fn body_len(header: [u8; 4]) -> Result<usize, DecodeError> {
        let len = u32::from_le_bytes(header);
        if len > MAX_FRAME_LEN {
            return Err(DecodeError::LengthTooLarge(len));
        }
        if len == 0 {
            return Err(DecodeError::InvalidLength(len));
        }
        Ok(len as usize)
    }

    /// Builds a frame from a body previously sized by [`Frame::body_len`].
    pub fn from_body(mut body: Vec<u8>) -> Result<Self, DecodeError> {
        if body.is_empty() {
            return Err(DecodeError::InvalidLength(0));
        }
        let payload = body.split_off(1);
        Ok(Frame {
            typ: body[0],
            payload,
        })
    }

    pub fn expect_type(&self, expected: u8) -> Result<&[u8], DecodeError> {
        if self.typ != expected {
            return Err(DecodeError::UnexpectedType {
                expected,
                actual: self.typ,
            });
        }
        Ok(&self.payload)
    }
}

pub fn encode_frame(typ: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() + 1;
    debug_assert!(len <= MAX_FRAME_LEN as usize, "frame payload too large");
    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_le_bytes());
    out.push(typ);
    out.extend_from_slice(payload);
    out
}
