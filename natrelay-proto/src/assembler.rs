use bytes::Bytes;
use serde_json::Value;

/// A single unterminated frame larger than this is flushed as opaque bytes
/// rather than buffered further.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One unit of the backend protocol, carved out of a byte stream.
///
/// `raw` always holds the exact bytes received, including surrounding
/// whitespace, so forwarding a frame never alters the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolFrame {
    Json { raw: Bytes, value: Value },
    Opaque(Bytes),
    /// Whitespace that arrived after the previous frame and finishes it.
    /// It belongs wherever that frame went.
    Continuation(Bytes),
}

impl ProtocolFrame {
    pub fn raw(&self) -> &Bytes {
        match self {
            ProtocolFrame::Json { raw, .. } => raw,
            ProtocolFrame::Opaque(raw) | ProtocolFrame::Continuation(raw) => raw,
        }
    }

    pub fn into_raw(self) -> Bytes {
        match self {
            ProtocolFrame::Json { raw, .. } => raw,
            ProtocolFrame::Opaque(raw) | ProtocolFrame::Continuation(raw) => raw,
        }
    }

    pub fn json(&self) -> Option<&Value> {
        match self {
            ProtocolFrame::Json { value, .. } => Some(value),
            ProtocolFrame::Opaque(_) | ProtocolFrame::Continuation(_) => None,
        }
    }
}

/// Incremental splitter for a stream of JSON messages.
///
/// Messages may be newline-delimited or simply concatenated. Bytes that do
/// not start a JSON object or array, or that fail to parse, are emitted as
/// opaque frames running up to the next newline so the stream keeps moving.
///
/// A frame carries the whitespace after it up to and including the first
/// newline. When that newline has not arrived yet, the whitespace that
/// follows later comes out as a [`ProtocolFrame::Continuation`].
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
    read_idx: usize,
    /// The last frame emitted has not seen its newline.
    open_tail: bool,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            read_idx: 0,
            open_tail: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Option<ProtocolFrame> {
        let pending = &self.buf[self.read_idx..];
        if self.open_tail && pending.first().is_some_and(u8::is_ascii_whitespace) {
            let len = tail_len(pending);
            let raw = Bytes::copy_from_slice(&pending[..len]);
            self.open_tail = !raw.ends_with(b"\n");
            self.consume(len);
            return Some(ProtocolFrame::Continuation(raw));
        }
        // Whitespace between finished frames is held back and becomes the
        // prefix of the next frame.
        let start = pending.iter().position(|b| !b.is_ascii_whitespace())?;

        if !matches!(pending[start], b'{' | b'[') {
            let end = line_end(pending, start);
            return Some(self.take_opaque(end));
        }

        match parse_value(&pending[start..]) {
            Parsed::Complete(value, len) => {
                let end = start + len;
                let end = end + tail_len(&pending[end..]);
                let raw = Bytes::copy_from_slice(&pending[..end]);
                self.open_tail = !raw.ends_with(b"\n");
                self.consume(end);
                Some(ProtocolFrame::Json { raw, value })
            }
            Parsed::Incomplete if pending.len() > MAX_FRAME_LEN => {
                log::warn!(
                    "unterminated frame exceeds {} bytes; passing it through",
                    MAX_FRAME_LEN
                );
                let end = pending.len();
                Some(self.take_opaque(end))
            }
            Parsed::Incomplete => None,
            Parsed::Invalid => {
                let end = line_end(pending, start);
                Some(self.take_opaque(end))
            }
        }
    }

    /// Emits whatever is still buffered as an opaque frame.
    pub fn flush(&mut self) -> Option<ProtocolFrame> {
        let remaining = self.buffered_len();
        if remaining == 0 {
            return None;
        }
        Some(self.take_opaque(remaining))
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len() - self.read_idx
    }

    fn take_opaque(&mut self, len: usize) -> ProtocolFrame {
        let raw = Bytes::copy_from_slice(&self.buf[self.read_idx..self.read_idx + len]);
        self.open_tail = !raw.ends_with(b"\n");
        self.consume(len);
        ProtocolFrame::Opaque(raw)
    }

    fn consume(&mut self, len: usize) {
        self.read_idx += len;
        if self.read_idx == self.buf.len() {
            self.buf.clear();
            self.read_idx = 0;
        } else if self.read_idx > 64 * 1024 {
            self.buf.drain(0..self.read_idx);
            self.read_idx = 0;
        }
    }
}

enum Parsed {
    Complete(Value, usize),
    Incomplete,
    Invalid,
}

fn parse_value(bytes: &[u8]) -> Parsed {
    let mut stream = serde_json::Deserializer::from_slice(bytes).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Parsed::Complete(value, stream.byte_offset()),
        Some(Err(err)) if err.is_eof() => Parsed::Incomplete,
        Some(Err(_)) => Parsed::Invalid,
        None => Parsed::Incomplete,
    }
}

/// Leading whitespace of `bytes` up to and including the first newline.
fn tail_len(bytes: &[u8]) -> usize {
    let mut len = 0;
    for b in bytes {
        if !b.is_ascii_whitespace() {
            break;
        }
        len += 1;
        if *b == b'\n' {
            break;
        }
    }
    len
}

/// Offset just past the first newline at or after `from`, or the end of `bytes`.
fn line_end(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|b| *b == b'\n')
        .map(|pos| from + pos + 1)
        .unwrap_or(bytes.len())
}
