//! Frame encoding and streaming decode.

use std::io::Read;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use serde::de::DeserializeOwned;

use crate::error::{FrameError, Result};

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Protocol version written into every outgoing frame.
pub const VERSION: u32 = 1;

/// Operation codes.
pub mod op {
    /// Client heartbeat.
    pub const HEARTBEAT: u32 = 2;
    /// Server heartbeat reply.
    pub const HEARTBEAT_REPLY: u32 = 3;
    /// Server event notification.
    pub const EVENT: u32 = 5;
    /// Client join request.
    pub const JOIN: u32 = 7;
    /// Server welcome (join acknowledged).
    pub const WELCOME: u32 = 8;
}

/// Payload protocols.
pub mod proto {
    /// Payload is a JSON document.
    pub const JSON: u16 = 0;
    /// Payload is a 4-byte big-endian integer.
    pub const INT: u16 = 1;
    /// Payload is zlib-compressed outer frames.
    pub const COMPRESSED: u16 = 2;
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub protocol: u16,
    pub operation: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Deserialize a [`proto::JSON`] payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Read a [`proto::INT`] payload.
    pub fn as_u32(&self) -> Result<u32> {
        if self.payload.len() != 4 {
            return Err(FrameError::BadIntPayload(self.payload.len()));
        }
        Ok(BigEndian::read_u32(&self.payload))
    }
}

/// Encode a single frame.
pub fn encode(operation: u32, protocol: u16, payload: &[u8]) -> Bytes {
    let total_len = HEADER_LEN + payload.len();
    let mut out = BytesMut::with_capacity(total_len);
    out.extend_from_slice(&(total_len as u32).to_be_bytes());
    out.extend_from_slice(&(HEADER_LEN as u16).to_be_bytes());
    out.extend_from_slice(&protocol.to_be_bytes());
    out.extend_from_slice(&operation.to_be_bytes());
    out.extend_from_slice(&VERSION.to_be_bytes());
    out.extend_from_slice(payload);
    out.freeze()
}

/// Streaming frame decoder.
///
/// Bytes read from the socket are appended with [`FrameBuffer::extend`];
/// complete frames are drained with [`FrameBuffer::next_frame`]. Frames
/// carrying [`proto::COMPRESSED`] payloads are decompressed and their
/// contents spliced back onto the *front* of the buffer, so callers only
/// ever observe plain frames. Splice-back is idempotent: nested compressed
/// frames decode the same way.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not-yet-consumed bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drain the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }

            let total_len = BigEndian::read_u32(&self.buf[0..4]) as usize;
            let header_len = BigEndian::read_u16(&self.buf[4..6]);
            if header_len as usize != HEADER_LEN {
                return Err(FrameError::BadHeaderLen(header_len));
            }
            if total_len < HEADER_LEN {
                return Err(FrameError::TruncatedHeader {
                    total_len,
                    header_len: HEADER_LEN,
                });
            }
            if self.buf.len() < total_len {
                return Ok(None);
            }

            let protocol = BigEndian::read_u16(&self.buf[6..8]);
            let operation = BigEndian::read_u32(&self.buf[8..12]);

            let frame_bytes = self.buf.split_to(total_len);
            let payload = &frame_bytes[HEADER_LEN..];

            if protocol == proto::COMPRESSED {
                let inner = decompress(payload)?;
                self.splice_front(&inner);
                continue;
            }

            return Ok(Some(Frame {
                protocol,
                operation,
                payload: Bytes::copy_from_slice(payload),
            }));
        }
    }

    fn splice_front(&mut self, bytes: &[u8]) {
        let tail = self.buf.split();
        self.buf.reserve(bytes.len() + tail.len());
        self.buf.extend_from_slice(bytes);
        self.buf.extend_from_slice(&tail);
    }
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
