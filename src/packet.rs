//! Wire framing for media payloads exchanged with the SFU WebSocket
//! adapters.
//!
//! Every frame is self-contained: a 32-bit sequence number, a 32-bit
//! timestamp, and a length-prefixed opaque payload, all big-endian. This
//! module is the only place the framing is produced or parsed.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed header size: sequence (4) + timestamp (4) + payload length (4).
pub const HEADER_LEN: usize = 12;

/// A decoded media frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u32,
    pub timestamp: u32,
    /// Freshly copied payload, never a view into the incoming frame.
    pub payload: Bytes,
}

/// Encode a frame. The payload is copied into the output buffer, so the
/// caller's slice may be reused immediately.
pub fn encode(sequence: u32, timestamp: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(sequence);
    buf.put_u32(timestamp);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode a frame. Returns a fresh payload copy; a terminal odd byte is
/// dropped so downstream PCM handling always sees whole 16-bit samples.
pub fn decode(frame: &[u8]) -> Result<Packet> {
    if frame.len() < HEADER_LEN {
        return Err(Error::BadPayload(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let mut cursor = frame;
    let sequence = cursor.get_u32();
    let timestamp = cursor.get_u32();
    let declared = cursor.get_u32() as usize;
    if cursor.remaining() < declared {
        return Err(Error::BadPayload(format!(
            "truncated payload: declared {} bytes, got {}",
            declared,
            cursor.remaining()
        )));
    }
    let mut len = declared;
    if len % 2 != 0 {
        eprintln!("[PacketCodec] Dropping terminal odd byte ({} byte payload)", len);
        len -= 1;
    }
    Ok(Packet {
        sequence,
        timestamp,
        payload: Bytes::copy_from_slice(&cursor[..len]),
    })
}
