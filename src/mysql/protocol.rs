//! MySQL wire protocol constants and packet header encoding.
//!
//! Every physical packet on the wire starts with a 4 byte header:
//!
//! ```text
//! [len0][len1][len2][seq]  payload...
//! ```
//!
//! `len` is a 24-bit little-endian payload length and `seq` the sequence
//! id. Reference: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html

use bytes::BufMut;

// ============================================================================
// Protocol Constants
// ============================================================================

/// Size of the packet header (3 bytes length + 1 byte sequence id).
pub const HEADER_LEN: usize = 4;

/// Largest payload a single physical packet can carry.
pub const MAX_PAYLOAD_LEN: usize = 0x00ff_ffff;

/// Charset every pooled connection is reset to before reuse.
pub const DEFAULT_CHARSET: &str = "utf8";

/// Pool capacity used when none is configured.
pub const DEFAULT_MAX_CONN_NUM: usize = 10000;

/// Eagerly established connections for the default capacity, and the
/// capacity below which every slot is established eagerly.
pub const INIT_CONN_COUNT: usize = 16;

/// Command bytes
pub const COM_QUERY: u8 = 0x03;
pub const COM_PING: u8 = 0x0e;

/// First payload byte of an OK response.
pub const OK_HEADER: u8 = 0x00;

// ============================================================================
// Header Encoding
// ============================================================================

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub payload_len: usize,
    pub sequence: u8,
}

impl PacketHeader {
    pub fn new(payload_len: usize, sequence: u8) -> Self {
        Self {
            payload_len,
            sequence,
        }
    }

    /// Decode a header from its 4 raw bytes.
    pub fn decode(raw: [u8; HEADER_LEN]) -> Self {
        Self {
            payload_len: read_u24_le(&raw[..3]),
            sequence: raw[3],
        }
    }

    /// Encode into 4 raw bytes. Lengths above `MAX_PAYLOAD_LEN` are truncated
    /// to 24 bits, callers split before encoding.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let len = self.payload_len as u32;
        [len as u8, (len >> 8) as u8, (len >> 16) as u8, self.sequence]
    }

    /// Write the header into the first 4 bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[..HEADER_LEN].copy_from_slice(&self.encode());
    }

    /// Append the header to a growable buffer.
    pub fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.encode());
    }
}

/// Read a 24-bit little-endian integer from the first 3 bytes of `raw`.
pub fn read_u24_le(raw: &[u8]) -> usize {
    raw[0] as usize | (raw[1] as usize) << 8 | (raw[2] as usize) << 16
}

/// Physical frame payload lengths a logical message of `payload_len` bytes
/// is split into.
///
/// The last entry is always strictly below `MAX_PAYLOAD_LEN`, so an exact
/// multiple of `MAX_PAYLOAD_LEN` ends with an empty frame.
pub fn frame_lengths(payload_len: usize) -> Vec<usize> {
    let mut frames = vec![MAX_PAYLOAD_LEN; payload_len / MAX_PAYLOAD_LEN];
    frames.push(payload_len % MAX_PAYLOAD_LEN);
    frames
}
