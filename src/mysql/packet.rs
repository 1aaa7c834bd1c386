//! Packet reader/writer.
//!
//! Splits logical messages into physical packets of at most
//! `MAX_PAYLOAD_LEN` bytes and reassembles them on the way back, keeping
//! the per-connection sequence id in step with the backend.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::protocol::{frame_lengths, PacketHeader, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::error::{BackendError, Result};

/// Read buffer size for the underlying stream.
const READ_BUFFER_SIZE: usize = 1024;

/// Result of [`PacketIo::read_packet_by_section`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketSection {
    /// Raw bytes read from the stream, including the trailing header when
    /// one was requested.
    pub buffer: Bytes,
    /// Header of the next packet, decoded from the last 4 bytes of
    /// `buffer`. Its `sequence` field is the next packet's flag byte.
    pub next: Option<PacketHeader>,
}

/// Framed packet I/O over a single backend stream.
///
/// Not safe for concurrent use: the sequence id is plain state owned by
/// whoever holds `&mut self`.
pub struct PacketIo<S> {
    stream: BufReader<S>,
    sequence: u8,
}

impl<S> PacketIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::with_capacity(READ_BUFFER_SIZE, stream),
            sequence: 0,
        }
    }

    /// Sequence id expected on the next packet read or written.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Reset the sequence id, done by the owner at the start of each command.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    /// Unwrap the stream. Bytes already buffered for reading are lost.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    /// Read one logical message, joining continuation packets.
    ///
    /// The first packet of a message must carry at least one byte; a
    /// continuation packet may be empty when the message length is an
    /// exact multiple of `MAX_PAYLOAD_LEN`.
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        let mut data = BytesMut::new();
        let mut first = true;

        loop {
            let header = self.read_header().await?;
            if first && header.payload_len < 1 {
                return Err(BackendError::InvalidPayloadLength(header.payload_len));
            }
            if header.sequence != self.sequence {
                return Err(BackendError::SequenceMismatch {
                    got: header.sequence,
                    expected: self.sequence,
                });
            }
            self.sequence = self.sequence.wrapping_add(1);

            let start = data.len();
            data.resize(start + header.payload_len, 0);
            self.read_exact(&mut data[start..]).await?;

            if header.payload_len < MAX_PAYLOAD_LEN {
                return Ok(data.freeze());
            }
            first = false;
        }
    }

    /// Write one logical message.
    ///
    /// `data` reserves its first 4 bytes for the header, the rest is
    /// payload. Headers of continuation packets are written in place over
    /// bytes that have already been sent, so the buffer is clobbered.
    pub async fn write_packet(&mut self, data: &mut [u8]) -> Result<()> {
        if data.len() < HEADER_LEN {
            return Err(BackendError::EmptyPacket);
        }

        let mut offset = 0;
        for len in frame_lengths(data.len() - HEADER_LEN) {
            let frame = &mut data[offset..offset + HEADER_LEN + len];
            PacketHeader::new(len, self.sequence).write_to(frame);
            self.write_all(frame).await?;
            self.sequence = self.sequence.wrapping_add(1);
            offset += len;
        }

        self.flush().await
    }

    /// Write already framed bytes as they are.
    pub async fn write_packet_direct(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(BackendError::EmptyPacket);
        }
        self.write_all(data).await?;
        self.flush().await
    }

    /// Frame `data` into `total` instead of writing it, for pipelining
    /// several messages into one write.
    ///
    /// `data` has the same layout as for [`write_packet`](Self::write_packet).
    /// With `data == None` the accumulator is only flushed (when
    /// `flush_now`) and handed back. When `flush_now` is set the whole
    /// accumulator is written after framing; the caller decides whether to
    /// clear it.
    pub async fn write_packet_batch(
        &mut self,
        mut total: BytesMut,
        data: Option<&[u8]>,
        flush_now: bool,
    ) -> Result<BytesMut> {
        let Some(data) = data else {
            if flush_now {
                self.write_all(&total).await?;
                self.flush().await?;
            }
            return Ok(total);
        };

        if data.len() < HEADER_LEN {
            return Err(BackendError::EmptyPacket);
        }

        let payload = &data[HEADER_LEN..];
        let frames = frame_lengths(payload.len());
        total.reserve(payload.len() + HEADER_LEN * frames.len());

        let mut offset = 0;
        for len in frames {
            PacketHeader::new(len, self.sequence).put(&mut total);
            total.extend_from_slice(&payload[offset..offset + len]);
            self.sequence = self.sequence.wrapping_add(1);
            offset += len;
        }

        if flush_now {
            self.write_all(&total).await?;
            self.flush().await?;
        }
        Ok(total)
    }

    /// Read exactly `length` bytes, plus the following 4 byte header when
    /// `with_header` is set. The header is decoded but the sequence id is
    /// left untouched.
    pub async fn read_packet_by_section(
        &mut self,
        length: usize,
        with_header: bool,
    ) -> Result<Option<PacketSection>> {
        if length == 0 {
            return Ok(None);
        }

        let total = if with_header { length + HEADER_LEN } else { length };
        let mut buffer = vec![0u8; total];
        self.read_exact(&mut buffer).await?;

        let next = with_header.then(|| {
            let mut raw = [0u8; HEADER_LEN];
            raw.copy_from_slice(&buffer[length..]);
            PacketHeader::decode(raw)
        });

        Ok(Some(PacketSection {
            buffer: Bytes::from(buffer),
            next,
        }))
    }

    // ------------------------------------------------------------------------
    // Stream helpers. Every transport failure is reported as BadConnection.
    // ------------------------------------------------------------------------

    async fn read_header(&mut self) -> Result<PacketHeader> {
        let mut raw = [0u8; HEADER_LEN];
        self.read_exact(&mut raw).await?;
        Ok(PacketHeader::decode(raw))
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let wanted = buf.len();
        self.stream.read_exact(buf).await.map_err(|e| {
            tracing::debug!(error = %e, wanted, "short read on backend stream");
            BackendError::BadConnection
        })?;
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).await.map_err(|e| {
            tracing::debug!(error = %e, len = buf.len(), "short write on backend stream");
            BackendError::BadConnection
        })
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await.map_err(|e| {
            tracing::debug!(error = %e, "flush failed on backend stream");
            BackendError::BadConnection
        })
    }
}
