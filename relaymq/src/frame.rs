// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Two-phase framing over the inbound byte stream.
//!
//! [`FrameReader`] buffers raw bytes and lets the dispatcher peek a complete
//! control packet without consuming it. The bytes stay in the buffer until
//! [`FrameReader::read_commit`] advances the cursor, so a decode failure never
//! corrupts the framing of subsequent packets.

use std::io;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::control_packet::{self, CodecError, Packet, PacketType};

/// Error raised while framing or decoding the inbound stream.
#[derive(Error, Debug)]
pub enum FrameError {
    /// More bytes are required before the request can be satisfied.
    /// The caller should wait for the transport and retry.
    #[error("incomplete frame, more bytes required")]
    ShortRead,
    /// The remaining-length field uses more than four bytes.
    #[error("malformed remaining length encoding")]
    MalformedLength,
    /// The first header byte does not name a control packet.
    #[error("invalid control packet kind: 0x{0:02x}")]
    InvalidPacketKind(u8),
    /// The advertised frame exceeds the maximum packet size.
    #[error("frame of {0} bytes exceeds the maximum packet size")]
    PacketTooLarge(usize),
    /// The frame was complete but the codec rejected its contents.
    #[error("codec rejected frame: {0}")]
    Codec(CodecError),
    /// The transport read failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The stream is closed and fully drained. Terminal.
    #[error("end of stream")]
    Eof,
}

impl From<CodecError> for FrameError {
    fn from(err: CodecError) -> Self {
        FrameError::Codec(err)
    }
}

/// Buffered reader exposing peek/commit access to framed control packets.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    closed: bool,
    max_packet_size: usize,
    read_chunk_size: usize,
}

impl FrameReader {
    /// Create an empty reader.
    ///
    /// # Arguments
    /// * `max_packet_size` - Upper bound on the remaining-length of any frame
    /// * `read_chunk_size` - Capacity reserved ahead of each transport read
    #[must_use]
    pub fn new(max_packet_size: usize, read_chunk_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(read_chunk_size),
            closed: false,
            max_packet_size,
            read_chunk_size,
        }
    }

    /// Append raw bytes received from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Mark the stream as closed. Buffered bytes remain readable.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Returns true if the stream has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of buffered bytes not yet committed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if no uncommitted bytes remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns true if the stream is closed and fully drained.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.closed && self.buf.is_empty()
    }

    /// Read more bytes from the transport into the buffer.
    ///
    /// A zero-length read closes the reader. Returns the number of bytes read.
    ///
    /// # Errors
    /// Propagates transport I/O errors.
    pub async fn fill_from<R>(&mut self, transport: &mut R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        self.buf.reserve(self.read_chunk_size);
        let n = transport.read_buf(&mut self.buf).await?;
        if n == 0 {
            self.closed = true;
        }
        Ok(n)
    }

    /// Inspect the fixed header of the next frame without consuming it.
    ///
    /// Returns the packet kind and the total frame length (fixed header plus
    /// remaining length).
    ///
    /// # Errors
    /// * [`FrameError::ShortRead`] if the header is not fully buffered yet
    /// * [`FrameError::Eof`] if the stream is closed and drained
    /// * [`FrameError::MalformedLength`] if the length continuation exceeds
    ///   four bytes
    /// * [`FrameError::InvalidPacketKind`] / [`FrameError::PacketTooLarge`]
    ///   for unusable headers
    pub fn peek_message_size(&self) -> Result<(PacketType, usize), FrameError> {
        if self.buf.is_empty() {
            return Err(if self.closed {
                FrameError::Eof
            } else {
                FrameError::ShortRead
            });
        }
        let kind = packet_type_from_byte(self.buf[0])?;

        let mut remaining_len: usize = 0;
        let mut shift = 0;
        let mut header_len = 1;
        loop {
            let Some(&byte) = self.buf.get(header_len) else {
                return Err(FrameError::ShortRead);
            };
            header_len += 1;
            remaining_len |= usize::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            // The remaining length field is one to four bytes (2.2.3)
            if shift > 21 {
                return Err(FrameError::MalformedLength);
            }
        }
        if remaining_len > self.max_packet_size {
            return Err(FrameError::PacketTooLarge(remaining_len));
        }
        Ok((kind, header_len + remaining_len))
    }

    /// Decode the next frame without consuming it.
    ///
    /// `total_len` comes from [`FrameReader::peek_message_size`]. The frame
    /// bytes stay buffered until [`FrameReader::read_commit`].
    ///
    /// # Errors
    /// * [`FrameError::ShortRead`] if fewer than `total_len` bytes are buffered
    /// * [`FrameError::Codec`] if the codec rejects the frame contents
    pub fn peek_message(&self, total_len: usize) -> Result<(Packet, usize), FrameError> {
        if self.buf.len() < total_len {
            return Err(FrameError::ShortRead);
        }
        let packet = control_packet::decode(&self.buf[..total_len], self.max_packet_size)?;
        Ok((packet, total_len))
    }

    /// Advance the read cursor past `n` committed bytes.
    ///
    /// # Errors
    /// * [`FrameError::Eof`] if the reader is closed and drained
    /// * [`FrameError::ShortRead`] if fewer than `n` bytes are buffered
    pub fn read_commit(&mut self, n: usize) -> Result<(), FrameError> {
        if self.buf.len() < n {
            return Err(if self.is_done() {
                FrameError::Eof
            } else {
                FrameError::ShortRead
            });
        }
        self.buf.advance(n);
        Ok(())
    }
}

/// Map the first fixed-header byte to a packet kind.
fn packet_type_from_byte(byte: u8) -> Result<PacketType, FrameError> {
    match byte >> 4 {
        1 => Ok(PacketType::Connect),
        2 => Ok(PacketType::ConnAck),
        3 => Ok(PacketType::Publish),
        4 => Ok(PacketType::PubAck),
        5 => Ok(PacketType::PubRec),
        6 => Ok(PacketType::PubRel),
        7 => Ok(PacketType::PubComp),
        8 => Ok(PacketType::Subscribe),
        9 => Ok(PacketType::SubAck),
        10 => Ok(PacketType::Unsubscribe),
        11 => Ok(PacketType::UnsubAck),
        12 => Ok(PacketType::PingReq),
        13 => Ok(PacketType::PingResp),
        14 => Ok(PacketType::Disconnect),
        _ => Err(FrameError::InvalidPacketKind(byte)),
    }
}
