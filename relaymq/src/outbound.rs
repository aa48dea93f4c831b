// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Outbound write path shared by the dispatcher and the injection surface.
//!
//! Replies and deliveries are queued as decoded packets on an unbounded
//! channel; a single writer task encodes and flushes them, so wire order is
//! exactly send order.

use std::io;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::control_packet::{self, CodecError, Packet};

/// Error raised on the outbound write path.
#[derive(Error, Debug)]
pub enum WriteError {
    /// The writer task has gone; nothing further can be sent.
    #[error("outbound channel closed")]
    ChannelClosed,
    /// The codec refused to encode the packet.
    #[error("encode failed: {0}")]
    Codec(CodecError),
    /// The transport write failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<CodecError> for WriteError {
    fn from(err: CodecError) -> Self {
        WriteError::Codec(err)
    }
}

/// Sending half of the outbound queue.
#[derive(Clone, Debug)]
pub struct PacketTx {
    tx: mpsc::UnboundedSender<Packet>,
}

impl PacketTx {
    /// Queue a packet for the writer.
    ///
    /// # Errors
    /// [`WriteError::ChannelClosed`] if the writer has gone.
    pub fn send(&self, packet: Packet) -> Result<(), WriteError> {
        self.tx.send(packet).map_err(|_| WriteError::ChannelClosed)
    }
}

/// Receiving half of the outbound queue, consumed by [`run_writer`].
#[derive(Debug)]
pub struct PacketRx {
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl PacketRx {
    /// Receive the next queued packet, or `None` once all senders are gone.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Receive a queued packet without waiting.
    pub fn try_recv(&mut self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }
}

/// Create a connected outbound queue.
#[must_use]
pub fn channel() -> (PacketTx, PacketRx) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PacketTx { tx }, PacketRx { rx })
}

/// Drain the outbound queue onto the transport until all senders are gone.
///
/// # Errors
/// Returns a [`WriteError`] if encoding or the transport write fails; queued
/// packets behind the failure are dropped.
pub async fn run_writer<W>(mut rx: PacketRx, mut sink: W) -> Result<(), WriteError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    while let Some(packet) = rx.recv().await {
        buf.clear();
        control_packet::encode(&packet, &mut buf)?;
        sink.write_all(&buf).await?;
        sink.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_packet::{PacketType, PubAck, Publish, QoS};
    use crate::frame::FrameReader;

    #[tokio::test]
    async fn writer_preserves_send_order_on_the_wire() {
        let (tx, rx) = channel();
        let (server, mut client) = tokio::io::duplex(4096);
        let writer = tokio::spawn(run_writer(rx, server));

        let mut publish = Publish::new("a/b", QoS::AtLeastOnce, &b"x"[..]);
        publish.pkid = 7;
        tx.send(Packet::Publish(publish.clone())).unwrap();
        tx.send(Packet::PubAck(PubAck::new(7))).unwrap();
        drop(tx);
        writer.await.unwrap().unwrap();

        let mut reader = FrameReader::new(1024, 256);
        while !reader.is_closed() {
            reader.fill_from(&mut client).await.unwrap();
        }

        let (kind, total_len) = reader.peek_message_size().unwrap();
        assert_eq!(kind, PacketType::Publish);
        let (packet, n) = reader.peek_message(total_len).unwrap();
        assert_eq!(packet, Packet::Publish(publish));
        reader.read_commit(n).unwrap();

        let (kind, total_len) = reader.peek_message_size().unwrap();
        assert_eq!(kind, PacketType::PubAck);
        let (packet, n) = reader.peek_message(total_len).unwrap();
        assert_eq!(packet, Packet::PubAck(PubAck::new(7)));
        reader.read_commit(n).unwrap();
        assert!(reader.is_done());
    }

    #[tokio::test]
    async fn send_after_writer_gone_is_channel_closed() {
        let (tx, rx) = channel();
        drop(rx);
        assert!(matches!(
            tx.send(Packet::PingResp),
            Err(WriteError::ChannelClosed)
        ));
    }
}
