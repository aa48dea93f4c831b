// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pending-acknowledgment tables pairing in-flight exchanges with their acks.
//!
//! Each queue serves one role in the protocol (outbound QoS 1, outbound QoS 2,
//! inbound QoS 2, subscribe, unsubscribe, ping) and enforces the legal
//! acknowledgment progression for that role. Entries keep the raw encoded
//! frames so completion handling can decode them lazily.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use bytes::Bytes;
use thiserror::Error;

use crate::control_packet::{self, CodecError, Packet, PacketType};

/// Callback fired when a pending exchange reaches its terminal acknowledgment.
///
/// Invoked with the originally registered message and the final ack, decoded
/// from the stored frames. Errors returned here are logged and discarded.
pub type OnComplete = Box<dyn FnOnce(Packet, Packet) -> anyhow::Result<()> + Send>;

/// Error raised by [`AckQueue`] operations.
#[derive(Error, Debug)]
pub enum AckQueueError {
    /// A pending exchange already exists for this packet identifier.
    #[error("packet identifier {0} already has a pending exchange")]
    DuplicatePacketId(u16),
    /// No pending exchange matches this packet identifier.
    #[error("no pending exchange for packet identifier {0}")]
    NoSuchPacketId(u16),
    /// The acknowledgment kind does not follow a legal transition.
    #[error("unexpected {got:?} for pending {mtype:?} awaiting {expected:?} (pkid {pkid})")]
    BadAckType {
        /// Packet identifier of the pending exchange
        pkid: u16,
        /// Kind of the registered message
        mtype: PacketType,
        /// Acknowledgment kind the exchange is waiting for
        expected: PacketType,
        /// Acknowledgment kind that was offered
        got: PacketType,
    },
    /// The message kind cannot be awaited on a queue of this role.
    #[error("packet kind {0:?} cannot wait for acknowledgment on this queue")]
    UnexpectedMessage(PacketType),
    /// The message or acknowledgment could not be encoded for storage.
    #[error("encode failed: {0}")]
    Encode(CodecError),
}

impl From<CodecError> for AckQueueError {
    fn from(err: CodecError) -> Self {
        AckQueueError::Encode(err)
    }
}

/// The protocol role an [`AckQueue`] serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRole {
    /// Outbound QoS 1 publishes waiting for PUBACK
    PublishQos1,
    /// Outbound QoS 2 publishes: PUBREC, then PUBCOMP after PUBREL is sent
    PublishQos2Out,
    /// Inbound QoS 2 publishes waiting for PUBREL
    PublishQos2In,
    /// SUBSCRIBE waiting for SUBACK
    Subscribe,
    /// UNSUBSCRIBE waiting for UNSUBACK
    Unsubscribe,
    /// PINGREQ waiting for PINGRESP
    Ping,
}

impl AckRole {
    /// The acknowledgment a newly registered message waits for, or `None` if
    /// the message kind does not belong on this queue.
    fn initial_expectation(self, mtype: PacketType) -> Option<PacketType> {
        match (self, mtype) {
            (Self::PublishQos1, PacketType::Publish) => Some(PacketType::PubAck),
            (Self::PublishQos2Out, PacketType::Publish) => Some(PacketType::PubRec),
            (Self::PublishQos2In, PacketType::Publish) => Some(PacketType::PubRel),
            (Self::Subscribe, PacketType::Subscribe) => Some(PacketType::SubAck),
            (Self::Unsubscribe, PacketType::Unsubscribe) => Some(PacketType::UnsubAck),
            (Self::Ping, PacketType::PingReq) => Some(PacketType::PingResp),
            _ => None,
        }
    }

    /// The acknowledgment that follows a satisfied one, or `None` when the
    /// exchange is terminal.
    fn next_expectation(self, satisfied: PacketType) -> Option<PacketType> {
        match (self, satisfied) {
            (Self::PublishQos2Out, PacketType::PubRec) => Some(PacketType::PubComp),
            _ => None,
        }
    }
}

/// A registered exchange waiting for its acknowledgment(s).
pub struct PendingAck {
    /// Kind of the message that opened the exchange
    pub mtype: PacketType,
    /// Raw encoded form of that message
    pub msgbuf: Bytes,
    /// Acknowledgment the exchange is currently waiting for; once the
    /// exchange is terminal, the final acknowledgment kind
    pub state: PacketType,
    /// Raw encoded form of the most recent acknowledgment
    pub ackbuf: Bytes,
    /// Callback to fire when the exchange completes
    pub on_complete: Option<OnComplete>,
}

impl fmt::Debug for PendingAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAck")
            .field("mtype", &self.mtype)
            .field("state", &self.state)
            .field("msgbuf", &self.msgbuf.len())
            .field("ackbuf", &self.ackbuf.len())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Inner {
    /// In-flight exchanges keyed by packet identifier
    pending: HashMap<u16, PendingAck>,
    /// Terminal exchanges in the order they completed
    acked: Vec<PendingAck>,
}

/// Table of in-flight exchanges for one protocol role.
///
/// Internally locked: the dispatcher and the code injecting outgoing packets
/// share these queues.
pub struct AckQueue {
    role: AckRole,
    inner: Mutex<Inner>,
}

impl AckQueue {
    /// Create an empty queue for the given role.
    #[must_use]
    pub fn new(role: AckRole) -> Self {
        Self {
            role,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The protocol role this queue serves.
    #[must_use]
    pub fn role(&self) -> AckRole {
        self.role
    }

    /// Register a new pending exchange for `msg`.
    ///
    /// The message is stored in encoded form together with `on_complete`.
    /// Ping exchanges carry no identifier on the wire and register under
    /// pkid 0.
    ///
    /// # Errors
    /// * [`AckQueueError::DuplicatePacketId`] if the pkid is already pending
    /// * [`AckQueueError::UnexpectedMessage`] if the message kind does not
    ///   belong on this queue
    /// * [`AckQueueError::Encode`] if the message cannot be encoded
    pub fn wait(&self, msg: &Packet, on_complete: Option<OnComplete>) -> Result<(), AckQueueError> {
        let mtype = control_packet::packet_type(msg);
        let state = self
            .role
            .initial_expectation(mtype)
            .ok_or(AckQueueError::UnexpectedMessage(mtype))?;
        let pkid = control_packet::pkid(msg);
        let msgbuf = control_packet::encode_to_bytes(msg)?;

        let mut inner = self.inner.lock().unwrap();
        if inner.pending.contains_key(&pkid) {
            return Err(AckQueueError::DuplicatePacketId(pkid));
        }
        inner.pending.insert(
            pkid,
            PendingAck {
                mtype,
                msgbuf,
                state,
                ackbuf: Bytes::new(),
                on_complete,
            },
        );
        Ok(())
    }

    /// Record an acknowledgment against the pending exchange it identifies.
    ///
    /// Terminal exchanges move to the completed list served by
    /// [`AckQueue::drain_acked`]; the outbound QoS 2 machine instead advances
    /// from PUBREC to awaiting PUBCOMP.
    ///
    /// # Errors
    /// * [`AckQueueError::NoSuchPacketId`] if no exchange matches; no state
    ///   is changed
    /// * [`AckQueueError::BadAckType`] if the kind does not follow a legal
    ///   transition
    /// * [`AckQueueError::Encode`] if the acknowledgment cannot be encoded
    pub fn ack(&self, ack: &Packet) -> Result<(), AckQueueError> {
        let got = control_packet::packet_type(ack);
        let pkid = control_packet::pkid(ack);
        let ackbuf = control_packet::encode_to_bytes(ack)?;

        let mut inner = self.inner.lock().unwrap();
        {
            let entry = inner
                .pending
                .get_mut(&pkid)
                .ok_or(AckQueueError::NoSuchPacketId(pkid))?;
            if got != entry.state {
                return Err(AckQueueError::BadAckType {
                    pkid,
                    mtype: entry.mtype,
                    expected: entry.state,
                    got,
                });
            }
            entry.ackbuf = ackbuf;
            if let Some(next) = self.role.next_expectation(got) {
                entry.state = next;
                return Ok(());
            }
        }
        if let Some(done) = inner.pending.remove(&pkid) {
            inner.acked.push(done);
        }
        Ok(())
    }

    /// Drain all exchanges that have reached terminal status, in the order
    /// they completed.
    #[must_use]
    pub fn drain_acked(&self) -> Vec<PendingAck> {
        std::mem::take(&mut self.inner.lock().unwrap().acked)
    }

    /// Returns true if an exchange is pending under this packet identifier.
    #[must_use]
    pub fn contains(&self, pkid: u16) -> bool {
        self.inner.lock().unwrap().pending.contains_key(&pkid)
    }

    /// Number of in-flight (not yet terminal) exchanges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Returns true if no exchanges are in flight or awaiting drain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.pending.is_empty() && inner.acked.is_empty()
    }
}

impl fmt::Debug for AckQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("AckQueue")
            .field("role", &self.role)
            .field("pending", &inner.pending.len())
            .field("acked", &inner.acked.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_packet::{PubAck, PubComp, PubRec, PubRel, Publish, QoS};

    fn publish(pkid: u16, qos: QoS) -> Packet {
        let mut publish = Publish::new("a/b", qos, &b"x"[..]);
        publish.pkid = pkid;
        Packet::Publish(publish)
    }

    #[test]
    fn qos1_publish_completes_on_puback() {
        let queue = AckQueue::new(AckRole::PublishQos1);
        queue.wait(&publish(7, QoS::AtLeastOnce), None).unwrap();
        assert!(queue.contains(7));
        assert!(queue.drain_acked().is_empty());

        queue.ack(&Packet::PubAck(PubAck::new(7))).unwrap();
        assert!(!queue.contains(7));

        let drained = queue.drain_acked();
        assert_eq!(drained.len(), 1);
        let entry = &drained[0];
        assert_eq!(entry.mtype, PacketType::Publish);
        assert_eq!(entry.state, PacketType::PubAck);
        assert_eq!(
            control_packet::decode(&entry.msgbuf, 1024).unwrap(),
            publish(7, QoS::AtLeastOnce)
        );
        assert_eq!(
            control_packet::decode(&entry.ackbuf, 1024).unwrap(),
            Packet::PubAck(PubAck::new(7))
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn qos2_outbound_walks_pubrec_then_pubcomp() {
        let queue = AckQueue::new(AckRole::PublishQos2Out);
        queue.wait(&publish(9, QoS::ExactlyOnce), None).unwrap();

        // PUBCOMP before PUBREC is illegal
        assert!(matches!(
            queue.ack(&Packet::PubComp(PubComp::new(9))),
            Err(AckQueueError::BadAckType {
                pkid: 9,
                expected: PacketType::PubRec,
                got: PacketType::PubComp,
                ..
            })
        ));

        // PUBREC advances the machine but is not terminal
        queue.ack(&Packet::PubRec(PubRec::new(9))).unwrap();
        assert!(queue.contains(9));
        assert!(queue.drain_acked().is_empty());

        // A second PUBREC no longer matches the expectation
        assert!(matches!(
            queue.ack(&Packet::PubRec(PubRec::new(9))),
            Err(AckQueueError::BadAckType {
                expected: PacketType::PubComp,
                ..
            })
        ));

        queue.ack(&Packet::PubComp(PubComp::new(9))).unwrap();
        let drained = queue.drain_acked();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].state, PacketType::PubComp);
        assert_eq!(
            control_packet::decode(&drained[0].ackbuf, 1024).unwrap(),
            Packet::PubComp(PubComp::new(9))
        );
    }

    #[test]
    fn qos2_inbound_waits_for_pubrel() {
        let queue = AckQueue::new(AckRole::PublishQos2In);
        queue.wait(&publish(5, QoS::ExactlyOnce), None).unwrap();
        queue.ack(&Packet::PubRel(PubRel::new(5))).unwrap();

        let drained = queue.drain_acked();
        assert_eq!(drained.len(), 1);
        assert_eq!(
            control_packet::decode(&drained[0].msgbuf, 1024).unwrap(),
            publish(5, QoS::ExactlyOnce)
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn duplicate_packet_id_is_rejected() {
        let queue = AckQueue::new(AckRole::PublishQos1);
        queue.wait(&publish(3, QoS::AtLeastOnce), None).unwrap();
        assert!(matches!(
            queue.wait(&publish(3, QoS::AtLeastOnce), None),
            Err(AckQueueError::DuplicatePacketId(3))
        ));
    }

    #[test]
    fn ack_for_unknown_packet_id_has_no_side_effect() {
        let queue = AckQueue::new(AckRole::PublishQos1);
        queue.wait(&publish(3, QoS::AtLeastOnce), None).unwrap();
        assert!(matches!(
            queue.ack(&Packet::PubAck(PubAck::new(4))),
            Err(AckQueueError::NoSuchPacketId(4))
        ));
        assert!(queue.contains(3));
        assert!(queue.drain_acked().is_empty());
    }

    #[test]
    fn message_kind_must_match_the_queue_role() {
        let queue = AckQueue::new(AckRole::Subscribe);
        assert!(matches!(
            queue.wait(&publish(1, QoS::AtLeastOnce), None),
            Err(AckQueueError::UnexpectedMessage(PacketType::Publish))
        ));
    }

    #[test]
    fn drain_returns_entries_in_completion_order() {
        let queue = AckQueue::new(AckRole::PublishQos1);
        for pkid in [1, 2, 3] {
            queue.wait(&publish(pkid, QoS::AtLeastOnce), None).unwrap();
        }
        for pkid in [2, 3, 1] {
            queue.ack(&Packet::PubAck(PubAck::new(pkid))).unwrap();
        }
        let order: Vec<u16> = queue
            .drain_acked()
            .iter()
            .map(|entry| {
                control_packet::pkid(&control_packet::decode(&entry.msgbuf, 1024).unwrap())
            })
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn ping_exchange_registers_under_pkid_zero() {
        let queue = AckQueue::new(AckRole::Ping);
        queue.wait(&Packet::PingReq, None).unwrap();
        // Only one ping may be in flight
        assert!(matches!(
            queue.wait(&Packet::PingReq, None),
            Err(AckQueueError::DuplicatePacketId(0))
        ));
        queue.ack(&Packet::PingResp).unwrap();
        assert_eq!(queue.drain_acked().len(), 1);
        queue.wait(&Packet::PingReq, None).unwrap();
    }

    #[test]
    fn completion_callback_survives_the_exchange() {
        let queue = AckQueue::new(AckRole::PublishQos1);
        queue
            .wait(
                &publish(8, QoS::AtLeastOnce),
                Some(Box::new(|msg, ack| {
                    assert_eq!(control_packet::pkid(&msg), 8);
                    assert_eq!(control_packet::packet_type(&ack), PacketType::PubAck);
                    Ok(())
                })),
            )
            .unwrap();
        queue.ack(&Packet::PubAck(PubAck::new(8))).unwrap();

        let mut drained = queue.drain_acked();
        let entry = drained.pop().unwrap();
        let msg = control_packet::decode(&entry.msgbuf, 1024).unwrap();
        let ack = control_packet::decode(&entry.ackbuf, 1024).unwrap();
        entry.on_complete.unwrap()(msg, ack).unwrap();
    }
}
