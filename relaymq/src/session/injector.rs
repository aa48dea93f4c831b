// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Client-role injection of outgoing exchanges into a session.
//!
//! The dispatcher only consumes the inbound stream; this handle originates
//! the exchanges whose acknowledgments it later pairs (PUBACK/PUBREC/PUBCOMP,
//! SUBACK, UNSUBACK, PINGRESP). Every exchange is registered in the matching
//! ack queue before its frame is queued for the writer.

use std::sync::Arc;

use crate::control_packet::{Packet, Publish, QoS, Subscribe, SubscribeFilter, Unsubscribe};
use crate::error::ProcessorError;
use crate::outbound::PacketTx;
use crate::session::ack_queue::OnComplete;
use crate::session::Session;

/// Clonable handle for originating outgoing exchanges on a session.
///
/// Obtained from [`Processor::injector`](crate::session::Processor::injector).
/// Shares the session's ack queues with the dispatcher, which drives the
/// completions when the matching acknowledgments arrive.
#[derive(Clone)]
pub struct Injector {
    session: Arc<Session>,
    outbound: PacketTx,
}

impl Injector {
    pub(crate) fn new(session: Arc<Session>, outbound: PacketTx) -> Self {
        Self { session, outbound }
    }

    /// Publish an application message to this session's peer.
    ///
    /// Returns the assigned packet identifier (0 for QoS 0). `on_complete`
    /// fires when the exchange terminates: PUBACK for QoS 1, PUBCOMP for
    /// QoS 2, never for QoS 0.
    ///
    /// # Errors
    /// Returns a [`ProcessorError`] if registration or the outbound write
    /// fails.
    pub fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Vec<u8>>,
        on_complete: Option<OnComplete>,
    ) -> Result<u16, ProcessorError> {
        let mut publish = Publish::new(topic, qos, payload);
        publish.retain = retain;
        match qos {
            QoS::AtMostOnce => {
                self.outbound.send(Packet::Publish(publish))?;
                Ok(0)
            }
            QoS::AtLeastOnce => {
                publish.pkid = self.session.next_pkid();
                let pkid = publish.pkid;
                self.session
                    .pub1_ack()
                    .wait(&Packet::Publish(publish.clone()), on_complete)?;
                self.outbound.send(Packet::Publish(publish))?;
                Ok(pkid)
            }
            QoS::ExactlyOnce => {
                publish.pkid = self.session.next_pkid();
                let pkid = publish.pkid;
                self.session
                    .pub2_out()
                    .wait(&Packet::Publish(publish.clone()), on_complete)?;
                self.outbound.send(Packet::Publish(publish))?;
                Ok(pkid)
            }
        }
    }

    /// Send a SUBSCRIBE for the given filters.
    ///
    /// Returns the assigned packet identifier. `on_complete` fires when the
    /// SUBACK arrives.
    ///
    /// # Errors
    /// Returns a [`ProcessorError`] if registration or the outbound write
    /// fails.
    pub fn subscribe(
        &self,
        filters: Vec<SubscribeFilter>,
        on_complete: Option<OnComplete>,
    ) -> Result<u16, ProcessorError> {
        let subscribe = Subscribe {
            pkid: self.session.next_pkid(),
            filters,
        };
        let pkid = subscribe.pkid;
        self.session
            .sub_ack()
            .wait(&Packet::Subscribe(subscribe.clone()), on_complete)?;
        self.outbound.send(Packet::Subscribe(subscribe))?;
        Ok(pkid)
    }

    /// Send an UNSUBSCRIBE for the given topic filters.
    ///
    /// Returns the assigned packet identifier. `on_complete` fires when the
    /// UNSUBACK arrives.
    ///
    /// # Errors
    /// Returns a [`ProcessorError`] if registration or the outbound write
    /// fails.
    pub fn unsubscribe(
        &self,
        topics: Vec<String>,
        on_complete: Option<OnComplete>,
    ) -> Result<u16, ProcessorError> {
        let unsubscribe = Unsubscribe {
            pkid: self.session.next_pkid(),
            topics,
        };
        let pkid = unsubscribe.pkid;
        self.session
            .unsub_ack()
            .wait(&Packet::Unsubscribe(unsubscribe.clone()), on_complete)?;
        self.outbound.send(Packet::Unsubscribe(unsubscribe))?;
        Ok(pkid)
    }

    /// Send a PINGREQ. At most one ping exchange may be in flight.
    ///
    /// `on_complete` fires when the PINGRESP arrives.
    ///
    /// # Errors
    /// Returns a [`ProcessorError`] if a ping is already in flight or the
    /// outbound write fails.
    pub fn ping(&self, on_complete: Option<OnComplete>) -> Result<(), ProcessorError> {
        self.session.ping_ack().wait(&Packet::PingReq, on_complete)?;
        self.outbound.send(Packet::PingReq)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound;

    fn injector() -> (Injector, Arc<Session>, outbound::PacketRx) {
        let session = Arc::new(Session::new("client", None));
        let (tx, rx) = outbound::channel();
        (Injector::new(Arc::clone(&session), tx), session, rx)
    }

    #[tokio::test]
    async fn qos0_publish_is_sent_without_registration() {
        let (injector, session, mut rx) = injector();
        let pkid = injector
            .publish("a/b", QoS::AtMostOnce, false, &b"x"[..], None)
            .unwrap();
        assert_eq!(pkid, 0);
        assert!(session.pub1_ack().is_empty());
        assert!(session.pub2_out().is_empty());
        assert!(matches!(rx.recv().await, Some(Packet::Publish(_))));
    }

    #[tokio::test]
    async fn qos1_publish_registers_before_sending() {
        let (injector, session, mut rx) = injector();
        let pkid = injector
            .publish("a/b", QoS::AtLeastOnce, false, &b"x"[..], None)
            .unwrap();
        assert!(session.pub1_ack().contains(pkid));

        let Some(Packet::Publish(sent)) = rx.recv().await else {
            panic!("expected a publish on the wire");
        };
        assert_eq!(sent.pkid, pkid);
        assert_eq!(sent.qos, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn qos2_publish_registers_in_the_two_step_queue() {
        let (injector, session, mut rx) = injector();
        let pkid = injector
            .publish("a/b", QoS::ExactlyOnce, false, &b"x"[..], None)
            .unwrap();
        assert!(session.pub2_out().contains(pkid));
        assert!(matches!(rx.recv().await, Some(Packet::Publish(_))));
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_register_their_exchanges() {
        let (injector, session, mut rx) = injector();
        let sub_pkid = injector
            .subscribe(
                vec![SubscribeFilter {
                    path: "a/b".to_string(),
                    qos: QoS::AtLeastOnce,
                }],
                None,
            )
            .unwrap();
        assert!(session.sub_ack().contains(sub_pkid));
        assert!(matches!(rx.recv().await, Some(Packet::Subscribe(_))));

        let unsub_pkid = injector
            .unsubscribe(vec!["a/b".to_string()], None)
            .unwrap();
        assert_ne!(sub_pkid, unsub_pkid);
        assert!(session.unsub_ack().contains(unsub_pkid));
        assert!(matches!(rx.recv().await, Some(Packet::Unsubscribe(_))));
    }

    #[tokio::test]
    async fn only_one_ping_may_be_in_flight() {
        let (injector, _session, mut rx) = injector();
        injector.ping(None).unwrap();
        assert!(injector.ping(None).is_err());
        assert!(matches!(rx.recv().await, Some(Packet::PingReq)));
    }

    #[test]
    fn send_failure_surfaces_when_the_writer_is_gone() {
        let (injector, _session, rx) = injector();
        drop(rx);
        assert!(injector
            .publish("a/b", QoS::AtMostOnce, false, &b"x"[..], None)
            .is_err());
    }
}
