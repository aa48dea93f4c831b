// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-connection session state: ack queues, subscriptions, will, counters.

pub mod ack_queue;
mod injector;
mod options;
mod processor;
mod state;

pub use injector::Injector;
pub use options::{ProcessorOptions, ProcessorOptionsBuilder, ProcessorOptionsBuilderError};
pub use processor::Processor;
pub use state::ProcessorState;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::control_packet::{LastWill, QoS};
use crate::session::ack_queue::{AckQueue, AckRole};

/// State of one MQTT session, shared between its processor task and the code
/// injecting outgoing packets.
///
/// A session is created when its connection is established and dropped with
/// it; persisting sessions across connections is the session store's concern.
pub struct Session {
    client_id: String,
    /// Outbound QoS 1 publishes awaiting PUBACK
    pub1_ack: AckQueue,
    /// Inbound QoS 2 publishes awaiting PUBREL
    pub2_in: AckQueue,
    /// Outbound QoS 2 publishes awaiting PUBREC then PUBCOMP
    pub2_out: AckQueue,
    /// SUBSCRIBEs awaiting SUBACK
    sub_ack: AckQueue,
    /// UNSUBSCRIBEs awaiting UNSUBACK
    unsub_ack: AckQueue,
    /// PINGREQs awaiting PINGRESP
    ping_ack: AckQueue,
    /// Topic filters this session is subscribed to, with granted QoS
    subscriptions: Mutex<HashMap<String, QoS>>,
    /// Will message published on abnormal disconnect
    will: Mutex<Option<LastWill>>,
    /// Last allocated packet identifier
    last_pkid: Mutex<u16>,
    bytes_received: AtomicU64,
    packets_received: AtomicU64,
}

impl Session {
    /// Create a fresh session for a connected client.
    #[must_use]
    pub fn new(client_id: impl Into<String>, will: Option<LastWill>) -> Self {
        Self {
            client_id: client_id.into(),
            pub1_ack: AckQueue::new(AckRole::PublishQos1),
            pub2_in: AckQueue::new(AckRole::PublishQos2In),
            pub2_out: AckQueue::new(AckRole::PublishQos2Out),
            sub_ack: AckQueue::new(AckRole::Subscribe),
            unsub_ack: AckQueue::new(AckRole::Unsubscribe),
            ping_ack: AckQueue::new(AckRole::Ping),
            subscriptions: Mutex::new(HashMap::new()),
            will: Mutex::new(will),
            last_pkid: Mutex::new(0),
            bytes_received: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
        }
    }

    /// The client identifier this session belongs to.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Queue of outbound QoS 1 publishes awaiting PUBACK.
    #[must_use]
    pub fn pub1_ack(&self) -> &AckQueue {
        &self.pub1_ack
    }

    /// Queue of inbound QoS 2 publishes awaiting PUBREL.
    #[must_use]
    pub fn pub2_in(&self) -> &AckQueue {
        &self.pub2_in
    }

    /// Queue of outbound QoS 2 publishes awaiting PUBREC then PUBCOMP.
    #[must_use]
    pub fn pub2_out(&self) -> &AckQueue {
        &self.pub2_out
    }

    /// Queue of SUBSCRIBEs awaiting SUBACK.
    #[must_use]
    pub fn sub_ack(&self) -> &AckQueue {
        &self.sub_ack
    }

    /// Queue of UNSUBSCRIBEs awaiting UNSUBACK.
    #[must_use]
    pub fn unsub_ack(&self) -> &AckQueue {
        &self.unsub_ack
    }

    /// Queue of PINGREQs awaiting PINGRESP.
    #[must_use]
    pub fn ping_ack(&self) -> &AckQueue {
        &self.ping_ack
    }

    /// Returns true if the session still carries a will message.
    #[must_use]
    pub fn has_will(&self) -> bool {
        self.will.lock().unwrap().is_some()
    }

    /// Discard the will message without publishing it.
    ///
    /// The broker does this on a clean DISCONNECT (MQTT 3.1.1 [MQTT-3.14.4-3]).
    pub fn clear_will(&self) {
        *self.will.lock().unwrap() = None;
    }

    /// Take the will message for publication on abnormal connection loss.
    #[must_use]
    pub fn take_will(&self) -> Option<LastWill> {
        self.will.lock().unwrap().take()
    }

    /// The session's current subscriptions with their granted QoS.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect()
    }

    /// Returns true if the session is subscribed to `filter`.
    #[must_use]
    pub fn is_subscribed(&self, filter: &str) -> bool {
        self.subscriptions.lock().unwrap().contains_key(filter)
    }

    pub(crate) fn add_subscription(&self, filter: &str, granted: QoS) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(filter.to_string(), granted);
    }

    pub(crate) fn remove_subscription(&self, filter: &str) {
        self.subscriptions.lock().unwrap().remove(filter);
    }

    /// Total bytes consumed from the inbound stream.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Total packets consumed from the inbound stream.
    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub(crate) fn record_inbound(&self, frame_len: usize) {
        self.bytes_received
            .fetch_add(frame_len as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Allocate the next free packet identifier for an outbound exchange.
    ///
    /// Identifiers wrap within 1..=65535 and skip any id that is still in
    /// flight in one of the outbound queues.
    pub(crate) fn next_pkid(&self) -> u16 {
        let mut last = self.last_pkid.lock().unwrap();
        loop {
            *last = last.wrapping_add(1);
            if *last == 0 {
                *last = 1;
            }
            let pkid = *last;
            if !self.pub1_ack.contains(pkid)
                && !self.pub2_out.contains(pkid)
                && !self.sub_ack.contains(pkid)
                && !self.unsub_ack.contains(pkid)
            {
                return pkid;
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("pub1_ack", &self.pub1_ack)
            .field("pub2_in", &self.pub2_in)
            .field("pub2_out", &self.pub2_out)
            .field("sub_ack", &self.sub_ack)
            .field("unsub_ack", &self.unsub_ack)
            .field("ping_ack", &self.ping_ack)
            .field("will", &self.has_will())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::control_packet::{Packet, Publish};

    fn last_will() -> LastWill {
        LastWill {
            topic: "status/client".to_string(),
            message: Bytes::from_static(b"gone"),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    #[test]
    fn pkids_start_at_one_and_wrap() {
        let session = Session::new("client", None);
        assert_eq!(session.next_pkid(), 1);
        assert_eq!(session.next_pkid(), 2);

        *session.last_pkid.lock().unwrap() = u16::MAX;
        assert_eq!(session.next_pkid(), 1);
    }

    #[test]
    fn pkid_allocation_skips_in_flight_ids() {
        let session = Session::new("client", None);
        let mut publish = Publish::new("a/b", QoS::AtLeastOnce, &b"x"[..]);
        publish.pkid = 1;
        session
            .pub1_ack()
            .wait(&Packet::Publish(publish), None)
            .unwrap();
        assert_eq!(session.next_pkid(), 2);
    }

    #[test]
    fn will_is_cleared_and_taken_once() {
        let session = Session::new("client", Some(last_will()));
        assert!(session.has_will());
        session.clear_will();
        assert!(!session.has_will());
        assert!(session.take_will().is_none());
    }

    #[test]
    fn subscription_set_tracks_filters() {
        let session = Session::new("client", None);
        session.add_subscription("a/b", QoS::AtLeastOnce);
        assert!(session.is_subscribed("a/b"));
        assert_eq!(
            session.subscriptions(),
            vec![("a/b".to_string(), QoS::AtLeastOnce)]
        );
        session.remove_subscription("a/b");
        assert!(!session.is_subscribed("a/b"));
    }

    #[test]
    fn inbound_counters_accumulate() {
        let session = Session::new("client", None);
        session.record_inbound(4);
        session.record_inbound(60);
        assert_eq!(session.bytes_received(), 64);
        assert_eq!(session.packets_received(), 2);
    }
}
