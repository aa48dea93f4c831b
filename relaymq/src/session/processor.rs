// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-connection dispatcher: consumes framed control packets, drives the
//! QoS state machines against the session's ack queues, fans publishes out
//! through the topic manager and writes protocol replies.
//!
//! One processor task runs per connection and processes packets strictly in
//! wire order. Handlers never block; the only suspension points are waiting
//! for transport bytes and the stop signal. A panic inside the task is
//! confined to it by the runtime and surfaces to the supervisor as a join
//! error, never as process exit.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::control_packet::{
    self, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck, Subscribe,
    SubscribeReasonCode, UnsubAck, Unsubscribe,
};
use crate::error::{ProcessorError, ProcessorErrorKind};
use crate::frame::{FrameError, FrameReader};
use crate::outbound::PacketTx;
use crate::session::ack_queue::AckQueue;
use crate::session::{Injector, ProcessorOptions, ProcessorState, Session};
use crate::topics::{SubscriberHandle, TopicManager};

/// Per-connection message processor.
///
/// Created by the connection supervisor once the CONNECT handshake has
/// established a [`Session`], then driven to completion with
/// [`Processor::run`].
pub struct Processor<R> {
    session: Arc<Session>,
    topics: Arc<TopicManager>,
    transport: R,
    reader: FrameReader,
    outbound: PacketTx,
    /// This session's identity in the topic manager's fan-out tables
    handle: SubscriberHandle,
    /// Publishes fanned out to this session by other sessions
    deliveries: mpsc::UnboundedReceiver<Publish>,
    state: Arc<ProcessorState>,
    cancel: CancellationToken,
    options: ProcessorOptions,
}

impl<R> Processor<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a processor for an established session.
    ///
    /// Registers the session as a subscriber with the topic manager; the
    /// registration is withdrawn again when the processor exits.
    #[must_use]
    pub fn new(
        session: Arc<Session>,
        topics: Arc<TopicManager>,
        transport: R,
        outbound: PacketTx,
        options: ProcessorOptions,
    ) -> Self {
        let (handle, deliveries) = topics.register();
        let reader = FrameReader::new(options.max_packet_size, options.read_chunk_size);
        Self {
            session,
            topics,
            transport,
            reader,
            outbound,
            handle,
            deliveries,
            state: Arc::new(ProcessorState::default()),
            cancel: CancellationToken::new(),
            options,
        }
    }

    /// The lifecycle gates of this processor.
    #[must_use]
    pub fn state(&self) -> Arc<ProcessorState> {
        Arc::clone(&self.state)
    }

    /// Token that stops the processor at its next iteration boundary.
    ///
    /// By default the stop is immediate; with
    /// [`drain_on_cancel`](crate::session::ProcessorOptionsBuilder::drain_on_cancel)
    /// already-buffered packets are processed first.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handle for injecting outgoing client-role packets into this session.
    #[must_use]
    pub fn injector(&self) -> Injector {
        Injector::new(Arc::clone(&self.session), self.outbound.clone())
    }

    /// Run the processor until the stream ends, the peer disconnects, the
    /// stop signal fires, or a terminal error occurs.
    ///
    /// Signals the start gate on entry and the stop gate on every exit path.
    ///
    /// # Errors
    /// Returns a [`ProcessorError`] describing the terminal condition.
    /// A clean end of stream and a peer DISCONNECT both return `Ok`.
    pub async fn run(mut self) -> Result<(), ProcessorError> {
        self.state.transition_running();
        log::info!("session {}: processor started", self.session.client_id());

        let result = match self.run_inner().await {
            // The disconnect sentinel terminates the loop silently
            Err(ProcessorErrorKind::PeerDisconnect) => {
                log::debug!("session {}: peer disconnected", self.session.client_id());
                Ok(())
            }
            Err(kind) => {
                log::error!("session {}: terminated: {kind}", self.session.client_id());
                Err(ProcessorError::from(kind))
            }
            Ok(()) => Ok(()),
        };

        // Withdraw this session's subscriptions so fan-out no longer sees it
        for (filter, _) in self.session.subscriptions() {
            if let Err(e) = self.topics.unsubscribe(&filter, self.handle.id()) {
                log::debug!(
                    "session {}: teardown unsubscribe from {filter}: {e}",
                    self.session.client_id()
                );
            }
        }

        self.state.transition_exited();
        log::info!("session {}: processor exited", self.session.client_id());
        result
    }

    async fn run_inner(&mut self) -> Result<(), ProcessorErrorKind> {
        loop {
            // Publishes fanned out by other sessions are forwarded between
            // inbound frames; they never preempt one.
            self.forward_deliveries()?;

            if self.cancel.is_cancelled()
                && (!self.options.drain_on_cancel || !self.buffered_frame_ready())
            {
                log::debug!("session {}: stop signal honored", self.session.client_id());
                return Ok(());
            }

            let Some((total_len, packet)) = self.peek_frame().await? else {
                return Ok(());
            };

            self.session.record_inbound(total_len);

            let outcome = self.dispatch(packet);
            self.reader.read_commit(total_len)?;
            outcome?;

            if self.cancel.is_cancelled() && self.reader.is_empty() {
                log::debug!("session {}: stop signal honored", self.session.client_id());
                return Ok(());
            }
        }
    }

    /// Peek the next complete frame, filling from the transport as needed.
    ///
    /// Returns `None` when the loop should terminate cleanly (end of stream
    /// or stop signal while waiting for bytes).
    async fn peek_frame(&mut self) -> Result<Option<(usize, Packet)>, ProcessorErrorKind> {
        loop {
            match self.reader.peek_message_size() {
                Ok((_kind, total_len)) => match self.reader.peek_message(total_len) {
                    Ok((packet, n)) => return Ok(Some((n, packet))),
                    Err(FrameError::ShortRead) => {
                        if !self.fill().await? {
                            return Ok(None);
                        }
                    }
                    Err(e) => {
                        log::error!(
                            "session {}: malformed packet: {e}",
                            self.session.client_id()
                        );
                        return Err(e.into());
                    }
                },
                Err(FrameError::ShortRead) => {
                    if !self.fill().await? {
                        return Ok(None);
                    }
                }
                Err(FrameError::Eof) => {
                    log::debug!("session {}: end of stream", self.session.client_id());
                    return Ok(None);
                }
                Err(e) => {
                    log::error!("session {}: unusable frame: {e}", self.session.client_id());
                    return Err(e.into());
                }
            }
        }
    }

    /// Wait for transport bytes, a fanned-out delivery, or the stop signal.
    ///
    /// Returns false when the loop should terminate (stop signal, or the
    /// stream closed mid-frame).
    async fn fill(&mut self) -> Result<bool, ProcessorErrorKind> {
        if self.reader.is_closed() {
            log::warn!(
                "session {}: connection closed mid-frame ({} bytes pending)",
                self.session.client_id(),
                self.reader.len()
            );
            return Ok(false);
        }
        tokio::select! {
            // Ensure the stop signal is checked first.
            biased;
            () = self.cancel.cancelled() => {
                Ok(false)
            }
            delivery = self.deliveries.recv() => {
                if let Some(publish) = delivery {
                    self.deliver_publish(publish)?;
                }
                Ok(true)
            }
            read = self.reader.fill_from(&mut self.transport) => {
                match read {
                    // A zero-length read closed the reader; the next peek observes it
                    Ok(_) => Ok(true),
                    Err(e) => Err(ProcessorErrorKind::Frame(FrameError::Io(e))),
                }
            }
        }
    }

    /// Forward already-queued fan-out deliveries without waiting.
    fn forward_deliveries(&mut self) -> Result<(), ProcessorErrorKind> {
        while let Ok(publish) = self.deliveries.try_recv() {
            self.deliver_publish(publish)?;
        }
        Ok(())
    }

    /// Returns true if a complete frame is already buffered.
    fn buffered_frame_ready(&self) -> bool {
        matches!(
            self.reader.peek_message_size(),
            Ok((_, total_len)) if self.reader.len() >= total_len
        )
    }

    /// Dispatch one inbound packet per its kind.
    ///
    /// A DISCONNECT surfaces as the [`ProcessorErrorKind::PeerDisconnect`]
    /// sentinel, which terminates the loop without counting as a failure.
    fn dispatch(&self, packet: Packet) -> Result<(), ProcessorErrorKind> {
        let ptype = control_packet::packet_type(&packet);
        log::debug!("session {}: incoming {ptype:?}", self.session.client_id());
        match packet {
            Packet::Publish(publish) => {
                self.process_publish(publish)?;
                Ok(())
            }
            Packet::PubAck(ack) => {
                self.session.pub1_ack().ack(&Packet::PubAck(ack))?;
                self.fire_completions(self.session.pub1_ack());
                Ok(())
            }
            Packet::PubRec(rec) => {
                let pkid = rec.pkid;
                self.session.pub2_out().ack(&Packet::PubRec(rec))?;
                self.send(Packet::PubRel(PubRel::new(pkid)))?;
                Ok(())
            }
            Packet::PubRel(rel) => {
                let pkid = rel.pkid;
                self.session.pub2_in().ack(&Packet::PubRel(rel))?;
                // The stored PUBLISH only reaches the application now
                for entry in self.session.pub2_in().drain_acked() {
                    let msg = control_packet::decode(&entry.msgbuf, self.options.max_packet_size)
                        .map_err(FrameError::Codec)?;
                    if let Packet::Publish(publish) = msg {
                        self.on_publish(publish)?;
                    }
                }
                self.send(Packet::PubComp(PubComp::new(pkid)))?;
                Ok(())
            }
            Packet::PubComp(comp) => {
                self.session.pub2_out().ack(&Packet::PubComp(comp))?;
                self.fire_completions(self.session.pub2_out());
                Ok(())
            }
            Packet::Subscribe(subscribe) => {
                self.process_subscribe(&subscribe)?;
                Ok(())
            }
            Packet::SubAck(ack) => {
                self.session.sub_ack().ack(&Packet::SubAck(ack))?;
                self.fire_completions(self.session.sub_ack());
                Ok(())
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.process_unsubscribe(&unsubscribe)?;
                Ok(())
            }
            Packet::UnsubAck(ack) => {
                self.session.unsub_ack().ack(&Packet::UnsubAck(ack))?;
                self.fire_completions(self.session.unsub_ack());
                Ok(())
            }
            Packet::PingReq => {
                self.send(Packet::PingResp)?;
                Ok(())
            }
            Packet::PingResp => {
                self.session.ping_ack().ack(&Packet::PingResp)?;
                self.fire_completions(self.session.ping_ack());
                Ok(())
            }
            Packet::Disconnect => {
                // MUST discard the will without publishing it [MQTT-3.14.4-3]
                self.session.clear_will();
                Err(ProcessorErrorKind::PeerDisconnect)
            }
            Packet::Connect(_) | Packet::ConnAck(_) => Err(ProcessorErrorKind::ProtocolViolation(
                format!("unexpected {ptype:?} on an established session"),
            )),
        }
    }

    /// Handle an inbound PUBLISH according to its QoS.
    fn process_publish(&self, publish: Publish) -> Result<(), ProcessorErrorKind> {
        log::debug!(
            "session {}: PUBLISH on {} ({:?}, pkid {})",
            self.session.client_id(),
            publish.topic,
            publish.qos,
            publish.pkid
        );
        match publish.qos {
            QoS::AtMostOnce => self.on_publish(publish),
            QoS::AtLeastOnce => {
                if publish.pkid == 0 {
                    return Err(ProcessorErrorKind::ProtocolViolation(
                        "QoS 1 PUBLISH without packet identifier".to_string(),
                    ));
                }
                // PUBACK leaves first; the peer may reuse the pkid immediately
                self.send(Packet::PubAck(PubAck::new(publish.pkid)))?;
                self.on_publish(publish)
            }
            QoS::ExactlyOnce => {
                if publish.pkid == 0 {
                    return Err(ProcessorErrorKind::ProtocolViolation(
                        "QoS 2 PUBLISH without packet identifier".to_string(),
                    ));
                }
                let pkid = publish.pkid;
                // Stored before PUBREC goes out; fan-out waits for PUBREL
                self.session.pub2_in().wait(&Packet::Publish(publish), None)?;
                self.send(Packet::PubRec(PubRec::new(pkid)))
            }
        }
    }

    /// Fan an application message out to every matching subscriber.
    fn on_publish(&self, mut publish: Publish) -> Result<(), ProcessorErrorKind> {
        if publish.retain {
            // The retained store is best-effort, not on the delivery path
            if let Err(e) = self.topics.retain(&publish) {
                log::warn!(
                    "session {}: retained store rejected {}: {e}",
                    self.session.client_id(),
                    publish.topic
                );
            }
        }

        let subscribers = self.topics.subscribers(&publish.topic, publish.qos)?;

        // Retain semantics apply to the store, not to live fan-out copies
        publish.retain = false;
        publish.dup = false;
        publish.pkid = 0;

        for (subscriber, qos) in subscribers {
            let mut delivery = publish.clone();
            delivery.qos = qos;
            subscriber.deliver(delivery)?;
        }
        Ok(())
    }

    /// Write a publish to this session's peer, registering the exchange for
    /// QoS 1 and 2 before the frame reaches the writer.
    fn deliver_publish(&self, mut publish: Publish) -> Result<(), ProcessorErrorKind> {
        match publish.qos {
            QoS::AtMostOnce => {
                publish.pkid = 0;
                self.send(Packet::Publish(publish))
            }
            QoS::AtLeastOnce => {
                publish.pkid = self.session.next_pkid();
                self.session
                    .pub1_ack()
                    .wait(&Packet::Publish(publish.clone()), None)?;
                self.send(Packet::Publish(publish))
            }
            QoS::ExactlyOnce => {
                publish.pkid = self.session.next_pkid();
                self.session
                    .pub2_out()
                    .wait(&Packet::Publish(publish.clone()), None)?;
                self.send(Packet::Publish(publish))
            }
        }
    }

    /// Handle a SUBSCRIBE: register each filter, answer with SUBACK, then
    /// replay retained messages.
    ///
    /// A filter the topic manager rejects contributes a failure return code
    /// instead of aborting the packet, so the return-code list always matches
    /// the filter list and accepted filters stay registered.
    fn process_subscribe(&self, subscribe: &Subscribe) -> Result<(), ProcessorErrorKind> {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut retained = Vec::new();
        for filter in &subscribe.filters {
            match self.topics.subscribe(&filter.path, filter.qos, &self.handle) {
                Ok(granted) => {
                    self.session.add_subscription(&filter.path, granted);
                    return_codes.push(SubscribeReasonCode::Success(granted));
                    match self.topics.retained(&filter.path) {
                        Ok(messages) => {
                            retained.extend(messages.into_iter().map(|m| (m, granted)));
                        }
                        Err(e) => log::warn!(
                            "session {}: retained lookup for {} failed: {e}",
                            self.session.client_id(),
                            filter.path
                        ),
                    }
                }
                Err(e) => {
                    log::warn!(
                        "session {}: subscribe to {} failed: {e}",
                        self.session.client_id(),
                        filter.path
                    );
                    return_codes.push(SubscribeReasonCode::Failure);
                }
            }
        }

        self.send(Packet::SubAck(SubAck::new(subscribe.pkid, return_codes)))?;

        // Retained replay follows the SUBACK on the wire; a broken outbound
        // path here ends the session
        for (message, granted) in retained {
            let mut replay = message;
            replay.qos = control_packet::min_qos(replay.qos, granted);
            replay.retain = true;
            self.deliver_publish(replay)?;
        }
        Ok(())
    }

    /// Handle an UNSUBSCRIBE: withdraw each filter and answer with UNSUBACK.
    fn process_unsubscribe(&self, unsubscribe: &Unsubscribe) -> Result<(), ProcessorErrorKind> {
        for topic in &unsubscribe.topics {
            if let Err(e) = self.topics.unsubscribe(topic, self.handle.id()) {
                // Unsubscribing from a filter the session never held is not fatal
                log::debug!(
                    "session {}: unsubscribe from {topic}: {e}",
                    self.session.client_id()
                );
            }
            self.session.remove_subscription(topic);
        }
        self.send(Packet::UnsubAck(UnsubAck::new(unsubscribe.pkid)))
    }

    /// Drain completed exchanges and fire their callbacks exactly once.
    fn fire_completions(&self, queue: &AckQueue) {
        for entry in queue.drain_acked() {
            let Some(on_complete) = entry.on_complete else {
                continue;
            };
            let msg = control_packet::decode(&entry.msgbuf, self.options.max_packet_size);
            let ack = control_packet::decode(&entry.ackbuf, self.options.max_packet_size);
            match (msg, ack) {
                (Ok(msg), Ok(ack)) => {
                    if let Err(e) = on_complete(msg, ack) {
                        log::warn!(
                            "session {}: completion callback failed: {e}",
                            self.session.client_id()
                        );
                    }
                }
                (Err(e), _) | (_, Err(e)) => log::warn!(
                    "session {}: could not decode completed exchange: {e}",
                    self.session.client_id()
                ),
            }
        }
    }

    /// Queue a reply for the outbound writer.
    fn send(&self, packet: Packet) -> Result<(), ProcessorErrorKind> {
        Ok(self.outbound.send(packet)?)
    }
}
