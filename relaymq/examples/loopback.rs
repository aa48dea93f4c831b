// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Two in-memory sessions exchanging a message through the topic manager.
//!
//! One session subscribes to `demo/greeting`, the other publishes on it; the
//! fan-out arrives on the subscriber's outbound queue as a QoS 1 PUBLISH.

use std::sync::Arc;
use std::time::Duration;

use relaymq::control_packet::{Packet, PubAck, Publish, QoS, Subscribe, SubscribeFilter};
use relaymq::outbound::{self, PacketRx, PacketTx};
use relaymq::session::{Processor, ProcessorOptions, Session};
use relaymq::topics::TopicManager;

/// Wire up one session: the peer side writes real frames through the crate's
/// writer task, the processor's replies surface on the returned queue.
async fn connect(topics: &Arc<TopicManager>, client_id: &str) -> (PacketTx, PacketRx) {
    let session = Arc::new(Session::new(client_id, None));
    let (client_io, server_io) = tokio::io::duplex(4096);

    let (peer_tx, peer_rx) = outbound::channel();
    tokio::spawn(outbound::run_writer(peer_rx, client_io));

    let (tx, rx) = outbound::channel();
    let processor = Processor::new(
        session,
        Arc::clone(topics),
        server_io,
        tx,
        ProcessorOptions::default(),
    );
    let state = processor.state();
    tokio::spawn(processor.run());
    state.condition_running().await;
    (peer_tx, rx)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let topics = Arc::new(TopicManager::new());
    let (subscriber_tx, mut subscriber_rx) = connect(&topics, "subscriber").await;
    let (publisher_tx, mut publisher_rx) = connect(&topics, "publisher").await;

    // Subscribe one session to the demo topic
    subscriber_tx
        .send(Packet::Subscribe(Subscribe {
            pkid: 1,
            filters: vec![SubscribeFilter {
                path: "demo/greeting".to_string(),
                qos: QoS::AtLeastOnce,
            }],
        }))
        .unwrap();
    println!("subscriber <- {:?}", subscriber_rx.recv().await.unwrap());

    // Publish from the other session
    let mut publish = Publish::new("demo/greeting", QoS::AtLeastOnce, &b"hello"[..]);
    publish.pkid = 7;
    publisher_tx.send(Packet::Publish(publish)).unwrap();
    println!("publisher  <- {:?}", publisher_rx.recv().await.unwrap());

    // The fan-out arrives on the subscriber's wire as its own QoS 1 exchange
    let delivery = subscriber_rx.recv().await.unwrap();
    println!("subscriber <- {delivery:?}");
    if let Packet::Publish(publish) = delivery {
        subscriber_tx
            .send(Packet::PubAck(PubAck::new(publish.pkid)))
            .unwrap();
    }

    // Give the ack a moment to drain before the sessions drop
    tokio::time::sleep(Duration::from_millis(100)).await;
}
