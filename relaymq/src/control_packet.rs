// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control packet types for MQTT v3.1.1, re-exported from the wire codec.

use bytes::{BufMut, Bytes, BytesMut};

/// Quality of Service
pub type QoS = mqttbytes::QoS;

/// Control packet kind (the high nibble of the fixed header)
pub type PacketType = mqttbytes::PacketType;

/// MQTT protocol revision
pub type Protocol = mqttbytes::Protocol;

/// Error raised by the packet codec
pub type CodecError = mqttbytes::Error;

/// Any MQTT control packet
pub type Packet = mqttbytes::v4::Packet;

/// CONNECT packet
pub type Connect = mqttbytes::v4::Connect;
/// CONNACK packet
pub type ConnAck = mqttbytes::v4::ConnAck;
/// CONNACK return code
pub type ConnectReturnCode = mqttbytes::v4::ConnectReturnCode;
/// PUBLISH packet
pub type Publish = mqttbytes::v4::Publish;
/// PUBACK packet
pub type PubAck = mqttbytes::v4::PubAck;
/// PUBREC packet
pub type PubRec = mqttbytes::v4::PubRec;
/// PUBREL packet
pub type PubRel = mqttbytes::v4::PubRel;
/// PUBCOMP packet
pub type PubComp = mqttbytes::v4::PubComp;
/// SUBSCRIBE packet
pub type Subscribe = mqttbytes::v4::Subscribe;
/// A single topic filter entry of a SUBSCRIBE packet
pub type SubscribeFilter = mqttbytes::v4::SubscribeFilter;
/// SUBACK packet
pub type SubAck = mqttbytes::v4::SubAck;
/// SUBACK return code
pub type SubscribeReasonCode = mqttbytes::v4::SubscribeReasonCode;
/// UNSUBSCRIBE packet
pub type Unsubscribe = mqttbytes::v4::Unsubscribe;
/// UNSUBACK packet
pub type UnsubAck = mqttbytes::v4::UnsubAck;
/// Will message carried by a CONNECT packet
pub type LastWill = mqttbytes::v4::LastWill;

/// Encode a control packet onto the end of `buf`, returning the frame length.
pub(crate) fn encode(packet: &Packet, buf: &mut BytesMut) -> Result<usize, CodecError> {
    match packet {
        Packet::Connect(p) => p.write(buf),
        Packet::ConnAck(p) => p.write(buf),
        Packet::Publish(p) => p.write(buf),
        Packet::PubAck(p) => p.write(buf),
        Packet::PubRec(p) => p.write(buf),
        Packet::PubRel(p) => p.write(buf),
        Packet::PubComp(p) => p.write(buf),
        Packet::Subscribe(p) => p.write(buf),
        Packet::SubAck(p) => p.write(buf),
        Packet::Unsubscribe(p) => p.write(buf),
        Packet::UnsubAck(p) => p.write(buf),
        // Payload-free packets are fixed two-byte frames.
        Packet::PingReq => {
            buf.put_slice(&[0xC0, 0x00]);
            Ok(2)
        }
        Packet::PingResp => {
            buf.put_slice(&[0xD0, 0x00]);
            Ok(2)
        }
        Packet::Disconnect => {
            buf.put_slice(&[0xE0, 0x00]);
            Ok(2)
        }
    }
}

/// Encode a control packet into a freshly allocated frame.
pub(crate) fn encode_to_bytes(packet: &Packet) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode a single complete frame.
pub(crate) fn decode(frame: &[u8], max_packet_size: usize) -> Result<Packet, CodecError> {
    let mut buf = BytesMut::from(frame);
    mqttbytes::v4::read(&mut buf, max_packet_size)
}

/// The kind of a control packet.
pub(crate) fn packet_type(packet: &Packet) -> PacketType {
    match packet {
        Packet::Connect(_) => PacketType::Connect,
        Packet::ConnAck(_) => PacketType::ConnAck,
        Packet::Publish(_) => PacketType::Publish,
        Packet::PubAck(_) => PacketType::PubAck,
        Packet::PubRec(_) => PacketType::PubRec,
        Packet::PubRel(_) => PacketType::PubRel,
        Packet::PubComp(_) => PacketType::PubComp,
        Packet::Subscribe(_) => PacketType::Subscribe,
        Packet::SubAck(_) => PacketType::SubAck,
        Packet::Unsubscribe(_) => PacketType::Unsubscribe,
        Packet::UnsubAck(_) => PacketType::UnsubAck,
        Packet::PingReq => PacketType::PingReq,
        Packet::PingResp => PacketType::PingResp,
        Packet::Disconnect => PacketType::Disconnect,
    }
}

/// The packet identifier pairing a packet with its acknowledgments.
///
/// Packets that carry no identifier on the wire (and QoS 0 publishes) report 0.
pub(crate) fn pkid(packet: &Packet) -> u16 {
    match packet {
        Packet::Publish(p) => p.pkid,
        Packet::PubAck(p) => p.pkid,
        Packet::PubRec(p) => p.pkid,
        Packet::PubRel(p) => p.pkid,
        Packet::PubComp(p) => p.pkid,
        Packet::Subscribe(p) => p.pkid,
        Packet::SubAck(p) => p.pkid,
        Packet::Unsubscribe(p) => p.pkid,
        Packet::UnsubAck(p) => p.pkid,
        Packet::Connect(_)
        | Packet::ConnAck(_)
        | Packet::PingReq
        | Packet::PingResp
        | Packet::Disconnect => 0,
    }
}

/// The lower of two delivery QoS levels.
pub(crate) fn min_qos(a: QoS, b: QoS) -> QoS {
    if (a as u8) <= (b as u8) {
        a
    } else {
        b
    }
}
