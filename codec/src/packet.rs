// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::{
    ByteArray, ConnectAckPacket, ConnectPacket, DecodeError, DecodePacket, DisconnectPacket,
    EncodeError, EncodePacket, FixedHeader, PacketType, PingRequestPacket, PingResponsePacket,
    PublishPacket, SubscribeAckPacket, SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
};

/// Tagged union over the control packets this broker implements.
///
/// PUBACK, PUBREC, PUBREL, PUBCOMP and AUTH are recognized by the fixed
/// header decoder but have no variants here: decoding one returns
/// `DecodeError::UnsupportedPacketType`, which the connection maps to a
/// DISCONNECT with reason 131 (Implementation specific error).
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    Subscribe(SubscribePacket),
    SubscribeAck(SubscribeAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingRequest(PingRequestPacket),
    PingResponse(PingResponsePacket),
    Disconnect(DisconnectPacket),
}

impl Packet {
    /// Get the packet type variant of this packet.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        use crate::PacketTrait;
        match self {
            Self::Connect(p) => p.packet_type(),
            Self::ConnectAck(p) => p.packet_type(),
            Self::Publish(p) => p.packet_type(),
            Self::Subscribe(p) => p.packet_type(),
            Self::SubscribeAck(p) => p.packet_type(),
            Self::Unsubscribe(p) => p.packet_type(),
            Self::UnsubscribeAck(p) => p.packet_type(),
            Self::PingRequest(p) => p.packet_type(),
            Self::PingResponse(p) => p.packet_type(),
            Self::Disconnect(p) => p.packet_type(),
        }
    }

    /// Decode one complete packet from `ba`.
    ///
    /// The byte array must hold exactly one frame starting at offset 0; the
    /// header is peeked for dispatch and each variant decoder then consumes
    /// the whole frame, header included.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientData` on a partial frame and other variants for
    /// wire-format violations.
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        ba.reset_offset();

        match fixed_header.packet_type() {
            PacketType::Connect => ConnectPacket::decode(ba).map(Self::Connect),
            PacketType::ConnectAck => ConnectAckPacket::decode(ba).map(Self::ConnectAck),
            PacketType::Publish { .. } => PublishPacket::decode(ba).map(Self::Publish),
            PacketType::Subscribe => SubscribePacket::decode(ba).map(Self::Subscribe),
            PacketType::SubscribeAck => SubscribeAckPacket::decode(ba).map(Self::SubscribeAck),
            PacketType::Unsubscribe => UnsubscribePacket::decode(ba).map(Self::Unsubscribe),
            PacketType::UnsubscribeAck => {
                UnsubscribeAckPacket::decode(ba).map(Self::UnsubscribeAck)
            }
            PacketType::PingRequest => PingRequestPacket::decode(ba).map(Self::PingRequest),
            PacketType::PingResponse => PingResponsePacket::decode(ba).map(Self::PingResponse),
            PacketType::Disconnect => DisconnectPacket::decode(ba).map(Self::Disconnect),
            PacketType::PublishAck
            | PacketType::PublishReceived
            | PacketType::PublishRelease
            | PacketType::PublishComplete
            | PacketType::Auth => Err(DecodeError::UnsupportedPacketType),
        }
    }
}

impl EncodePacket for Packet {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::Connect(p) => p.encode(buf),
            Self::ConnectAck(p) => p.encode(buf),
            Self::Publish(p) => p.encode(buf),
            Self::Subscribe(p) => p.encode(buf),
            Self::SubscribeAck(p) => p.encode(buf),
            Self::Unsubscribe(p) => p.encode(buf),
            Self::UnsubscribeAck(p) => p.encode(buf),
            Self::PingRequest(p) => p.encode(buf),
            Self::PingResponse(p) => p.encode(buf),
            Self::Disconnect(p) => p.encode(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PacketId, QoS};

    #[test]
    fn test_packet_decode_dispatch() {
        let publish = PublishPacket::new("a/b", QoS::AtMostOnce, b"hi").unwrap();
        let mut buf = Vec::new();
        publish.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        match Packet::decode(&mut ba).unwrap() {
            Packet::Publish(p) => assert_eq!(p.topic(), "a/b"),
            other => panic!("expected publish, got {other:?}"),
        }
    }

    #[test]
    fn test_packet_decode_unsupported() {
        // PUBACK for packet id 1, well-formed on the wire.
        let buf = [0x40, 0x02, 0x00, 0x01];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            Packet::decode(&mut ba),
            Err(DecodeError::UnsupportedPacketType)
        );
    }

    #[test]
    fn test_packet_round_trip_all_supported() {
        let packets: Vec<Packet> = vec![
            Packet::Connect(ConnectPacket::new("cid").unwrap()),
            Packet::ConnectAck(ConnectAckPacket::new(false, crate::ReasonCode::Success)),
            Packet::Publish(PublishPacket::new("t", QoS::AtMostOnce, b"m").unwrap()),
            Packet::Subscribe(
                SubscribePacket::new("t/#", QoS::AtMostOnce, PacketId::new(1)).unwrap(),
            ),
            Packet::SubscribeAck(SubscribeAckPacket::new(
                PacketId::new(1),
                crate::ReasonCode::Success,
            )),
            Packet::Unsubscribe(UnsubscribePacket::new("t/#", PacketId::new(2)).unwrap()),
            Packet::UnsubscribeAck(UnsubscribeAckPacket::new(
                PacketId::new(2),
                crate::ReasonCode::Success,
            )),
            Packet::PingRequest(PingRequestPacket::new()),
            Packet::PingResponse(PingResponsePacket::new()),
            Packet::Disconnect(DisconnectPacket::new()),
        ];

        for packet in packets {
            let mut buf = Vec::new();
            packet.encode(&mut buf).unwrap();
            let mut ba = ByteArray::new(&buf);
            let decoded = Packet::decode(&mut ba).unwrap();
            assert_eq!(decoded, packet);
        }
    }
}
