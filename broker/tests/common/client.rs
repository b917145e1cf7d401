// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, DecodeError, DecodePacket, DisconnectPacket,
    EncodePacket, FixedHeader, Packet, PacketId, PingRequestPacket, PublishPacket, QoS,
    ReasonCode, SubscribeAckPacket, SubscribeOptions, SubscribePacket, SubscribeTopic,
    UnsubscribeAckPacket, UnsubscribePacket,
};

/// Raw-socket MQTT 5.0 client for driving the broker in tests.
pub struct TestClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl TestClient {
    /// Open a TCP connection without any handshake.
    pub async fn open(address: &str) -> Self {
        let stream = TcpStream::connect(address).await.unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Connect and complete the CONNECT/CONNACK handshake.
    pub async fn connect(address: &str, client_id: &str) -> Self {
        let mut client = Self::open(address).await;
        let ack = client.send_connect(client_id).await;
        assert_eq!(ack.reason_code(), ReasonCode::Success);
        client
    }

    /// Send CONNECT for `client_id` and return the CONNACK.
    pub async fn send_connect(&mut self, client_id: &str) -> ConnectAckPacket {
        let packet = ConnectPacket::new(client_id).unwrap();
        self.send(&packet).await;
        match self.recv_packet().await {
            Packet::ConnectAck(ack) => ack,
            other => panic!("expected CONNACK, got {other:?}"),
        }
    }

    /// Write raw bytes to the socket.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Encode and send one packet.
    pub async fn send<P: EncodePacket>(&mut self, packet: &P) {
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    /// Read one complete frame off the socket, or None on close.
    pub async fn recv_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() >= 2 {
                let mut ba = ByteArray::new(&self.buf);
                match FixedHeader::decode(&mut ba) {
                    Ok(header) => {
                        let total = header.bytes() + header.remaining_length();
                        if self.buf.len() >= total {
                            let frame = self.buf[..total].to_vec();
                            self.buf.drain(..total);
                            return Some(frame);
                        }
                    }
                    Err(DecodeError::InsufficientData) => {}
                    Err(err) => panic!("malformed frame from broker: {err:?}"),
                }
            }

            let mut chunk = [0u8; 1024];
            let n = self.stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read and decode one packet; panics if the broker closed the stream.
    pub async fn recv_packet(&mut self) -> Packet {
        let frame = self
            .recv_frame()
            .await
            .expect("broker closed the connection");
        let mut ba = ByteArray::new(&frame);
        Packet::decode(&mut ba).unwrap()
    }

    /// Subscribe to `filter` and return the SUBACK.
    pub async fn subscribe(&mut self, filter: &str, packet_id: u16) -> SubscribeAckPacket {
        let packet = SubscribePacket::new(filter, QoS::AtMostOnce, PacketId::new(packet_id))
            .unwrap();
        self.send(&packet).await;
        match self.recv_packet().await {
            Packet::SubscribeAck(ack) => ack,
            other => panic!("expected SUBACK, got {other:?}"),
        }
    }

    /// Subscribe with explicit options and return the SUBACK.
    pub async fn subscribe_with_options(
        &mut self,
        filter: &str,
        options: SubscribeOptions,
        packet_id: u16,
    ) -> SubscribeAckPacket {
        let topic = SubscribeTopic::new(filter, options).unwrap();
        let packet = SubscribePacket::with_topics(PacketId::new(packet_id), vec![topic]);
        self.send(&packet).await;
        match self.recv_packet().await {
            Packet::SubscribeAck(ack) => ack,
            other => panic!("expected SUBACK, got {other:?}"),
        }
    }

    /// Unsubscribe from `filter` and return the UNSUBACK.
    pub async fn unsubscribe(&mut self, filter: &str, packet_id: u16) -> UnsubscribeAckPacket {
        let packet = UnsubscribePacket::new(filter, PacketId::new(packet_id)).unwrap();
        self.send(&packet).await;
        match self.recv_packet().await {
            Packet::UnsubscribeAck(ack) => ack,
            other => panic!("expected UNSUBACK, got {other:?}"),
        }
    }

    /// Publish a QoS 0 message.
    pub async fn publish(&mut self, topic: &str, payload: &[u8]) {
        let packet = PublishPacket::new(topic, QoS::AtMostOnce, payload).unwrap();
        self.send(&packet).await;
    }

    /// Wait for a PUBLISH forwarded by the broker.
    pub async fn recv_publish(&mut self) -> PublishPacket {
        match self.recv_packet().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    /// Assert that nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        match timeout(wait, self.recv_frame()).await {
            Err(_elapsed) => {}
            Ok(None) => panic!("broker closed the connection"),
            Ok(Some(frame)) => panic!("unexpected frame from broker: {frame:?}"),
        }
    }

    /// Assert the broker closed the stream.
    pub async fn expect_closed(&mut self) {
        match timeout(Duration::from_secs(2), self.recv_frame()).await {
            Ok(None) => {}
            Ok(Some(frame)) => panic!("expected close, got frame {frame:?}"),
            Err(_elapsed) => panic!("expected close, connection still open"),
        }
    }

    /// Send PINGREQ and assert the two-byte PINGRESP comes back.
    pub async fn ping(&mut self) {
        self.send(&PingRequestPacket::new()).await;
        let frame = self.recv_frame().await.expect("no PINGRESP");
        assert_eq!(frame, vec![0xd0, 0x00]);
    }

    /// Send a clean DISCONNECT.
    pub async fn disconnect(&mut self) {
        self.send(&DisconnectPacket::new()).await;
    }
}
