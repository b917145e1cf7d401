// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::{ByteArray, ConnectPacket, Packet, ReasonCode};

mod common;
use common::{TestClient, TestServer};

#[tokio::test]
async fn test_oversized_packet_disconnected() {
    let server = TestServer::start_with(18971, "max_packet_size = 64").await;
    let mut client = TestClient::connect(server.address(), "big").await;

    client.publish("t", &[0xab; 100]).await;

    match client.recv_packet().await {
        Packet::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason_code(), ReasonCode::PacketTooLarge);
        }
        other => panic!("expected DISCONNECT, got {other:?}"),
    }
    client.expect_closed().await;

    server.terminate();
}

#[tokio::test]
async fn test_keep_alive_enforced() {
    let server = TestServer::start(18972).await;
    let mut client = TestClient::open(server.address()).await;

    let mut packet = ConnectPacket::new("sleepy").unwrap();
    packet.set_keep_alive(1);
    client.send(&packet).await;
    match client.recv_packet().await {
        Packet::ConnectAck(ack) => assert_eq!(ack.reason_code(), ReasonCode::Success),
        other => panic!("expected CONNACK, got {other:?}"),
    }

    // Stay silent past 1.5 x keep alive; the broker must give up on us.
    let frame = client.recv_frame().await.expect("expected DISCONNECT");
    let mut ba = ByteArray::new(&frame);
    match Packet::decode(&mut ba).unwrap() {
        Packet::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason_code(), ReasonCode::KeepAliveTimeout);
        }
        other => panic!("expected DISCONNECT, got {other:?}"),
    }
    client.expect_closed().await;

    server.terminate();
}

#[tokio::test]
async fn test_malformed_packet_disconnected() {
    let server = TestServer::start(18973).await;
    let mut client = TestClient::connect(server.address(), "garbled").await;

    // Type nibble 0 is not a packet.
    client.send_raw(&[0x00, 0x00]).await;

    match client.recv_packet().await {
        Packet::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason_code(), ReasonCode::MalformedPacket);
        }
        other => panic!("expected DISCONNECT, got {other:?}"),
    }
    client.expect_closed().await;

    server.terminate();
}

#[tokio::test]
async fn test_unsupported_packet_disconnected() {
    let server = TestServer::start(18974).await;
    let mut client = TestClient::connect(server.address(), "eager").await;

    // A well-formed PUBACK; QoS flows are not served.
    client.send_raw(&[0x40, 0x02, 0x00, 0x01]).await;

    match client.recv_packet().await {
        Packet::Disconnect(disconnect) => {
            assert_eq!(
                disconnect.reason_code(),
                ReasonCode::ImplementationSpecificError
            );
        }
        other => panic!("expected DISCONNECT, got {other:?}"),
    }
    client.expect_closed().await;

    server.terminate();
}
