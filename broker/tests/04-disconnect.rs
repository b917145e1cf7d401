// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::time::Duration;

use codec::ReasonCode;
use tokio::time::sleep;

mod common;
use common::{TestClient, TestServer};

#[tokio::test]
async fn test_disconnect_cleans_subscriptions() {
    let server = TestServer::start(18961).await;

    let mut quitter = TestClient::connect(server.address(), "quitter").await;
    quitter.subscribe("x", 1).await;
    quitter.disconnect().await;
    quitter.expect_closed().await;

    // Give the broker a moment to finish the teardown.
    sleep(Duration::from_millis(100)).await;

    // Publishing to the dead subscription is a no-op, not an error.
    let mut publisher = TestClient::connect(server.address(), "p").await;
    publisher.publish("x", b"anyone?").await;
    publisher.ping().await;

    // A fresh subscriber still works.
    let mut fresh = TestClient::connect(server.address(), "fresh").await;
    fresh.subscribe("x", 1).await;
    publisher.publish("x", b"hello").await;
    assert_eq!(fresh.recv_publish().await.message(), b"hello");

    server.terminate();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = TestServer::start(18962).await;

    let mut subscriber = TestClient::connect(server.address(), "sub").await;
    subscriber.subscribe("x/y", 1).await;

    let ack = subscriber.unsubscribe("x/y", 2).await;
    assert_eq!(ack.reasons(), [ReasonCode::Success]);

    // Unsubscribing again reports that nothing existed.
    let ack = subscriber.unsubscribe("x/y", 3).await;
    assert_eq!(ack.reasons(), [ReasonCode::NoSubscriptionExisted]);

    let mut publisher = TestClient::connect(server.address(), "p").await;
    publisher.publish("x/y", b"void").await;
    subscriber.expect_silence(Duration::from_millis(300)).await;

    server.terminate();
}
