// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

mod common;
use common::{TestClient, TestServer};

#[tokio::test]
async fn test_ping_round_trip() {
    let server = TestServer::start(18941).await;
    let mut client = TestClient::connect(server.address(), "pinger").await;

    // 0xC0 0x00 in, 0xD0 0x00 back.
    client.send_raw(&[0xc0, 0x00]).await;
    let frame = client.recv_frame().await.expect("no PINGRESP");
    assert_eq!(frame, vec![0xd0, 0x00]);

    // Repeatable on the same connection.
    client.ping().await;
    client.ping().await;

    server.terminate();
}
