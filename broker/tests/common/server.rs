// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fs;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::sleep;

use gale::{Config, Server};

const TEST_DIR: &str = "/tmp/gale-tests";

/// An in-process broker bound to a test port.
pub struct TestServer {
    address: String,
    shutdown: broadcast::Sender<()>,
}

impl TestServer {
    /// Start a broker on 127.0.0.1:`port` with `extra` appended to the
    /// `[general]` config section, and wait until it accepts connections.
    pub async fn start_with(port: u16, extra: &str) -> Self {
        fs::create_dir_all(TEST_DIR).unwrap();
        let address = format!("127.0.0.1:{port}");
        let content = format!(
            r#"
[general]
listen_address = "{address}"
{extra}

[log]
console_log = false
"#
        );
        let filename = format!("{TEST_DIR}/gale-{port}.toml");
        fs::write(&filename, content).unwrap();
        let config = Config::load(&filename).unwrap();

        let server = Server::new(config);
        let shutdown = server.shutdown_handle();
        tokio::spawn(async move {
            if let Err(err) = server.run().await {
                panic!("broker failed to run: {err}");
            }
        });

        // Wait for the listener to come up.
        for _ in 0..100 {
            if TcpStream::connect(&address).await.is_ok() {
                return Self { address, shutdown };
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("broker on {address} never became reachable");
    }

    pub async fn start(port: u16) -> Self {
        Self::start_with(port, "").await
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn terminate(&self) {
        let _ = self.shutdown.send(());
    }
}
