// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::path::PathBuf;

use clap::Parser;
use gale::{Config, Error, Server};

/// MQTT 5.0 broker.
#[derive(Debug, Parser)]
#[command(name = "gale", version, about)]
struct Args {
    /// Path to config file. Built-in defaults are used when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    gale::log::init_log(config.log())?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let server = Server::new(config);

        let shutdown = server.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("gale: interrupt received");
                let _ = shutdown.send(());
            }
        });

        server.run().await
    })
}
