// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Broker server: the accept loop, the CONNECT/CONNACK handshake, and the
//! resources shared by every connection (buffer pool, topic index, session
//! registry, shutdown signal).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use codec::{
    utils::random_string, ByteArray, ConnectAckPacket, ConnectPacket, DecodeError, DecodePacket,
    EncodePacket, PacketType, Property, ReasonCode, StringData,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::timeout;

use crate::auth::{AllowAll, Authenticator};
use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::pipeline::{self, Connection, Framer};
use crate::session::{SessionHandle, SessionRegistry, WillMessage};
use crate::trie::TopicIndex;

/// Length of server-assigned client identifiers.
const ASSIGNED_CLIENT_ID_LEN: usize = 16;

/// The broker. One instance owns the listener and all shared state.
pub struct Server {
    config: Config,
    pool: Arc<BufferPool>,
    topic_index: Arc<RwLock<TopicIndex>>,
    registry: SessionRegistry,
    authenticator: Arc<dyn Authenticator>,
    shutdown: broadcast::Sender<()>,
}

impl Server {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let pool = Arc::new(BufferPool::new(
            config.general().pool_capacity(),
            config.general().buffer_capacity(),
        ));
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            pool,
            topic_index: Arc::new(RwLock::new(TopicIndex::new())),
            registry: Arc::new(RwLock::new(HashMap::new())),
            authenticator: Arc::new(AllowAll),
            shutdown,
        }
    }

    /// Replace the connect-time authentication hook.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Get a handle that triggers broker-wide shutdown when sent to.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Bind the listener and serve until shutdown is signalled.
    ///
    /// # Errors
    ///
    /// Returns error if the listen address cannot be bound; everything after
    /// that is connection-local and never tears the broker down.
    pub async fn run(&self) -> Result<(), Error> {
        let address = self.config.general().listen_address();
        let listener = TcpListener::bind(address).await.map_err(|err| {
            Error::from_string(
                ErrorKind::SocketError,
                format!("Failed to bind to {address}, {err}"),
            )
        })?;
        log::info!("server: listening on {address}");

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    log::info!("server: shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let ctx = ConnectionContext {
                                config: self.config.clone(),
                                pool: Arc::clone(&self.pool),
                                topic_index: Arc::clone(&self.topic_index),
                                registry: Arc::clone(&self.registry),
                                authenticator: Arc::clone(&self.authenticator),
                                shutdown: self.shutdown.clone(),
                            };
                            tokio::spawn(async move {
                                handle_connection(ctx, stream, peer).await;
                            });
                        }
                        Err(err) => {
                            log::error!("server: accept failed: {err}");
                        }
                    }
                }
            }
        }
    }
}

/// Everything one connection task needs from the server.
struct ConnectionContext {
    config: Config,
    pool: Arc<BufferPool>,
    topic_index: Arc<RwLock<TopicIndex>>,
    registry: SessionRegistry,
    authenticator: Arc<dyn Authenticator>,
    shutdown: broadcast::Sender<()>,
}

/// Drive one client connection from handshake to teardown.
async fn handle_connection(ctx: ConnectionContext, mut stream: TcpStream, peer: SocketAddr) {
    let general = ctx.config.general();
    let mut framer = Framer::new(general.max_packet_size());

    // The pre-CONNECT read deadline. After the handshake the keep-alive
    // value from CONNECT governs instead.
    let first_frame = match timeout(
        general.connect_deadline(),
        framer.next_frame(&mut stream, &ctx.pool),
    )
    .await
    {
        Ok(Ok(frame)) => frame,
        Ok(Err(err)) => {
            log::info!("server: no valid packet from {peer}: {err:?}");
            return;
        }
        Err(_elapsed) => {
            log::info!("server: connect deadline expired for {peer}");
            return;
        }
    };

    // The first packet MUST be CONNECT [MQTT-3.1.0-1]; anything else closes
    // the connection without a CONNACK.
    if first_frame.header.packet_type() != PacketType::Connect {
        log::info!(
            "server: first packet from {peer} is {:?}, closing",
            first_frame.header.packet_type()
        );
        ctx.pool.release(first_frame.bytes);
        return;
    }

    let connect = {
        let mut ba = ByteArray::new(&first_frame.bytes);
        ConnectPacket::decode(&mut ba)
    };
    ctx.pool.release(first_frame.bytes);

    let connect = match connect {
        Ok(packet) => packet,
        Err(DecodeError::UnsupportedProtocolVersion) => {
            // Versions other than 5 get a CONNACK with reason 132, then the
            // connection closes.
            let ack = ConnectAckPacket::new(false, ReasonCode::UnsupportedProtocolVersion);
            send_direct(&mut stream, &ctx.pool, &ack).await;
            return;
        }
        Err(err) => {
            // Pre-handshake malformed packet: close without CONNACK.
            log::info!("server: invalid CONNECT from {peer}: {err:?}");
            return;
        }
    };

    if !ctx.authenticator.authenticate(
        connect.client_id(),
        connect.username(),
        connect.password(),
    ) {
        let ack = ConnectAckPacket::new(false, ReasonCode::NotAuthorized);
        send_direct(&mut stream, &ctx.pool, &ack).await;
        return;
    }

    // A zero-length client id asks the server to assign one; the assignment
    // is echoed back in the CONNACK properties.
    let (client_id, assigned) = if connect.client_id().is_empty() {
        (random_string(ASSIGNED_CLIENT_ID_LEN), true)
    } else {
        (connect.client_id().to_string(), false)
    };

    let keep_alive = connect.keep_alive();
    let will = WillMessage::from_connect(&connect);

    let (outbound_tx, outbound_rx) = mpsc::channel(general.outbound_channel_depth());
    let session = SessionHandle::new(client_id.clone(), outbound_tx.clone(), keep_alive, will);

    // Register, refusing a second live session under the same client id.
    // Session takeover would start here.
    {
        let mut registry = ctx.registry.write().await;
        if registry.contains_key(&client_id) {
            drop(registry);
            log::warn!("server: client id {client_id} already connected, refusing {peer}");
            let ack = ConnectAckPacket::new(false, ReasonCode::ServerBusy);
            send_direct(&mut stream, &ctx.pool, &ack).await;
            return;
        }
        registry.insert(client_id.clone(), session.clone());
    }

    let mut ack = ConnectAckPacket::new(false, ReasonCode::Success);
    if assigned {
        if let Ok(id) = StringData::from(&client_id) {
            ack.properties_mut()
                .push(Property::AssignedClientIdentifier(id));
        }
    }
    if !send_direct(&mut stream, &ctx.pool, &ack).await {
        ctx.registry.write().await.remove(&client_id);
        return;
    }
    log::info!("server: client {client_id} connected from {peer}, keep alive {keep_alive}s");

    // Handshake done: split the stream and start the pipeline.
    let (read_half, write_half) = stream.into_split();
    let (inbound_tx, inbound_rx) = mpsc::channel(general.inbound_channel_depth());
    let (conn_shutdown_tx, conn_shutdown_rx) = broadcast::channel(1);

    tokio::spawn(pipeline::write_frames(
        write_half,
        outbound_rx,
        Arc::clone(&ctx.pool),
    ));
    tokio::spawn(pipeline::read_packets(
        read_half,
        framer,
        inbound_tx,
        outbound_tx.clone(),
        Arc::clone(&ctx.pool),
        keep_alive,
        conn_shutdown_rx,
        ctx.shutdown.subscribe(),
    ));

    let connection = Connection::new(
        session,
        Arc::clone(&ctx.registry),
        Arc::clone(&ctx.topic_index),
        Arc::clone(&ctx.pool),
        outbound_tx,
        conn_shutdown_tx,
    );
    connection.run(inbound_rx, ctx.shutdown.subscribe()).await;
}

/// Encode `packet` into a pooled buffer and write it straight to the
/// socket. Used during the handshake, before the writer task exists.
/// Returns false if the write failed.
async fn send_direct<P: EncodePacket>(
    stream: &mut TcpStream,
    pool: &BufferPool,
    packet: &P,
) -> bool {
    let mut buf = pool.acquire();
    if packet.encode(&mut buf).is_err() {
        pool.release(buf);
        return false;
    }
    let result = stream.write_all(&buf).await;
    pool.release(buf);
    match result {
        Ok(()) => true,
        Err(err) => {
            log::info!("server: handshake write failed: {err}");
            false
        }
    }
}
