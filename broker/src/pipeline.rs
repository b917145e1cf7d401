// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Per-connection packet pipeline.
//!
//! Three cooperating tasks per connection:
//! - the **reader** frames the byte stream into complete packets and hands
//!   each one, in a pooled buffer, to the dispatcher channel;
//! - the **dispatcher** decodes and routes: ping replies, subscription
//!   changes, publish fan-out, disconnect;
//! - the **writer** drains the outbound channel to the socket and returns
//!   each buffer to the pool.
//!
//! A pooled buffer is owned by exactly one task at a time: reader ->
//! dispatcher -> (copy per subscriber) -> that subscriber's writer -> pool.

use std::sync::Arc;

use codec::{
    ByteArray, DecodeError, DecodePacket, DisconnectPacket, EncodePacket, FixedHeader, PacketType,
    PublishPacket, QoS, ReasonCode, SubTopic, SubscribeAckPacket, SubscribePacket,
    UnsubscribeAckPacket, UnsubscribePacket,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{self, Duration};

use crate::buffer_pool::BufferPool;
use crate::session::{SessionHandle, SessionRegistry, SubscriptionMap};
use crate::trie::TopicIndex;
use crate::types::ClientId;

/// One complete control packet: its fixed header plus the full frame bytes
/// (header included) in a pooled buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    pub header: FixedHeader,
    pub bytes: Vec<u8>,
}

/// Why the framer stopped producing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Peer closed the stream.
    Closed,

    /// Byte-layout violation in the fixed header.
    Malformed,

    /// Declared packet length exceeds the configured maximum.
    Oversized,

    /// Keep-alive grace period expired without traffic.
    KeepAlive,

    /// Socket error.
    Io,
}

/// Incremental packet framer over a raw byte stream.
///
/// Keeps a single accumulation buffer of `max_packet_size` bytes. Short
/// header reads surface as `InsufficientData` from the codec and mean "read
/// more"; a fixed header still incomplete after 5 buffered bytes can never
/// complete and aborts the connection.
#[derive(Debug)]
pub struct Framer {
    buf: Vec<u8>,
    accum: usize,
}

/// A fixed header is at most 1 type byte + 4 length bytes.
const MAX_FIXED_HEADER_BYTES: usize = 5;

impl Framer {
    #[must_use]
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buf: vec![0u8; max_packet_size],
            accum: 0,
        }
    }

    /// Read from `stream` until one complete frame is buffered, then return
    /// it in a buffer acquired from `pool`. Residual bytes of a following
    /// packet stay accumulated for the next call.
    ///
    /// # Errors
    ///
    /// Returns `FrameError` when the stream ends, errors, or violates the
    /// framing rules.
    pub async fn next_frame<R>(
        &mut self,
        stream: &mut R,
        pool: &BufferPool,
    ) -> Result<Frame, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if self.accum >= 2 {
                let mut ba = ByteArray::new(&self.buf[..self.accum]);
                match FixedHeader::decode(&mut ba) {
                    Ok(header) => {
                        let total = header.bytes() + header.remaining_length();
                        if total > self.buf.len() {
                            return Err(FrameError::Oversized);
                        }
                        if total <= self.accum {
                            let mut bytes = pool.acquire();
                            bytes.extend_from_slice(&self.buf[..total]);
                            self.buf.copy_within(total..self.accum, 0);
                            self.accum -= total;
                            return Ok(Frame { header, bytes });
                        }
                    }
                    Err(DecodeError::InsufficientData) => {
                        if self.accum > MAX_FIXED_HEADER_BYTES {
                            return Err(FrameError::Malformed);
                        }
                    }
                    Err(_) => return Err(FrameError::Malformed),
                }
            }

            let n = stream
                .read(&mut self.buf[self.accum..])
                .await
                .map_err(|_| FrameError::Io)?;
            if n == 0 {
                return Err(FrameError::Closed);
            }
            self.accum += n;
        }
    }
}

/// Encode a DISCONNECT with `reason` into a pooled buffer and queue it on
/// the writer. Best effort: a closed channel only means the writer is
/// already gone.
pub(crate) async fn send_disconnect(
    outbound: &mpsc::Sender<Vec<u8>>,
    pool: &BufferPool,
    reason: ReasonCode,
) {
    let packet = DisconnectPacket::with_reason(reason);
    let mut buf = pool.acquire();
    if packet.encode(&mut buf).is_err() {
        pool.release(buf);
        return;
    }
    if let Err(err) = outbound.send(buf).await {
        pool.release(err.0);
    }
}

/// Reader task: frame the socket into packets and feed the dispatcher.
///
/// Exits on socket close or error, after forwarding a DISCONNECT, when the
/// keep-alive grace period (1.5 x keep alive, per the protocol's grace
/// factor) passes without a packet, when the dispatcher tears the
/// connection down, or on broker shutdown. Framing violations queue a
/// DISCONNECT with the matching reason before exiting; the dispatcher
/// notices the closed channel and tears the session down.
pub(crate) async fn read_packets(
    mut stream: OwnedReadHalf,
    mut framer: Framer,
    inbound: mpsc::Sender<Frame>,
    outbound: mpsc::Sender<Vec<u8>>,
    pool: Arc<BufferPool>,
    keep_alive: u16,
    mut conn_shutdown: broadcast::Receiver<()>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let grace = (keep_alive > 0).then(|| Duration::from_millis(u64::from(keep_alive) * 1500));

    loop {
        let next = framer.next_frame(&mut stream, &pool);
        let result = tokio::select! {
            result = timeout_frame(grace, next) => result,
            // The dispatcher is gone; drop our outbound sender so the
            // writer can drain and close the socket.
            _ = conn_shutdown.recv() => return,
            _ = shutdown.recv() => {
                send_disconnect(&outbound, &pool, ReasonCode::ServerShuttingDown).await;
                return;
            }
        };

        match result {
            Ok(frame) => {
                let is_disconnect = frame.header.packet_type() == PacketType::Disconnect;
                if let Err(err) = inbound.send(frame).await {
                    pool.release(err.0.bytes);
                    return;
                }
                if is_disconnect {
                    return;
                }
            }
            Err(FrameError::Closed | FrameError::Io) => return,
            Err(FrameError::Malformed) => {
                send_disconnect(&outbound, &pool, ReasonCode::MalformedPacket).await;
                return;
            }
            Err(FrameError::Oversized) => {
                send_disconnect(&outbound, &pool, ReasonCode::PacketTooLarge).await;
                return;
            }
            Err(FrameError::KeepAlive) => {
                log::warn!("session: keep alive expired, disconnecting client");
                send_disconnect(&outbound, &pool, ReasonCode::KeepAliveTimeout).await;
                return;
            }
        }
    }
}

async fn timeout_frame<F>(grace: Option<Duration>, fut: F) -> Result<Frame, FrameError>
where
    F: std::future::Future<Output = Result<Frame, FrameError>>,
{
    match grace {
        Some(duration) => time::timeout(duration, fut)
            .await
            .unwrap_or(Err(FrameError::KeepAlive)),
        None => fut.await,
    }
}

/// Writer task: drain the outbound channel to the socket.
///
/// `write_all` retries partial writes until each frame is fully on the
/// wire. Every dequeued buffer goes back to the pool, written or not.
pub(crate) async fn write_frames(
    mut stream: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    pool: Arc<BufferPool>,
) {
    while let Some(frame) = outbound.recv().await {
        let result = stream.write_all(&frame).await;
        pool.release(frame);
        if let Err(err) = result {
            log::info!("writer: socket write failed: {err}");
            break;
        }
    }

    // Hand any queued frames back to the pool before exiting.
    outbound.close();
    while let Some(frame) = outbound.recv().await {
        pool.release(frame);
    }
}

/// Map a packet decode error onto a DISCONNECT reason by class:
/// semantically-wrong-but-well-formed input is a protocol error,
/// unimplemented packet kinds are implementation specific, everything else
/// is a malformed packet.
fn disconnect_reason(err: DecodeError) -> ReasonCode {
    match err {
        DecodeError::UnsupportedPacketType => ReasonCode::ImplementationSpecificError,
        DecodeError::DuplicateProperty
        | DecodeError::InvalidPacketId
        | DecodeError::InvalidConnectFlags
        | DecodeError::InvalidSubscribeOptions
        | DecodeError::EmptyTopicFilter => ReasonCode::ProtocolError,
        _ => ReasonCode::MalformedPacket,
    }
}

/// Dispatcher side of one connection. Runs on the connection's own task;
/// reader and writer run beside it.
pub struct Connection {
    client_id: ClientId,
    session: SessionHandle,
    registry: SessionRegistry,
    topic_index: Arc<RwLock<TopicIndex>>,
    pool: Arc<BufferPool>,
    outbound: mpsc::Sender<Vec<u8>>,
    conn_shutdown: broadcast::Sender<()>,
    subscriptions: SubscriptionMap,
}

impl Connection {
    #[must_use]
    pub fn new(
        session: SessionHandle,
        registry: SessionRegistry,
        topic_index: Arc<RwLock<TopicIndex>>,
        pool: Arc<BufferPool>,
        outbound: mpsc::Sender<Vec<u8>>,
        conn_shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            client_id: session.client_id().to_string(),
            session,
            registry,
            topic_index,
            pool,
            outbound,
            conn_shutdown,
            subscriptions: SubscriptionMap::new(),
        }
    }

    /// Dispatch loop. Returns once the connection is finished; the session
    /// is deregistered and its subscriptions removed before returning.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Frame>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                maybe_frame = inbound.recv() => {
                    let Some(frame) = maybe_frame else { break };
                    match self.dispatch(frame).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(reason) => {
                            send_disconnect(&self.outbound, &self.pool, reason).await;
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        self.cleanup().await;
    }

    /// Route one frame. `Ok(true)` keeps the connection running, `Ok(false)`
    /// ends it cleanly, `Err` ends it with a DISCONNECT carrying the reason.
    async fn dispatch(&mut self, frame: Frame) -> Result<bool, ReasonCode> {
        match frame.header.packet_type() {
            PacketType::PingRequest => self.on_ping(frame).await,
            PacketType::Publish { qos, .. } => self.on_publish(frame, qos).await,
            PacketType::Subscribe => self.on_subscribe(frame).await,
            PacketType::Unsubscribe => self.on_unsubscribe(frame).await,
            PacketType::Disconnect => {
                log::info!("session: client {} disconnected", self.client_id);
                self.pool.release(frame.bytes);
                Ok(false)
            }
            PacketType::PublishAck
            | PacketType::PublishReceived
            | PacketType::PublishRelease
            | PacketType::PublishComplete
            | PacketType::Auth => {
                log::warn!(
                    "session: unsupported packet {:?} from {}",
                    frame.header.packet_type(),
                    self.client_id
                );
                self.pool.release(frame.bytes);
                Err(ReasonCode::ImplementationSpecificError)
            }
            // CONNECT after the handshake, or a server-to-client packet
            // arriving from a client.
            _ => {
                self.pool.release(frame.bytes);
                Err(ReasonCode::ProtocolError)
            }
        }
    }

    async fn on_ping(&mut self, mut frame: Frame) -> Result<bool, ReasonCode> {
        if frame.header.remaining_length() != 0 {
            self.pool.release(frame.bytes);
            return Err(ReasonCode::MalformedPacket);
        }

        // PINGRESP is PINGREQ with the type nibble rewritten; reuse the
        // inbound buffer instead of encoding a fresh packet.
        frame.bytes[0] = 0xd0;
        frame.bytes[1] = 0x00;
        frame.bytes.truncate(2);
        if let Err(err) = self.outbound.send(frame.bytes).await {
            self.pool.release(err.0);
            return Ok(false);
        }
        Ok(true)
    }

    async fn on_publish(&mut self, frame: Frame, qos: QoS) -> Result<bool, ReasonCode> {
        if qos != QoS::AtMostOnce {
            // QoS 1/2 acknowledgement flows are not implemented.
            self.pool.release(frame.bytes);
            return Err(ReasonCode::ImplementationSpecificError);
        }

        let packet = {
            let mut ba = ByteArray::new(&frame.bytes);
            match PublishPacket::decode(&mut ba) {
                Ok(packet) => packet,
                Err(err) => {
                    self.pool.release(frame.bytes);
                    return Err(disconnect_reason(err));
                }
            }
        };

        let subscribers = {
            let index = self.topic_index.read().await;
            index.match_topic(packet.topic())
        };

        let mut dead: Vec<ClientId> = Vec::new();
        for subscriber in subscribers {
            if subscriber.no_local && subscriber.client_id == self.client_id {
                continue;
            }

            let handle = {
                let registry = self.registry.read().await;
                registry.get(&subscriber.client_id).cloned()
            };
            let Some(handle) = handle else { continue };

            if !handle.is_live() {
                dead.push(subscriber.client_id);
                continue;
            }

            // Each recipient gets its own pooled copy of the frame. Writers
            // release their buffers independently; a shared buffer would be
            // zeroed by the first writer under the feet of the others.
            let mut copy = self.pool.acquire();
            copy.extend_from_slice(&frame.bytes);
            if let Err(err) = handle.outbound().send(copy).await {
                self.pool.release(err.0);
                dead.push(subscriber.client_id);
            }
        }
        self.pool.release(frame.bytes);

        for client_id in dead {
            self.evict(&client_id).await;
        }
        Ok(true)
    }

    async fn on_subscribe(&mut self, frame: Frame) -> Result<bool, ReasonCode> {
        let packet = {
            let mut ba = ByteArray::new(&frame.bytes);
            match SubscribePacket::decode(&mut ba) {
                Ok(packet) => packet,
                Err(err) => {
                    self.pool.release(frame.bytes);
                    return Err(disconnect_reason(err));
                }
            }
        };
        self.pool.release(frame.bytes);

        let mut reasons = Vec::with_capacity(packet.topics().len());
        {
            let mut index = self.topic_index.write().await;
            for topic in packet.topics() {
                match SubTopic::parse(topic.filter()) {
                    Ok(filter) => {
                        index.subscribe(&filter, &self.client_id, topic.options().no_local());
                        self.subscriptions
                            .insert(topic.filter().to_string(), topic.options());
                        // Only QoS 0 delivery exists, whatever was requested.
                        reasons.push(ReasonCode::Success);
                    }
                    Err(err) => {
                        log::warn!(
                            "session: invalid filter {:?} from {}: {err:?}",
                            topic.filter(),
                            self.client_id
                        );
                        reasons.push(ReasonCode::TopicFilterInvalid);
                    }
                }
            }
        }

        let ack = SubscribeAckPacket::with_vec(packet.packet_id(), reasons);
        self.send_packet(&ack).await
    }

    async fn on_unsubscribe(&mut self, frame: Frame) -> Result<bool, ReasonCode> {
        let packet = {
            let mut ba = ByteArray::new(&frame.bytes);
            match UnsubscribePacket::decode(&mut ba) {
                Ok(packet) => packet,
                Err(err) => {
                    self.pool.release(frame.bytes);
                    return Err(disconnect_reason(err));
                }
            }
        };
        self.pool.release(frame.bytes);

        let mut reasons = Vec::with_capacity(packet.topics().len());
        {
            let mut index = self.topic_index.write().await;
            for topic in packet.topics() {
                match SubTopic::parse(topic.as_ref()) {
                    Ok(filter) => {
                        let existed = index.unsubscribe(&filter, &self.client_id);
                        self.subscriptions.remove(topic.as_ref());
                        reasons.push(if existed {
                            ReasonCode::Success
                        } else {
                            ReasonCode::NoSubscriptionExisted
                        });
                    }
                    Err(_) => reasons.push(ReasonCode::TopicFilterInvalid),
                }
            }
        }

        let ack = UnsubscribeAckPacket::with_vec(packet.packet_id(), reasons);
        self.send_packet(&ack).await
    }

    async fn send_packet<P: EncodePacket>(&self, packet: &P) -> Result<bool, ReasonCode> {
        let mut buf = self.pool.acquire();
        if packet.encode(&mut buf).is_err() {
            self.pool.release(buf);
            return Err(ReasonCode::ImplementationSpecificError);
        }
        if let Err(err) = self.outbound.send(buf).await {
            self.pool.release(err.0);
            return Ok(false);
        }
        Ok(true)
    }

    /// Remove a subscriber whose session is gone. Fan-out discovers dead
    /// sessions lazily; this is where they leave the registry and the trie.
    async fn evict(&self, client_id: &str) {
        log::info!("session: evicting dead subscriber {client_id}");
        if let Some(handle) = self.registry.write().await.remove(client_id) {
            handle.mark_dead();
        }
        self.topic_index.write().await.remove_client(client_id);
    }

    async fn cleanup(&mut self) {
        self.session.mark_dead();
        self.registry.write().await.remove(&self.client_id);
        self.topic_index.write().await.remove_client(&self.client_id);
        // Unblock the reader if it is still parked on the socket.
        let _ = self.conn_shutdown.send(());
        log::info!("session: {} closed", self.client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::PingRequestPacket;

    fn pool() -> BufferPool {
        BufferPool::new(4, 1024)
    }

    #[tokio::test]
    async fn test_framer_single_frame() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let pool = pool();
        let mut framer = Framer::new(1024);

        let mut buf = Vec::new();
        PingRequestPacket::new().encode(&mut buf).unwrap();
        client.write_all(&buf).await.unwrap();

        let frame = framer.next_frame(&mut server, &pool).await.unwrap();
        assert_eq!(frame.header.packet_type(), PacketType::PingRequest);
        assert_eq!(frame.bytes, vec![0xc0, 0x00]);
    }

    #[tokio::test]
    async fn test_framer_split_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let pool = pool();
        let mut framer = Framer::new(1024);

        let mut buf = Vec::new();
        let publish = PublishPacket::new("a/b", QoS::AtMostOnce, b"payload").unwrap();
        publish.encode(&mut buf).unwrap();

        let (first, second) = buf.split_at(3);
        let first = first.to_vec();
        let second = second.to_vec();
        let writer = tokio::spawn(async move {
            client.write_all(&first).await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(&second).await.unwrap();
            client
        });

        let frame = framer.next_frame(&mut server, &pool).await.unwrap();
        assert_eq!(frame.bytes, buf);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_framer_two_frames_one_read() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let pool = pool();
        let mut framer = Framer::new(1024);

        let mut buf = Vec::new();
        PingRequestPacket::new().encode(&mut buf).unwrap();
        PingRequestPacket::new().encode(&mut buf).unwrap();
        client.write_all(&buf).await.unwrap();

        let first = framer.next_frame(&mut server, &pool).await.unwrap();
        let second = framer.next_frame(&mut server, &pool).await.unwrap();
        assert_eq!(first.bytes, vec![0xc0, 0x00]);
        assert_eq!(second.bytes, vec![0xc0, 0x00]);
    }

    #[tokio::test]
    async fn test_framer_rejects_bad_flags() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let pool = pool();
        let mut framer = Framer::new(1024);

        // CONNECT with non-zero reserved flags.
        client.write_all(&[0x1f, 0x00]).await.unwrap();
        assert_eq!(
            framer.next_frame(&mut server, &pool).await,
            Err(FrameError::Malformed)
        );
    }

    #[tokio::test]
    async fn test_framer_rejects_oversized() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let pool = pool();
        let mut framer = Framer::new(64);

        // PUBLISH claiming 200 remaining bytes against a 64-byte cap.
        client.write_all(&[0x30, 0xc8, 0x01]).await.unwrap();
        assert_eq!(
            framer.next_frame(&mut server, &pool).await,
            Err(FrameError::Oversized)
        );
    }

    #[tokio::test]
    async fn test_framer_closed_stream() {
        let (client, mut server) = tokio::io::duplex(256);
        let pool = pool();
        let mut framer = Framer::new(1024);
        drop(client);
        assert_eq!(
            framer.next_frame(&mut server, &pool).await,
            Err(FrameError::Closed)
        );
    }

    #[test]
    fn test_disconnect_reason_classes() {
        assert_eq!(
            disconnect_reason(DecodeError::InvalidString),
            ReasonCode::MalformedPacket
        );
        assert_eq!(
            disconnect_reason(DecodeError::DuplicateProperty),
            ReasonCode::ProtocolError
        );
        assert_eq!(
            disconnect_reason(DecodeError::UnsupportedPacketType),
            ReasonCode::ImplementationSpecificError
        );
    }

    #[test]
    fn test_frame_error_is_distinct_from_malformed() {
        // The framer relies on the codec keeping partial input distinct
        // from corrupt input.
        let buf = [0x30];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            FixedHeader::decode(&mut ba),
            Err(DecodeError::InsufficientData)
        );
    }
}
