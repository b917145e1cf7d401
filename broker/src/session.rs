// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Per-client session state shared with the rest of the broker.
//!
//! The handle owns the sending side of the session's outbound frame channel
//! and an atomic liveness flag. The reader side flips the flag on
//! disconnect; fan-out observes it lazily and evicts dead sessions from the
//! registry when it trips over them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use codec::{ConnectPacket, Property, PropertyType, QoS};
use tokio::sync::{mpsc, RwLock};

use crate::types::ClientId;

/// Will message parsed from CONNECT and parked on the session.
///
/// Delivery on abnormal disconnect is not implemented yet; the session keeps
/// the message so the delivery path has somewhere to start from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub delay_interval: u32,
}

impl WillMessage {
    /// Extract the will message of `packet`, if its will flag is set.
    #[must_use]
    pub fn from_connect(packet: &ConnectPacket) -> Option<Self> {
        let topic = packet.will_topic()?;
        let delay_interval = match packet
            .will_properties()
            .get(PropertyType::WillDelayInterval)
        {
            Some(Property::WillDelayInterval(value)) => value.value(),
            _ => 0,
        };
        Some(Self {
            topic: topic.as_ref().to_string(),
            payload: packet.will_message().to_vec(),
            qos: packet.connect_flags().will_qos(),
            retain: packet.connect_flags().will_retain(),
            delay_interval,
        })
    }
}

/// Shared handle to one client session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    client_id: ClientId,
    outbound: mpsc::Sender<Vec<u8>>,
    live: Arc<AtomicBool>,
    keep_alive: u16,
    will: Option<WillMessage>,
}

impl SessionHandle {
    #[must_use]
    pub fn new(
        client_id: ClientId,
        outbound: mpsc::Sender<Vec<u8>>,
        keep_alive: u16,
        will: Option<WillMessage>,
    ) -> Self {
        Self {
            client_id,
            outbound,
            live: Arc::new(AtomicBool::new(true)),
            keep_alive,
            will,
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub const fn outbound(&self) -> &mpsc::Sender<Vec<u8>> {
        &self.outbound
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.live.store(false, Ordering::Release);
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    #[must_use]
    pub const fn will(&self) -> Option<&WillMessage> {
        self.will.as_ref()
    }
}

/// Registry of live sessions keyed by client id. Session takeover would key
/// off this map; for now a duplicate client id is refused at CONNECT.
pub type SessionRegistry = Arc<RwLock<HashMap<ClientId, SessionHandle>>>;

/// Per-connection view of the filters this client subscribed, with the
/// options it asked for. Used to answer UNSUBSCRIBE and kept as the seam
/// for retained-message handling.
pub type SubscriptionMap = HashMap<String, codec::SubscribeOptions>;
