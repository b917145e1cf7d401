// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::property::check_property_type_list;
use crate::{
    utils::validate_client_id, BinaryData, ByteArray, DecodeError, DecodePacket, EncodeError,
    EncodePacket, FixedHeader, PacketTrait, PacketType, Properties, PropertyType, PubTopic, QoS,
    StringData, VarIntError,
};

/// Protocol name is a length-prefixed "MQTT", 6 bytes on the wire.
const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_NAME_BYTES: usize = 2 + 4;
const PROTOCOL_LEVEL: u8 = 5;

/// Properties available in the CONNECT variable header.
pub const CONNECT_PROPERTIES: &[PropertyType] = &[
    PropertyType::SessionExpiryInterval,
    PropertyType::ReceiveMaximum,
    PropertyType::MaximumPacketSize,
    PropertyType::TopicAliasMaximum,
    PropertyType::RequestResponseInformation,
    PropertyType::RequestProblemInformation,
    PropertyType::UserProperty,
    PropertyType::AuthenticationMethod,
    PropertyType::AuthenticationData,
];

/// Properties available in the will property section of the CONNECT payload.
pub const WILL_PROPERTIES: &[PropertyType] = &[
    PropertyType::WillDelayInterval,
    PropertyType::PayloadFormatIndicator,
    PropertyType::MessageExpiryInterval,
    PropertyType::ContentType,
    PropertyType::ResponseTopic,
    PropertyType::CorrelationData,
    PropertyType::UserProperty,
];

/// The connect flags byte of the CONNECT variable header.
///
/// ```txt
///  7 6 5 4 3 2 1 0
/// +-+-+-+-+-+-+-+-+
/// |U|P|R| Q |W|C|0|
/// +-+-+-+-+-+-+-+-+
/// ```
///
/// U = username flag, P = password flag, R = will retain, Q = will QoS,
/// W = will flag, C = clean start. Bit 0 is reserved and MUST be zero
/// [MQTT-3.1.2-3].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFlags {
    clean_start: bool,
    will: bool,
    will_qos: QoS,
    will_retain: bool,
    has_password: bool,
    has_username: bool,
}

impl ConnectFlags {
    #[must_use]
    pub const fn clean_start(&self) -> bool {
        self.clean_start
    }

    #[must_use]
    pub const fn will(&self) -> bool {
        self.will
    }

    #[must_use]
    pub const fn will_qos(&self) -> QoS {
        self.will_qos
    }

    #[must_use]
    pub const fn will_retain(&self) -> bool {
        self.will_retain
    }

    #[must_use]
    pub const fn has_password(&self) -> bool {
        self.has_password
    }

    #[must_use]
    pub const fn has_username(&self) -> bool {
        self.has_username
    }
}

impl DecodePacket for ConnectFlags {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let byte = ba.read_byte()?;

        if byte & 0b0000_0001 != 0 {
            return Err(DecodeError::InvalidConnectFlags);
        }

        let clean_start = byte & 0b0000_0010 != 0;
        let will = byte & 0b0000_0100 != 0;
        let will_qos = QoS::try_from((byte & 0b0001_1000) >> 3)?;
        let will_retain = byte & 0b0010_0000 != 0;
        let has_password = byte & 0b0100_0000 != 0;
        let has_username = byte & 0b1000_0000 != 0;

        // If the Will Flag is set to 0, then Will QoS MUST be 0 and Will
        // Retain MUST be 0 [MQTT-3.1.2-11, MQTT-3.1.2-13].
        if !will && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(DecodeError::InvalidConnectFlags);
        }

        Ok(Self {
            clean_start,
            will,
            will_qos,
            will_retain,
            has_password,
            has_username,
        })
    }
}

impl EncodePacket for ConnectFlags {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let mut byte = 0u8;
        if self.clean_start {
            byte |= 0b0000_0010;
        }
        if self.will {
            byte |= 0b0000_0100;
        }
        byte |= (self.will_qos as u8) << 3;
        if self.will_retain {
            byte |= 0b0010_0000;
        }
        if self.has_password {
            byte |= 0b0100_0000;
        }
        if self.has_username {
            byte |= 0b1000_0000;
        }
        buf.push(byte);
        Ok(1)
    }
}

/// CONNECT is the first packet sent from the Client to the Server once a
/// network connection is established.
///
/// Basic structure of packet:
///
/// ```txt
/// +--------------------------+
/// | Fixed header             |
/// +--------------------------+
/// | Protocol name "MQTT"     |
/// +--------------------------+
/// | Protocol level (5)       |
/// +--------------------------+
/// | Connect flags            |
/// +--------------------------+
/// | Keep alive               |
/// +--------------------------+
/// | Properties ...           |
/// +--------------------------+
/// | Client id                |
/// +--------------------------+
/// | Will properties ...      |
/// +--------------------------+
/// | Will topic               |
/// +--------------------------+
/// | Will payload             |
/// +--------------------------+
/// | Username                 |
/// +--------------------------+
/// | Password                 |
/// +--------------------------+
/// ```
///
/// The payload fields after the client id only appear when the matching
/// connect flag bit is set.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    connect_flags: ConnectFlags,
    keep_alive: u16,
    properties: Properties,

    client_id: StringData,
    will_properties: Properties,
    will_topic: Option<PubTopic>,
    will_message: BinaryData,
    username: StringData,
    password: BinaryData,
}

impl ConnectPacket {
    /// Create a connect packet with `client_id`.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        validate_client_id(client_id).map_err(|_| EncodeError::InvalidData)?;
        let client_id = StringData::from(client_id)?;
        Ok(Self {
            client_id,
            ..Self::default()
        })
    }

    pub fn set_clean_start(&mut self, clean_start: bool) -> &mut Self {
        self.connect_flags.clean_start = clean_start;
        self
    }

    #[must_use]
    pub const fn connect_flags(&self) -> &ConnectFlags {
        &self.connect_flags
    }

    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        self.client_id.as_ref()
    }

    /// Update will topic, payload, qos and retain flag all at once.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` or `payload` is invalid.
    pub fn set_will(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<&mut Self, EncodeError> {
        self.will_topic = Some(PubTopic::new(topic).map_err(|_| EncodeError::InvalidTopic)?);
        self.will_message = BinaryData::from_slice(payload)?;
        self.connect_flags.will = true;
        self.connect_flags.will_qos = qos;
        self.connect_flags.will_retain = retain;
        Ok(self)
    }

    #[must_use]
    pub const fn will_topic(&self) -> Option<&PubTopic> {
        self.will_topic.as_ref()
    }

    #[must_use]
    pub fn will_message(&self) -> &[u8] {
        self.will_message.as_ref()
    }

    #[must_use]
    pub const fn will_properties(&self) -> &Properties {
        &self.will_properties
    }

    /// Update username.
    ///
    /// # Errors
    ///
    /// Returns error if `username` is not a valid MQTT string.
    pub fn set_username(&mut self, username: &str) -> Result<&mut Self, EncodeError> {
        self.username = StringData::from(username)?;
        self.connect_flags.has_username = !self.username.is_empty();
        Ok(self)
    }

    #[must_use]
    pub fn username(&self) -> &str {
        self.username.as_ref()
    }

    /// Update password.
    ///
    /// # Errors
    ///
    /// Returns error if `password` is too large.
    pub fn set_password(&mut self, password: &[u8]) -> Result<&mut Self, EncodeError> {
        self.password = BinaryData::from_slice(password)?;
        self.connect_flags.has_password = !self.password.is_empty();
        Ok(self)
    }

    #[must_use]
    pub fn password(&self) -> &[u8] {
        self.password.as_ref()
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length = PROTOCOL_NAME_BYTES
            + 1 // protocol level
            + 1 // connect flags
            + 2 // keep alive
            + self.properties.bytes()
            + self.client_id.bytes();

        if self.connect_flags.will {
            remaining_length += self.will_properties.bytes();
            if let Some(will_topic) = &self.will_topic {
                remaining_length += will_topic.bytes();
            }
            remaining_length += self.will_message.bytes();
        }
        if self.connect_flags.has_username {
            remaining_length += self.username.bytes();
        }
        if self.connect_flags.has_password {
            remaining_length += self.password.bytes();
        }

        FixedHeader::new(PacketType::Connect, remaining_length)
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let protocol_name = StringData::decode(ba)?;
        if protocol_name.as_ref() != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }

        let protocol_level = ba.read_byte()?;
        if protocol_level != PROTOCOL_LEVEL {
            return Err(DecodeError::UnsupportedProtocolVersion);
        }

        let connect_flags = ConnectFlags::decode(ba)?;
        let keep_alive = ba.read_u16()?;

        let properties = Properties::decode(ba)?;
        if let Err(property_type) = check_property_type_list(properties.props(), CONNECT_PROPERTIES)
        {
            log::error!("ConnectPacket: property type {property_type:?} cannot be used in properties!");
            return Err(DecodeError::InvalidPropertyType);
        }

        let client_id = StringData::decode(ba)?;
        validate_client_id(client_id.as_ref()).map_err(|_| DecodeError::InvalidClientId)?;

        let (will_properties, will_topic, will_message) = if connect_flags.will {
            let will_properties = Properties::decode(ba)?;
            if let Err(property_type) =
                check_property_type_list(will_properties.props(), WILL_PROPERTIES)
            {
                log::error!(
                    "ConnectPacket: property type {property_type:?} cannot be used in will properties!"
                );
                return Err(DecodeError::InvalidPropertyType);
            }
            let will_topic = PubTopic::decode(ba)?;
            let will_message = BinaryData::decode(ba)?;
            (will_properties, Some(will_topic), will_message)
        } else {
            (Properties::new(), None, BinaryData::new())
        };

        let username = if connect_flags.has_username {
            StringData::decode(ba)?
        } else {
            StringData::new()
        };

        let password = if connect_flags.has_password {
            BinaryData::decode(ba)?
        } else {
            BinaryData::new()
        };

        Ok(Self {
            connect_flags,
            keep_alive,
            properties,
            client_id,
            will_properties,
            will_topic,
            will_message,
            username,
            password,
        })
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;

        let protocol_name = StringData::from(PROTOCOL_NAME)?;
        protocol_name.encode(buf)?;
        buf.push(PROTOCOL_LEVEL);
        self.connect_flags.encode(buf)?;
        buf.extend_from_slice(&self.keep_alive.to_be_bytes());
        self.properties.encode(buf)?;

        self.client_id.encode(buf)?;
        if self.connect_flags.will {
            self.will_properties.encode(buf)?;
            if let Some(will_topic) = &self.will_topic {
                will_topic.encode(buf)?;
            }
            self.will_message.encode(buf)?;
        }
        if self.connect_flags.has_username {
            self.username.encode(buf)?;
        }
        if self.connect_flags.has_password {
            self.password.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl PacketTrait for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Property, U32Data};

    #[test]
    fn test_connect_round_trip() {
        let mut packet = ConnectPacket::new("sensor-42").unwrap();
        packet.set_clean_start(true).set_keep_alive(60);
        packet
            .properties_mut()
            .push(Property::SessionExpiryInterval(U32Data::new(120)));
        packet
            .set_will("lights/office", b"offline", QoS::AtMostOnce, false)
            .unwrap();
        packet.set_username("admin").unwrap();
        packet.set_password(b"secret").unwrap();

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.client_id(), "sensor-42");
        assert_eq!(decoded.will_topic().unwrap().as_ref(), "lights/office");
        assert_eq!(decoded.will_message(), b"offline");
    }

    #[test]
    fn test_connect_variable_header_layout() {
        let mut packet = ConnectPacket::new("id").unwrap();
        packet.set_keep_alive(30);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        // 0x10, remaining length, "MQTT" with length prefix, level 5.
        assert_eq!(buf[0], 0x10);
        assert_eq!(&buf[2..8], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(buf[8], 0x05);
    }

    #[test]
    fn test_connect_rejects_wrong_version() {
        let mut packet = ConnectPacket::new("id").unwrap();
        packet.set_keep_alive(30);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        buf[8] = 0x04;

        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::UnsupportedProtocolVersion)
        );
    }

    #[test]
    fn test_connect_rejects_reserved_flag() {
        let packet = ConnectPacket::new("id").unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        // Connect flags byte follows the 7-byte protocol header.
        buf[9] |= 0b0000_0001;

        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidConnectFlags)
        );
    }
}
