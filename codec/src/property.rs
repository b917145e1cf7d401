// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{
    BinaryData, BoolData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket,
    PubTopic, QoS, StringData, StringPairData, U16Data, U32Data, VarInt,
};

/// Property identifiers which may appear more than once in one property list.
///
/// User Property (0x26) is the only repeatable identifier; it forms an
/// ordered sequence of name/value pairs.
pub const MULTIPLE_PROPERTIES: &[PropertyType] = &[PropertyType::UserProperty];

/// The 27 property identifiers defined in MQTT 5.0.
#[allow(clippy::module_name_repetitions)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0b,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1a,
    ServerReference = 0x1c,
    ReasonString = 0x1f,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2a,
}

impl PropertyType {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for PropertyType {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(Self::PayloadFormatIndicator),
            0x02 => Ok(Self::MessageExpiryInterval),
            0x03 => Ok(Self::ContentType),
            0x08 => Ok(Self::ResponseTopic),
            0x09 => Ok(Self::CorrelationData),
            0x0b => Ok(Self::SubscriptionIdentifier),
            0x11 => Ok(Self::SessionExpiryInterval),
            0x12 => Ok(Self::AssignedClientIdentifier),
            0x13 => Ok(Self::ServerKeepAlive),
            0x15 => Ok(Self::AuthenticationMethod),
            0x16 => Ok(Self::AuthenticationData),
            0x17 => Ok(Self::RequestProblemInformation),
            0x18 => Ok(Self::WillDelayInterval),
            0x19 => Ok(Self::RequestResponseInformation),
            0x1a => Ok(Self::ResponseInformation),
            0x1c => Ok(Self::ServerReference),
            0x1f => Ok(Self::ReasonString),
            0x21 => Ok(Self::ReceiveMaximum),
            0x22 => Ok(Self::TopicAliasMaximum),
            0x23 => Ok(Self::TopicAlias),
            0x24 => Ok(Self::MaximumQoS),
            0x25 => Ok(Self::RetainAvailable),
            0x26 => Ok(Self::UserProperty),
            0x27 => Ok(Self::MaximumPacketSize),
            0x28 => Ok(Self::WildcardSubscriptionAvailable),
            0x29 => Ok(Self::SubscriptionIdentifierAvailable),
            0x2a => Ok(Self::SharedSubscriptionAvailable),
            _ => Err(DecodeError::InvalidPropertyType),
        }
    }
}

/// One property entry: identifier plus typed value.
///
/// Each identifier has a fixed scalar type: byte, two byte integer, four
/// byte integer, variable byte integer, UTF-8 string, binary data, or UTF-8
/// string pair. A value that is not carried on the wire simply has no entry
/// in the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    /// Byte. Used in PUBLISH, Will Properties.
    ///
    /// 0 means the payload is unspecified bytes, 1 means UTF-8 encoded
    /// character data.
    PayloadFormatIndicator(BoolData),

    /// Four Byte Integer. Used in PUBLISH, Will Properties.
    MessageExpiryInterval(U32Data),

    /// UTF-8 Encoded String. Used in PUBLISH, Will Properties.
    ContentType(StringData),

    /// UTF-8 Encoded String used as the Topic Name for a response message.
    /// Used in PUBLISH, Will Properties.
    ResponseTopic(PubTopic),

    /// Binary Data. Used in PUBLISH, Will Properties.
    CorrelationData(BinaryData),

    /// Variable Byte Integer. Used in PUBLISH, SUBSCRIBE.
    ///
    /// The Subscription Identifier can have a value of 1 to 268,435,455.
    SubscriptionIdentifier(VarInt),

    /// Four Byte Integer. Used in CONNECT, CONNACK, DISCONNECT.
    SessionExpiryInterval(U32Data),

    /// UTF-8 Encoded String. Used in CONNACK.
    ///
    /// The Client Identifier assigned by the Server because a zero length
    /// Client Identifier was found in the CONNECT packet.
    AssignedClientIdentifier(StringData),

    /// Two Byte Integer. Used in CONNACK.
    ServerKeepAlive(U16Data),

    /// UTF-8 Encoded String. Used in CONNECT, CONNACK, AUTH.
    AuthenticationMethod(StringData),

    /// Binary Data. Used in CONNECT, CONNACK, AUTH.
    AuthenticationData(BinaryData),

    /// Byte. Used in CONNECT.
    RequestProblemInformation(BoolData),

    /// Four Byte Integer. Used in Will Properties.
    WillDelayInterval(U32Data),

    /// Byte. Used in CONNECT.
    RequestResponseInformation(BoolData),

    /// UTF-8 Encoded String. Used in CONNACK.
    ResponseInformation(StringData),

    /// UTF-8 Encoded String. Used in CONNACK, DISCONNECT.
    ServerReference(StringData),

    /// UTF-8 Encoded String. Used in CONNACK, PUBACK, PUBREC, PUBREL,
    /// PUBCOMP, SUBACK, UNSUBACK, DISCONNECT, AUTH.
    ReasonString(StringData),

    /// Two Byte Integer. Used in CONNECT, CONNACK.
    ReceiveMaximum(U16Data),

    /// Two Byte Integer. Used in CONNECT, CONNACK.
    TopicAliasMaximum(U16Data),

    /// Two Byte Integer. Used in PUBLISH.
    TopicAlias(U16Data),

    /// Byte. Used in CONNACK.
    MaximumQoS(QoS),

    /// Byte. Used in CONNACK.
    RetainAvailable(BoolData),

    /// UTF-8 String Pair. Used in every packet type that has properties.
    ///
    /// The same name is allowed to appear more than once; order is preserved.
    UserProperty(StringPairData),

    /// Four Byte Integer. Used in CONNECT, CONNACK.
    MaximumPacketSize(U32Data),

    /// Byte. Used in CONNACK.
    WildcardSubscriptionAvailable(BoolData),

    /// Byte. Used in CONNACK.
    SubscriptionIdentifierAvailable(BoolData),

    /// Byte. Used in CONNACK.
    SharedSubscriptionAvailable(BoolData),
}

impl Property {
    #[must_use]
    pub const fn property_type(&self) -> PropertyType {
        match self {
            Self::PayloadFormatIndicator(_) => PropertyType::PayloadFormatIndicator,
            Self::MessageExpiryInterval(_) => PropertyType::MessageExpiryInterval,
            Self::ContentType(_) => PropertyType::ContentType,
            Self::ResponseTopic(_) => PropertyType::ResponseTopic,
            Self::CorrelationData(_) => PropertyType::CorrelationData,
            Self::SubscriptionIdentifier(_) => PropertyType::SubscriptionIdentifier,
            Self::SessionExpiryInterval(_) => PropertyType::SessionExpiryInterval,
            Self::AssignedClientIdentifier(_) => PropertyType::AssignedClientIdentifier,
            Self::ServerKeepAlive(_) => PropertyType::ServerKeepAlive,
            Self::AuthenticationMethod(_) => PropertyType::AuthenticationMethod,
            Self::AuthenticationData(_) => PropertyType::AuthenticationData,
            Self::RequestProblemInformation(_) => PropertyType::RequestProblemInformation,
            Self::WillDelayInterval(_) => PropertyType::WillDelayInterval,
            Self::RequestResponseInformation(_) => PropertyType::RequestResponseInformation,
            Self::ResponseInformation(_) => PropertyType::ResponseInformation,
            Self::ServerReference(_) => PropertyType::ServerReference,
            Self::ReasonString(_) => PropertyType::ReasonString,
            Self::ReceiveMaximum(_) => PropertyType::ReceiveMaximum,
            Self::TopicAliasMaximum(_) => PropertyType::TopicAliasMaximum,
            Self::TopicAlias(_) => PropertyType::TopicAlias,
            Self::MaximumQoS(_) => PropertyType::MaximumQoS,
            Self::RetainAvailable(_) => PropertyType::RetainAvailable,
            Self::UserProperty(_) => PropertyType::UserProperty,
            Self::MaximumPacketSize(_) => PropertyType::MaximumPacketSize,
            Self::WildcardSubscriptionAvailable(_) => PropertyType::WildcardSubscriptionAvailable,
            Self::SubscriptionIdentifierAvailable(_) => {
                PropertyType::SubscriptionIdentifierAvailable
            }
            Self::SharedSubscriptionAvailable(_) => PropertyType::SharedSubscriptionAvailable,
        }
    }

    /// Get byte length in packet, identifier byte included.
    #[must_use]
    pub fn bytes(&self) -> usize {
        let value_bytes = match self {
            Self::PayloadFormatIndicator(_)
            | Self::RequestProblemInformation(_)
            | Self::RequestResponseInformation(_)
            | Self::MaximumQoS(_)
            | Self::RetainAvailable(_)
            | Self::WildcardSubscriptionAvailable(_)
            | Self::SubscriptionIdentifierAvailable(_)
            | Self::SharedSubscriptionAvailable(_) => 1,

            Self::ServerKeepAlive(_)
            | Self::ReceiveMaximum(_)
            | Self::TopicAliasMaximum(_)
            | Self::TopicAlias(_) => U16Data::bytes(),

            Self::MessageExpiryInterval(_)
            | Self::SessionExpiryInterval(_)
            | Self::WillDelayInterval(_)
            | Self::MaximumPacketSize(_) => U32Data::bytes(),

            Self::SubscriptionIdentifier(v) => v.bytes(),

            Self::ContentType(s)
            | Self::AssignedClientIdentifier(s)
            | Self::AuthenticationMethod(s)
            | Self::ResponseInformation(s)
            | Self::ServerReference(s)
            | Self::ReasonString(s) => s.bytes(),

            Self::ResponseTopic(t) => t.bytes(),

            Self::CorrelationData(b) | Self::AuthenticationData(b) => b.bytes(),

            Self::UserProperty(pair) => pair.bytes(),
        };
        PropertyType::bytes() + value_bytes
    }
}

impl DecodePacket for Property {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let id = ba.read_byte()?;
        let property_type = PropertyType::try_from(id)?;
        match property_type {
            PropertyType::PayloadFormatIndicator => {
                Ok(Self::PayloadFormatIndicator(BoolData::decode(ba)?))
            }
            PropertyType::MessageExpiryInterval => {
                Ok(Self::MessageExpiryInterval(U32Data::decode(ba)?))
            }
            PropertyType::ContentType => Ok(Self::ContentType(StringData::decode(ba)?)),
            PropertyType::ResponseTopic => Ok(Self::ResponseTopic(PubTopic::decode(ba)?)),
            PropertyType::CorrelationData => Ok(Self::CorrelationData(BinaryData::decode(ba)?)),
            PropertyType::SubscriptionIdentifier => {
                let value = VarInt::decode(ba)?;
                // A Subscription Identifier of 0 is a Protocol Error.
                if value.is_empty() {
                    return Err(DecodeError::InvalidVarInt);
                }
                Ok(Self::SubscriptionIdentifier(value))
            }
            PropertyType::SessionExpiryInterval => {
                Ok(Self::SessionExpiryInterval(U32Data::decode(ba)?))
            }
            PropertyType::AssignedClientIdentifier => {
                Ok(Self::AssignedClientIdentifier(StringData::decode(ba)?))
            }
            PropertyType::ServerKeepAlive => Ok(Self::ServerKeepAlive(U16Data::decode(ba)?)),
            PropertyType::AuthenticationMethod => {
                Ok(Self::AuthenticationMethod(StringData::decode(ba)?))
            }
            PropertyType::AuthenticationData => {
                Ok(Self::AuthenticationData(BinaryData::decode(ba)?))
            }
            PropertyType::RequestProblemInformation => {
                Ok(Self::RequestProblemInformation(BoolData::decode(ba)?))
            }
            PropertyType::WillDelayInterval => Ok(Self::WillDelayInterval(U32Data::decode(ba)?)),
            PropertyType::RequestResponseInformation => {
                Ok(Self::RequestResponseInformation(BoolData::decode(ba)?))
            }
            PropertyType::ResponseInformation => {
                Ok(Self::ResponseInformation(StringData::decode(ba)?))
            }
            PropertyType::ServerReference => Ok(Self::ServerReference(StringData::decode(ba)?)),
            PropertyType::ReasonString => Ok(Self::ReasonString(StringData::decode(ba)?)),
            PropertyType::ReceiveMaximum => Ok(Self::ReceiveMaximum(U16Data::decode(ba)?)),
            PropertyType::TopicAliasMaximum => Ok(Self::TopicAliasMaximum(U16Data::decode(ba)?)),
            PropertyType::TopicAlias => Ok(Self::TopicAlias(U16Data::decode(ba)?)),
            PropertyType::MaximumQoS => {
                let byte = ba.read_byte()?;
                Ok(Self::MaximumQoS(QoS::try_from(byte)?))
            }
            PropertyType::RetainAvailable => Ok(Self::RetainAvailable(BoolData::decode(ba)?)),
            PropertyType::UserProperty => Ok(Self::UserProperty(StringPairData::decode(ba)?)),
            PropertyType::MaximumPacketSize => Ok(Self::MaximumPacketSize(U32Data::decode(ba)?)),
            PropertyType::WildcardSubscriptionAvailable => {
                Ok(Self::WildcardSubscriptionAvailable(BoolData::decode(ba)?))
            }
            PropertyType::SubscriptionIdentifierAvailable => Ok(
                Self::SubscriptionIdentifierAvailable(BoolData::decode(ba)?),
            ),
            PropertyType::SharedSubscriptionAvailable => {
                Ok(Self::SharedSubscriptionAvailable(BoolData::decode(ba)?))
            }
        }
    }
}

impl EncodePacket for Property {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(self.property_type() as u8);
        let value_bytes = match self {
            Self::PayloadFormatIndicator(v)
            | Self::RequestProblemInformation(v)
            | Self::RequestResponseInformation(v)
            | Self::RetainAvailable(v)
            | Self::WildcardSubscriptionAvailable(v)
            | Self::SubscriptionIdentifierAvailable(v)
            | Self::SharedSubscriptionAvailable(v) => v.encode(buf)?,

            Self::MaximumQoS(qos) => {
                buf.push(*qos as u8);
                1
            }

            Self::ServerKeepAlive(v)
            | Self::ReceiveMaximum(v)
            | Self::TopicAliasMaximum(v)
            | Self::TopicAlias(v) => v.encode(buf)?,

            Self::MessageExpiryInterval(v)
            | Self::SessionExpiryInterval(v)
            | Self::WillDelayInterval(v)
            | Self::MaximumPacketSize(v) => v.encode(buf)?,

            Self::SubscriptionIdentifier(v) => v.encode(buf)?,

            Self::ContentType(v)
            | Self::AssignedClientIdentifier(v)
            | Self::AuthenticationMethod(v)
            | Self::ResponseInformation(v)
            | Self::ServerReference(v)
            | Self::ReasonString(v) => v.encode(buf)?,

            Self::ResponseTopic(v) => v.encode(buf)?,

            Self::CorrelationData(v) | Self::AuthenticationData(v) => v.encode(buf)?,

            Self::UserProperty(v) => v.encode(buf)?,
        };
        Ok(PropertyType::bytes() + value_bytes)
    }
}

/// The last field of the variable header of most packets is a set of
/// properties: a variable byte integer with the total byte length of the
/// packed entries, followed by the entries themselves.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Properties(Vec<Property>);

impl Properties {
    /// Create an empty property list.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Get a reference to the property entries.
    #[must_use]
    pub fn props(&self) -> &[Property] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Append a property entry.
    ///
    /// A non-repeatable property replaces any previous entry with the same
    /// identifier; user properties accumulate.
    pub fn push(&mut self, property: Property) {
        let property_type = property.property_type();
        if !MULTIPLE_PROPERTIES.contains(&property_type) {
            self.0.retain(|p| p.property_type() != property_type);
        }
        self.0.push(property);
    }

    /// Find the first entry with `property_type`.
    #[must_use]
    pub fn get(&self, property_type: PropertyType) -> Option<&Property> {
        self.0.iter().find(|p| p.property_type() == property_type)
    }

    /// Iterate over user property pairs in wire order.
    pub fn user_properties(&self) -> impl Iterator<Item = &StringPairData> {
        self.0.iter().filter_map(|p| match p {
            Property::UserProperty(pair) => Some(pair),
            _ => None,
        })
    }

    /// Byte length of the packed entries, without the length prefix.
    fn content_bytes(&self) -> usize {
        self.0.iter().map(Property::bytes).sum()
    }

    /// Get byte length in packet, length prefix included.
    #[must_use]
    pub fn bytes(&self) -> usize {
        let len = self.content_bytes();
        let prefix = VarInt::from(len).map_or(4, |v| v.bytes());
        prefix + len
    }
}

impl DecodePacket for Properties {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let total = VarInt::decode(ba)?;

        let mut properties = Vec::new();
        let mut seen: Vec<PropertyType> = Vec::new();
        let mut consumed = 0;
        while consumed < total.value() {
            let property = Property::decode(ba)?;
            consumed += property.bytes();

            let property_type = property.property_type();
            if seen.contains(&property_type) && !MULTIPLE_PROPERTIES.contains(&property_type) {
                return Err(DecodeError::DuplicateProperty);
            }
            seen.push(property_type);
            properties.push(property);
        }

        if consumed != total.value() {
            return Err(DecodeError::InvalidRemainingLength);
        }

        Ok(Self(properties))
    }
}

impl EncodePacket for Properties {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let len = self.content_bytes();
        let prefix = VarInt::from(len)?;
        let mut written = prefix.encode(buf)?;
        for property in &self.0 {
            written += property.encode(buf)?;
        }
        Ok(written)
    }
}

/// Check that every entry in `properties` is allowed by `types` and that no
/// non-repeatable identifier appears twice.
///
/// # Errors
///
/// Returns the offending property type.
pub fn check_property_type_list(
    properties: &[Property],
    types: &[PropertyType],
) -> Result<(), PropertyType> {
    if properties.is_empty() {
        return Ok(());
    }

    for property in properties {
        if !types.contains(&property.property_type()) {
            return Err(property.property_type());
        }
    }

    for property_type in types {
        let count = properties
            .iter()
            .filter(|p| p.property_type() == *property_type)
            .count();
        if count > 1 && !MULTIPLE_PROPERTIES.contains(property_type) {
            return Err(*property_type);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_round_trip() {
        let mut properties = Properties::new();
        properties.push(Property::SessionExpiryInterval(U32Data::new(300)));
        properties.push(Property::ReceiveMaximum(U16Data::new(20)));
        properties.push(Property::UserProperty(
            StringPairData::new("origin", "unit-test").unwrap(),
        ));
        properties.push(Property::UserProperty(
            StringPairData::new("origin", "again").unwrap(),
        ));

        let mut buf = Vec::new();
        let written = properties.encode(&mut buf).unwrap();
        assert_eq!(written, properties.bytes());

        let mut ba = ByteArray::new(&buf);
        let decoded = Properties::decode(&mut ba).unwrap();
        assert_eq!(decoded, properties);
        assert_eq!(decoded.user_properties().count(), 2);
    }

    #[test]
    fn test_properties_empty() {
        let properties = Properties::new();
        let mut buf = Vec::new();
        properties.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0x00]);
        assert_eq!(properties.bytes(), 1);
    }

    #[test]
    fn test_properties_reject_duplicate() {
        // Two session expiry intervals.
        let buf = [
            0x0a, 0x11, 0x00, 0x00, 0x00, 0x05, 0x11, 0x00, 0x00, 0x00, 0x06,
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            Properties::decode(&mut ba),
            Err(DecodeError::DuplicateProperty)
        );
    }

    #[test]
    fn test_properties_reject_unknown_id() {
        let buf = [0x02, 0x7f, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            Properties::decode(&mut ba),
            Err(DecodeError::InvalidPropertyType)
        );
    }

    #[test]
    fn test_check_property_type_list() {
        let mut properties = Properties::new();
        properties.push(Property::TopicAlias(U16Data::new(3)));
        assert!(check_property_type_list(
            properties.props(),
            &[PropertyType::TopicAlias, PropertyType::UserProperty]
        )
        .is_ok());
        assert_eq!(
            check_property_type_list(properties.props(), &[PropertyType::UserProperty]),
            Err(PropertyType::TopicAlias)
        );
    }
}
