// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Topic names and topic filters.
//!
//! A topic name is the `/`-separated path a PUBLISH is addressed to; it must
//! not contain wildcards. A topic filter is the pattern a subscription uses;
//! `+` matches exactly one level, `#` matches all remaining levels and is
//! only legal as the last level. Empty levels are legal in both
//! (`sport//results` has three levels, the middle one empty).

use std::fmt;

use crate::{
    utils::validate_utf8_string, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket,
    StringData,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    /// Empty string is neither a topic nor a filter.
    EmptyTopic,

    /// Wildcard chars in a topic name, or misplaced wildcards in a filter.
    InvalidWildcard,

    /// Not a valid MQTT UTF-8 string.
    InvalidString,

    /// Larger than 65535 bytes.
    TooLong,
}

fn validate_topic_string(s: &str) -> Result<(), TopicError> {
    if s.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if s.len() > u16::MAX as usize {
        return Err(TopicError::TooLong);
    }
    validate_utf8_string(s).map_err(|_| TopicError::InvalidString)
}

/// Topic name used in PUBLISH packets.
///
/// The Topic Name in a PUBLISH packet MUST NOT contain wildcard characters
/// [MQTT-3.3.2-2].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PubTopic(String);

impl PubTopic {
    /// Parse and validate a topic name.
    ///
    /// # Errors
    ///
    /// Returns error if `s` is empty, too long or contains `+` or `#`.
    pub fn new(s: &str) -> Result<Self, TopicError> {
        validate_topic_string(s)?;
        if s.contains(['+', '#']) {
            return Err(TopicError::InvalidWildcard);
        }
        Ok(Self(s.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }

    /// Iterate over the topic levels.
    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let s = StringData::decode(ba)?;
        Self::new(s.as_ref()).map_err(|_| DecodeError::InvalidTopic)
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let data = StringData::from(&self.0)?;
        data.encode(buf)
    }
}

/// One level of a topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPart {
    /// Normal level string.
    Str(String),

    /// Empty level, like the middle of `sport//results`.
    Empty,

    /// `+` char, matches exactly one level.
    SingleWildcard,

    /// `#` char, matches all remaining levels.
    MultiWildcard,
}

/// Topic filter used in SUBSCRIBE packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTopic {
    filter: String,
    parts: Vec<TopicPart>,
}

impl SubTopic {
    /// Parse and validate a topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if `filter` is empty, `#` is not the final level, or a
    /// wildcard is embedded inside a level like `a+b`.
    pub fn parse(filter: &str) -> Result<Self, TopicError> {
        validate_topic_string(filter)?;

        let levels: Vec<&str> = filter.split('/').collect();
        let last = levels.len() - 1;
        let mut parts = Vec::with_capacity(levels.len());
        for (i, level) in levels.iter().enumerate() {
            let part = match *level {
                "#" => {
                    if i != last {
                        return Err(TopicError::InvalidWildcard);
                    }
                    TopicPart::MultiWildcard
                }
                "+" => TopicPart::SingleWildcard,
                "" => TopicPart::Empty,
                s => {
                    if s.contains(['+', '#']) {
                        return Err(TopicError::InvalidWildcard);
                    }
                    TopicPart::Str(s.to_string())
                }
            };
            parts.push(part);
        }

        Ok(Self {
            filter: filter.to_string(),
            parts,
        })
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.filter.len()
    }

    /// Get parsed filter levels.
    #[must_use]
    pub fn parts(&self) -> &[TopicPart] {
        &self.parts
    }

    /// Iterate over the raw filter levels, wildcards included.
    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.filter.split('/')
    }

    /// Check whether a concrete topic name matches this filter.
    ///
    /// `+` matches exactly one level; `#` matches the remaining path of
    /// length >= 1; literals match exactly.
    #[must_use]
    pub fn is_match(&self, topic: &str) -> bool {
        let mut topic_levels = topic.split('/');
        for part in &self.parts {
            let level = topic_levels.next();
            match (part, level) {
                (TopicPart::MultiWildcard, Some(_)) => return true,
                (TopicPart::SingleWildcard, Some(_)) => {}
                (TopicPart::Str(s), Some(level)) => {
                    if s != level {
                        return false;
                    }
                }
                (TopicPart::Empty, Some(level)) => {
                    if !level.is_empty() {
                        return false;
                    }
                }
                (_, None) => return false,
            }
        }
        topic_levels.next().is_none()
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        &self.filter
    }
}

impl fmt::Display for SubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.filter)
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let s = StringData::decode(ba)?;
        Self::parse(s.as_ref()).map_err(|_| DecodeError::InvalidTopic)
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let data = StringData::from(&self.filter)?;
        data.encode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pub_topic_rejects_wildcards() {
        assert!(PubTopic::new("sensors/42/temp").is_ok());
        assert!(PubTopic::new("sensors/+/temp").is_err());
        assert!(PubTopic::new("sensors/#").is_err());
        assert!(PubTopic::new("").is_err());
    }

    #[test]
    fn test_sub_topic_validation() {
        assert!(SubTopic::parse("sensors/+/temp").is_ok());
        assert!(SubTopic::parse("#").is_ok());
        assert!(SubTopic::parse("sensors/#").is_ok());
        assert!(SubTopic::parse("sport//results").is_ok());
        assert!(SubTopic::parse("/").is_ok());

        assert!(SubTopic::parse("").is_err());
        assert!(SubTopic::parse("#/x").is_err());
        assert!(SubTopic::parse("a+b").is_err());
        assert!(SubTopic::parse("a#").is_err());
    }

    #[test]
    fn test_sub_topic_match_literal() {
        let filter = SubTopic::parse("a/b/c").unwrap();
        assert!(filter.is_match("a/b/c"));
        assert!(!filter.is_match("a/b"));
        assert!(!filter.is_match("a/b/c/d"));
        assert!(!filter.is_match("a/b/x"));
    }

    #[test]
    fn test_sub_topic_match_single_wildcard() {
        let filter = SubTopic::parse("sensors/+/temp").unwrap();
        assert!(filter.is_match("sensors/42/temp"));
        assert!(filter.is_match("sensors//temp"));
        assert!(!filter.is_match("sensors/temp"));
        assert!(!filter.is_match("sensors/42/43/temp"));
    }

    #[test]
    fn test_sub_topic_match_multi_wildcard() {
        let filter = SubTopic::parse("#").unwrap();
        assert!(filter.is_match("any/topic"));
        assert!(filter.is_match("any"));

        let filter = SubTopic::parse("sensors/#").unwrap();
        assert!(filter.is_match("sensors/42"));
        assert!(filter.is_match("sensors/42/temp"));
        // `#` matches the remaining path of length >= 1, not zero levels.
        assert!(!filter.is_match("sensors"));
    }
}
