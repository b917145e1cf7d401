// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Generate random string.
///
/// Used to assign a client identifier when a client connects with an empty one.
pub fn random_string(len: usize) -> String {
    String::from_utf8(
        thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .collect::<Vec<u8>>(),
    )
    .unwrap()
}

/// Invalid UTF-8 string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    TooManyData,

    InvalidChar,

    /// Server or client shall DISCONNECT immediately.
    SeriousError,
}

impl From<std::string::FromUtf8Error> for StringError {
    fn from(_e: std::string::FromUtf8Error) -> StringError {
        StringError::SeriousError
    }
}

/// Check data length exceeds 64k or not.
#[inline]
pub fn validate_two_bytes_data(data: &[u8]) -> Result<(), StringError> {
    if data.len() > u16::MAX as usize {
        Err(StringError::TooManyData)
    } else {
        Ok(())
    }
}

/// Check string characters and length.
///
/// The null character U+0000 is always a malformed packet [MQTT-1.5.4-2].
/// Unpaired surrogates U+D800..U+DFFF cannot occur in a Rust `String`, so
/// `String::from_utf8` already enforces [MQTT-1.5.4-1]. The byte order mark
/// U+FEFF is legal anywhere in the string and MUST NOT be stripped
/// [MQTT-1.5.4-3], so it passes through untouched.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > u16::MAX as usize {
        return Err(StringError::TooManyData);
    }

    for c in s.chars() {
        if c == '\u{0000}' {
            return Err(StringError::SeriousError);
        }

        // Control characters are "SHOULD NOT" in the protocol; we treat them
        // as malformed like the disallowed code points.
        if ('\u{0001}'..='\u{001f}').contains(&c) || ('\u{007f}'..='\u{009f}').contains(&c) {
            return Err(StringError::InvalidChar);
        }
    }

    // Empty string is valid.
    Ok(())
}

/// Convert range of bytes to valid UTF-8 string.
pub fn to_utf8_string(buf: &[u8]) -> Result<String, StringError> {
    let s = String::from_utf8(buf.to_vec())?;
    validate_utf8_string(&s)?;
    Ok(s)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    /// Larger than 65535 bytes.
    TooLong,

    /// Contains chars outside of 0-9a-zA-Z, '-' and '_'.
    InvalidChars,
}

/// Check client identifier characters and length.
///
/// The protocol only guarantees 1-23 alphanumeric chars; anything longer or
/// wilder is server's discretion. We accept alphanumerics plus '-' and '_',
/// which covers every client library seen in the wild. An empty id is valid,
/// the server assigns one.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.len() > u16::MAX as usize {
        return Err(ClientIdError::TooLong);
    }
    if client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(())
    } else {
        Err(ClientIdError::InvalidChars)
    }
}
