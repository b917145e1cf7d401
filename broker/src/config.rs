// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::Error;

/// General section in config.
#[derive(Debug, Clone, Deserialize)]
pub struct General {
    /// Socket address the broker listens on.
    ///
    /// Default is "0.0.0.0:1883".
    #[serde(default = "General::default_listen_address")]
    listen_address: String,

    /// Capacity in bytes of each pooled frame buffer.
    ///
    /// Default is 1024.
    #[serde(default = "General::default_buffer_capacity")]
    buffer_capacity: usize,

    /// Number of buffers the pool retains. Buffers released into a full pool
    /// are dropped instead.
    ///
    /// Default is 1000.
    #[serde(default = "General::default_pool_capacity")]
    pool_capacity: usize,

    /// Maximum size in bytes of one control packet, fixed header included.
    /// A client that sends a larger packet is disconnected with reason 149.
    ///
    /// Default is 4096.
    #[serde(default = "General::default_max_packet_size")]
    max_packet_size: usize,

    /// Depth of the reader-to-dispatcher packet channel.
    ///
    /// Default is 100.
    #[serde(default = "General::default_inbound_channel_depth")]
    inbound_channel_depth: usize,

    /// Depth of each session's outbound frame channel. A full channel blocks
    /// publishers, which is the backpressure on slow subscribers.
    ///
    /// Default is 100.
    #[serde(default = "General::default_outbound_channel_depth")]
    outbound_channel_depth: usize,

    /// Seconds a fresh connection gets to deliver its CONNECT packet.
    ///
    /// Default is 1.
    #[serde(default = "General::default_connect_deadline")]
    connect_deadline: u64,
}

impl General {
    #[must_use]
    pub fn default_listen_address() -> String {
        "0.0.0.0:1883".to_string()
    }

    #[must_use]
    pub const fn default_buffer_capacity() -> usize {
        1024
    }

    #[must_use]
    pub const fn default_pool_capacity() -> usize {
        1000
    }

    #[must_use]
    pub const fn default_max_packet_size() -> usize {
        4096
    }

    #[must_use]
    pub const fn default_inbound_channel_depth() -> usize {
        100
    }

    #[must_use]
    pub const fn default_outbound_channel_depth() -> usize {
        100
    }

    #[must_use]
    pub const fn default_connect_deadline() -> u64 {
        1
    }

    #[must_use]
    pub fn listen_address(&self) -> &str {
        &self.listen_address
    }

    #[must_use]
    pub const fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    #[must_use]
    pub const fn pool_capacity(&self) -> usize {
        self.pool_capacity
    }

    #[must_use]
    pub const fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    #[must_use]
    pub const fn inbound_channel_depth(&self) -> usize {
        self.inbound_channel_depth
    }

    #[must_use]
    pub const fn outbound_channel_depth(&self) -> usize {
        self.outbound_channel_depth
    }

    #[must_use]
    pub const fn connect_deadline(&self) -> Duration {
        Duration::from_secs(self.connect_deadline)
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            listen_address: Self::default_listen_address(),
            buffer_capacity: Self::default_buffer_capacity(),
            pool_capacity: Self::default_pool_capacity(),
            max_packet_size: Self::default_max_packet_size(),
            inbound_channel_depth: Self::default_inbound_channel_depth(),
            outbound_channel_depth: Self::default_outbound_channel_depth(),
            connect_deadline: Self::default_connect_deadline(),
        }
    }
}

#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, Copy, Deserialize)]
pub enum LogLevel {
    #[serde(alias = "off")]
    Off,

    #[serde(alias = "error")]
    Error,

    #[serde(alias = "warn")]
    Warn,

    #[serde(alias = "info")]
    Info,

    #[serde(alias = "debug")]
    Debug,

    #[serde(alias = "trace")]
    Trace,
}

/// Log section in config.
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    /// Also print log to console.
    ///
    /// Default is true.
    #[serde(default = "Log::default_console_log")]
    console_log: bool,

    /// Set minimum log level.
    ///
    /// Available values are "off", "error", "warn", "info", "debug" and
    /// "trace". Default is "info".
    #[serde(default = "Log::default_log_level")]
    log_level: LogLevel,

    /// Path to log file. No log file is written if unset.
    ///
    /// Default is None.
    #[serde(default = "Log::default_log_file")]
    log_file: Option<String>,
}

impl Log {
    #[must_use]
    pub const fn default_console_log() -> bool {
        true
    }

    #[must_use]
    pub const fn default_log_level() -> LogLevel {
        LogLevel::Info
    }

    #[must_use]
    pub const fn default_log_file() -> Option<String> {
        None
    }

    #[must_use]
    pub const fn console_log(&self) -> bool {
        self.console_log
    }

    #[must_use]
    pub const fn log_level(&self) -> LogLevel {
        self.log_level
    }

    #[must_use]
    pub fn log_file(&self) -> Option<&str> {
        self.log_file.as_deref()
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            console_log: Self::default_console_log(),
            log_level: Self::default_log_level(),
            log_file: Self::default_log_file(),
        }
    }
}

/// Server main config.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    general: General,

    #[serde(default)]
    log: Log,
}

impl Config {
    /// Load config from a toml file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    #[must_use]
    pub const fn general(&self) -> &General {
        &self.general
    }

    #[must_use]
    pub const fn log(&self) -> &Log {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.general().listen_address(), "0.0.0.0:1883");
        assert_eq!(config.general().buffer_capacity(), 1024);
        assert_eq!(config.general().max_packet_size(), 4096);
        assert_eq!(config.general().inbound_channel_depth(), 100);
        assert_eq!(config.general().connect_deadline(), Duration::from_secs(1));
    }

    #[test]
    fn test_config_parse_partial() {
        let config: Config = toml::from_str(
            r#"
[general]
listen_address = "127.0.0.1:2883"
max_packet_size = 8192

[log]
log_level = "debug"
"#,
        )
        .unwrap();
        assert_eq!(config.general().listen_address(), "127.0.0.1:2883");
        assert_eq!(config.general().max_packet_size(), 8192);
        // Untouched fields keep their defaults.
        assert_eq!(config.general().buffer_capacity(), 1024);
    }
}
