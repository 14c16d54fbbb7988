//! Configuration type definitions.

use crate::packet::{ProtocolVersion, MAX_REMAINING_LENGTH};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Reactor and channel settings.
    pub engine: EngineConfig,

    /// Defaults for client connections.
    pub client: ClientConfig,

    /// Mock broker settings.
    pub broker: BrokerConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Reactor and channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine name, used for thread names and log spans.
    pub name: String,

    /// How long an acknowledgable message may stay unacknowledged before a
    /// duplicate is sent.
    #[serde(with = "humantime_serde")]
    pub resend_interval: Duration,

    /// Limit for a TCP connect, and for a broker-side channel to receive
    /// CONNECT.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How long blocking calls wait for their operation.
    #[serde(with = "humantime_serde")]
    pub blocking_timeout: Duration,

    /// Largest accepted remaining length of an inbound packet.
    pub max_packet_size: usize,

    /// Bytes read from a socket per read call.
    pub read_buffer_size: usize,

    /// Closed channels whose unsent messages are kept for `transfer`.
    pub max_retired_channels: usize,

    /// Readiness events handled per poll.
    pub events_capacity: usize,

    /// How often the binary logs statistics.
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "r0n-mqtt".to_string(),
            resend_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            blocking_timeout: Duration::from_secs(30),
            max_packet_size: MAX_REMAINING_LENGTH,
            read_buffer_size: 8192,
            max_retired_channels: 1024,
            events_capacity: 1024,
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// Defaults applied to client connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Keep-alive interval sent in CONNECT. Zero disables keep-alive.
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,

    /// Clean session flag sent in CONNECT.
    pub clean_session: bool,

    /// Protocol revision.
    pub protocol: ProtocolVersion,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            protocol: ProtocolVersion::default(),
        }
    }
}

/// Mock broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listen address.
    pub bind: String,

    /// Accept connections without credentials.
    pub allow_anonymous: bool,

    /// Longest accepted client id.
    pub max_client_id_len: usize,

    /// Username to password.
    pub users: HashMap<String, String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:1883".to_string(),
            allow_anonymous: true,
            max_client_id_len: 23,
            users: HashMap::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` overrides it.
    pub level: LogLevel,

    /// Log format (json, pretty, compact).
    pub format: LogFormat,

    /// Output destination.
    pub output: LogOutput,
}

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace,
    /// Debug level.
    Debug,
    /// Info level (default).
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level (least verbose).
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (machine-readable).
    Json,
    /// Pretty format with colors (default).
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
}

/// Log output destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Standard output (default).
    #[default]
    Stdout,
    /// Standard error.
    Stderr,
}
