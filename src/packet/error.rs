//! Error types shared by the codec, channels and the reactor.

use std::io;
use thiserror::Error;

/// Errors that can occur while framing, parsing or moving MQTT packets.
#[derive(Debug, Error)]
pub enum MqttError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid packet type.
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    /// Invalid packet.
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Malformed remaining length.
    #[error("Malformed remaining length")]
    MalformedRemainingLength,

    /// Packet too large.
    #[error("Packet too large: {size} bytes (max: {max})")]
    PacketTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Invalid QoS level.
    #[error("Invalid QoS level: {0}")]
    InvalidQoS(u8),

    /// QoS level the engine does not deliver.
    #[error("Unsupported QoS level: {0}")]
    UnsupportedQoS(u8),

    /// Invalid UTF-8 string.
    #[error("Invalid UTF-8 string: {0}")]
    InvalidUtf8(String),

    /// String or binary field longer than a 16-bit length prefix allows.
    #[error("Field too long: {0} bytes (max: 65535)")]
    StringTooLong(usize),

    /// Invalid topic name.
    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    /// Invalid topic filter.
    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    /// Message id outside 1..=65535 where one is required.
    #[error("Invalid message id: {0}")]
    InvalidMessageId(u16),

    /// Explicit message id already queued or in flight on the channel.
    #[error("Message id {0} already in use")]
    MessageIdInUse(u16),

    /// Every message id is queued or in flight.
    #[error("No free message id")]
    MessageIdsExhausted,

    /// Connection refused by the peer.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Outbound connect or inbound CONNECT did not complete in time.
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// Peer silent for longer than the keep-alive window.
    #[error("Keep-alive timeout after {0:?}")]
    KeepAliveTimeout(std::time::Duration),

    /// Channel is closed.
    #[error("Channel {0} is closed")]
    ChannelClosed(u64),

    /// No channel with this id on the reactor.
    #[error("Unknown channel: {0}")]
    UnknownChannel(u64),

    /// Unparsable host, port or URI.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Fault raised by a handler callback.
    #[error("Handler error: {0}")]
    Handler(String),

    /// The reactor thread stopped on an unrecoverable fault.
    #[error("Reactor failed: {0}")]
    ReactorFailed(String),

    /// Incomplete packet.
    #[error("Incomplete packet: need more data")]
    IncompletePacket,
}

/// Result type for MQTT operations.
pub type MqttResult<T> = Result<T, MqttError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MqttError::InvalidTopicName("a/#/b".to_string());
        assert!(err.to_string().contains("a/#/b"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let mqtt_err = MqttError::from(io_err);
        assert!(matches!(mqtt_err, MqttError::Io(_)));
    }

    #[test]
    fn test_packet_too_large() {
        let err = MqttError::PacketTooLarge {
            size: 1_000_000,
            max: 256_000,
        };
        assert!(err.to_string().contains("1000000"));
    }
}
