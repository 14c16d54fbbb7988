//! Encoded messages and stream decoding.

use super::codec::{peek_frame, read_remaining_length};
use super::error::{MqttError, MqttResult};
use super::types::{Packet, QoS};
use crate::topic::{TopicFilter, TopicName};
use bytes::{Bytes, BytesMut};
use std::time::Instant;

/// A packet together with its immutable wire form.
///
/// Outbound messages are validated and encoded once at construction.
/// Inbound messages wrap the exact bytes read off the socket and the time
/// they were decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    packet: Packet,
    encoded: Bytes,
    received_at: Option<Instant>,
}

impl Message {
    /// Validate and encode a packet for sending.
    ///
    /// # Errors
    ///
    /// Returns an error for QoS 2 publishes, invalid topic names or filters,
    /// over-long fields and bodies past the remaining-length limit.
    pub fn outbound(packet: Packet) -> MqttResult<Self> {
        validate_outbound(&packet)?;
        let encoded = packet.encode()?.freeze();
        Ok(Self {
            packet,
            encoded,
            received_at: None,
        })
    }

    /// Wrap a decoded packet.
    pub(crate) fn inbound(packet: Packet, encoded: Bytes, received_at: Instant) -> Self {
        Self {
            packet,
            encoded,
            received_at: Some(received_at),
        }
    }

    /// The interpreted packet.
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    /// Consume the message, keeping the packet.
    pub fn into_packet(self) -> Packet {
        self.packet
    }

    /// Wire bytes, fixed header included.
    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    /// Byte count after the fixed header.
    pub fn remaining_length(&self) -> usize {
        let mut header = self.encoded.get(1..).unwrap_or_default();
        read_remaining_length(&mut header).map_or(0, |len| len as usize)
    }

    /// When the message was read, for inbound messages.
    pub fn received_at(&self) -> Option<Instant> {
        self.received_at
    }

    /// Re-encode with a new message id.
    pub fn with_message_id(&self, message_id: u16) -> MqttResult<Self> {
        let packet = self.packet.with_message_id(message_id);
        let encoded = packet.encode()?.freeze();
        Ok(Self {
            packet,
            encoded,
            received_at: self.received_at,
        })
    }

    /// Re-encode with the duplicate flag set.
    pub fn with_dup(&self) -> MqttResult<Self> {
        if self.packet.dup() {
            return Ok(self.clone());
        }
        let packet = self.packet.with_dup(true);
        let encoded = packet.encode()?.freeze();
        Ok(Self {
            packet,
            encoded,
            received_at: self.received_at,
        })
    }
}

fn validate_outbound(packet: &Packet) -> MqttResult<()> {
    match packet {
        Packet::Publish(p) => {
            if p.qos == QoS::ExactlyOnce {
                return Err(MqttError::UnsupportedQoS(2));
            }
            TopicName::validate(&p.topic)
        },
        Packet::Subscribe(p) => {
            if p.subscriptions.is_empty() {
                return Err(MqttError::InvalidPacket(
                    "SUBSCRIBE without topic filters".to_string(),
                ));
            }
            p.subscriptions
                .iter()
                .try_for_each(|s| TopicFilter::validate(&s.topic_filter))
        },
        Packet::Unsubscribe(p) => {
            if p.topic_filters.is_empty() {
                return Err(MqttError::InvalidPacket(
                    "UNSUBSCRIBE without topic filters".to_string(),
                ));
            }
            p.topic_filters
                .iter()
                .try_for_each(|f| TopicFilter::validate(f))
        },
        _ => Ok(()),
    }
}

/// Decode the next complete message from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched while the next frame is
/// partial. On success only that frame's bytes are consumed; anything after
/// it stays in `buf` for the next call.
///
/// # Errors
///
/// Malformed remaining lengths, frames above `max_packet_size` and bodies
/// that do not match their remaining length are protocol violations.
pub fn decode(
    buf: &mut BytesMut,
    received_at: Instant,
    max_packet_size: usize,
) -> MqttResult<Option<Message>> {
    let Some((header_len, remaining_length)) = peek_frame(buf, max_packet_size)? else {
        return Ok(None);
    };

    let encoded = buf.split_to(header_len + remaining_length).freeze();
    let first_byte = encoded[0];
    let body = encoded.slice(header_len..);
    let packet = Packet::parse(first_byte, body)?;

    Ok(Some(Message::inbound(packet, encoded, received_at)))
}
