//! # Packet Codec
//!
//! Encoding and decoding of the fourteen MQTT 3.1 / 3.1.1 packet types.
//!
//! Fixed header byte is `(type << 4) | (dup << 3) | (qos << 1) | retain`,
//! followed by a 1-4 byte remaining-length varint. Strings are UTF-8 with a
//! 16-bit big-endian length prefix.
//!
//! [`decode`] works on a growing read buffer: partial frames stay in the
//! buffer until the rest arrives, and several frames may be taken from one
//! read.

pub mod codec;
pub mod error;
pub mod message;
pub mod types;

pub use codec::MAX_REMAINING_LENGTH;
pub use error::{MqttError, MqttResult};
pub use message::{decode, Message};
pub use types::{
    ConnAck, Connect, ConnectReturnCode, Packet, PacketType, ProtocolVersion, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, Subscribe, Subscription, UnsubAck, Unsubscribe, Will,
    SUBACK_FAILURE,
};
