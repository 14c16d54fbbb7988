//! MQTT 3.1 / 3.1.1 packet types.
//!
//! Every packet kind is a variant of [`Packet`]. Encoding is a pure function of
//! the fields; changing a message id or the duplicate flag produces a new
//! value instead of patching bytes in place.

use super::codec::{
    read_binary, read_string, read_u16, write_binary, write_remaining_length, write_string,
};
use super::error::{MqttError, MqttResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Quality of Service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (acknowledged).
    AtLeastOnce = 1,
    /// Exactly once delivery. Decoded but never delivered by the engine.
    ExactlyOnce = 2,
}

impl QoS {
    /// Create QoS from byte value.
    pub fn from_u8(value: u8) -> MqttResult<Self> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            _ => Err(MqttError::InvalidQoS(value)),
        }
    }
}

/// MQTT packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Connection request.
    Connect = 1,
    /// Connection acknowledgment.
    ConnAck = 2,
    /// Publish message.
    Publish = 3,
    /// Publish acknowledgment (QoS 1).
    PubAck = 4,
    /// Publish received (QoS 2, step 1).
    PubRec = 5,
    /// Publish release (QoS 2, step 2).
    PubRel = 6,
    /// Publish complete (QoS 2, step 3).
    PubComp = 7,
    /// Subscribe request.
    Subscribe = 8,
    /// Subscribe acknowledgment.
    SubAck = 9,
    /// Unsubscribe request.
    Unsubscribe = 10,
    /// Unsubscribe acknowledgment.
    UnsubAck = 11,
    /// Ping request.
    PingReq = 12,
    /// Ping response.
    PingResp = 13,
    /// Disconnect notification.
    Disconnect = 14,
}

impl PacketType {
    /// Create packet type from the upper nibble of the fixed header.
    pub fn from_u8(value: u8) -> MqttResult<Self> {
        match value {
            1 => Ok(Self::Connect),
            2 => Ok(Self::ConnAck),
            3 => Ok(Self::Publish),
            4 => Ok(Self::PubAck),
            5 => Ok(Self::PubRec),
            6 => Ok(Self::PubRel),
            7 => Ok(Self::PubComp),
            8 => Ok(Self::Subscribe),
            9 => Ok(Self::SubAck),
            10 => Ok(Self::Unsubscribe),
            11 => Ok(Self::UnsubAck),
            12 => Ok(Self::PingReq),
            13 => Ok(Self::PingResp),
            14 => Ok(Self::Disconnect),
            _ => Err(MqttError::InvalidPacketType(value)),
        }
    }
}

/// Protocol revision announced in CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// MQTT 3.1 (`MQIsdp`, level 3).
    V31,
    /// MQTT 3.1.1 (`MQTT`, level 4).
    #[default]
    V311,
}

impl ProtocolVersion {
    /// Protocol name written in CONNECT.
    pub fn name(&self) -> &'static str {
        match self {
            Self::V31 => "MQIsdp",
            Self::V311 => "MQTT",
        }
    }

    /// Protocol level byte.
    pub fn level(&self) -> u8 {
        match self {
            Self::V31 => 3,
            Self::V311 => 4,
        }
    }

    /// Match a CONNECT's name and level.
    pub fn from_connect(name: &str, level: u8) -> Option<Self> {
        match (name, level) {
            ("MQIsdp", 3) => Some(Self::V31),
            ("MQTT", 4) => Some(Self::V311),
            _ => None,
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Connection accepted.
    Accepted = 0,
    /// Unacceptable protocol version.
    BadProtocolVersion = 1,
    /// Client identifier rejected.
    IdentifierRejected = 2,
    /// Server unavailable.
    ServerUnavailable = 3,
    /// Bad user name or password.
    BadCredentials = 4,
    /// Not authorized.
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    /// Check if connection was accepted.
    pub fn is_accepted(&self) -> bool {
        *self == Self::Accepted
    }

    /// Create from byte value.
    pub fn from_u8(value: u8) -> MqttResult<Self> {
        match value {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::BadProtocolVersion),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::BadCredentials),
            5 => Ok(Self::NotAuthorized),
            _ => Err(MqttError::InvalidPacket(format!(
                "unknown CONNACK return code {value}"
            ))),
        }
    }
}

impl std::fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::BadProtocolVersion => write!(f, "unacceptable protocol version"),
            Self::IdentifierRejected => write!(f, "identifier rejected"),
            Self::ServerUnavailable => write!(f, "server unavailable"),
            Self::BadCredentials => write!(f, "bad user name or password"),
            Self::NotAuthorized => write!(f, "not authorized"),
        }
    }
}

/// MQTT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// CONNECT packet.
    Connect(Connect),
    /// CONNACK packet.
    ConnAck(ConnAck),
    /// PUBLISH packet.
    Publish(Publish),
    /// PUBACK packet.
    PubAck(PubAck),
    /// PUBREC packet.
    PubRec(PubRec),
    /// PUBREL packet.
    PubRel(PubRel),
    /// PUBCOMP packet.
    PubComp(PubComp),
    /// SUBSCRIBE packet.
    Subscribe(Subscribe),
    /// SUBACK packet.
    SubAck(SubAck),
    /// UNSUBSCRIBE packet.
    Unsubscribe(Unsubscribe),
    /// UNSUBACK packet.
    UnsubAck(UnsubAck),
    /// PINGREQ packet.
    PingReq,
    /// PINGRESP packet.
    PingResp,
    /// DISCONNECT packet.
    Disconnect,
}

impl Packet {
    /// Get the packet type.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect => PacketType::Disconnect,
        }
    }

    /// QoS carried in the fixed header.
    pub fn qos(&self) -> QoS {
        match self {
            Self::Publish(p) => p.qos,
            Self::PubRel(_) | Self::Subscribe(_) | Self::Unsubscribe(_) => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        }
    }

    /// Duplicate delivery flag.
    pub fn dup(&self) -> bool {
        match self {
            Self::Publish(p) => p.dup,
            Self::PubRel(p) => p.dup,
            Self::Subscribe(p) => p.dup,
            Self::Unsubscribe(p) => p.dup,
            _ => false,
        }
    }

    /// Retain flag.
    pub fn retain(&self) -> bool {
        matches!(self, Self::Publish(p) if p.retain)
    }

    /// Message id, if this kind carries one.
    pub fn message_id(&self) -> Option<u16> {
        match self {
            Self::Publish(p) if p.qos != QoS::AtMostOnce => Some(p.message_id),
            Self::PubAck(p) => Some(p.message_id),
            Self::PubRec(p) => Some(p.message_id),
            Self::PubRel(p) => Some(p.message_id),
            Self::PubComp(p) => Some(p.message_id),
            Self::Subscribe(p) => Some(p.message_id),
            Self::SubAck(p) => Some(p.message_id),
            Self::Unsubscribe(p) => Some(p.message_id),
            Self::UnsubAck(p) => Some(p.message_id),
            _ => None,
        }
    }

    /// Whether the peer must acknowledge this packet before it leaves the
    /// in-flight table.
    pub fn requires_ack(&self) -> bool {
        match self {
            Self::Publish(p) => p.qos == QoS::AtLeastOnce,
            Self::Subscribe(_) | Self::Unsubscribe(_) => true,
            _ => false,
        }
    }

    /// Message id acknowledged by this packet, with the packet type it settles.
    pub fn acknowledges(&self) -> Option<(u16, PacketType)> {
        match self {
            Self::PubAck(p) => Some((p.message_id, PacketType::Publish)),
            Self::SubAck(p) => Some((p.message_id, PacketType::Subscribe)),
            Self::UnsubAck(p) => Some((p.message_id, PacketType::Unsubscribe)),
            _ => None,
        }
    }

    /// Connection-control packets that only make sense on the connection
    /// they were created for.
    pub fn is_connection_control(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::ConnAck(_) | Self::PingReq | Self::PingResp | Self::Disconnect
        )
    }

    /// Copy of this packet carrying a different message id.
    pub fn with_message_id(&self, message_id: u16) -> Self {
        let mut packet = self.clone();
        match &mut packet {
            Self::Publish(p) => p.message_id = message_id,
            Self::PubAck(p) => p.message_id = message_id,
            Self::PubRec(p) => p.message_id = message_id,
            Self::PubRel(p) => p.message_id = message_id,
            Self::PubComp(p) => p.message_id = message_id,
            Self::Subscribe(p) => p.message_id = message_id,
            Self::SubAck(p) => p.message_id = message_id,
            Self::Unsubscribe(p) => p.message_id = message_id,
            Self::UnsubAck(p) => p.message_id = message_id,
            _ => {},
        }
        packet
    }

    /// Copy of this packet with the duplicate flag set.
    pub fn with_dup(&self, dup: bool) -> Self {
        let mut packet = self.clone();
        match &mut packet {
            Self::Publish(p) => p.dup = dup,
            Self::PubRel(p) => p.dup = dup,
            Self::Subscribe(p) => p.dup = dup,
            Self::Unsubscribe(p) => p.dup = dup,
            _ => {},
        }
        packet
    }

    /// Parse a packet body whose frame has already been isolated.
    ///
    /// `body` holds exactly `remaining length` bytes. Fields running past it,
    /// or bytes left over after a fixed-size body, are protocol violations.
    pub fn parse(first_byte: u8, mut body: Bytes) -> MqttResult<Self> {
        let packet_type = PacketType::from_u8(first_byte >> 4)?;
        let flags = first_byte & 0x0F;
        let remaining_length = body.len();

        let packet = match packet_type {
            PacketType::Connect => Connect::parse(&mut body).map(Self::Connect),
            PacketType::ConnAck => ConnAck::parse(&mut body).map(Self::ConnAck),
            PacketType::Publish => Publish::parse(&mut body, flags).map(Self::Publish),
            PacketType::PubAck => PubAck::parse(&mut body).map(Self::PubAck),
            PacketType::PubRec => PubRec::parse(&mut body).map(Self::PubRec),
            PacketType::PubRel => PubRel::parse(&mut body, flags).map(Self::PubRel),
            PacketType::PubComp => PubComp::parse(&mut body).map(Self::PubComp),
            PacketType::Subscribe => Subscribe::parse(&mut body, flags).map(Self::Subscribe),
            PacketType::SubAck => SubAck::parse(&mut body).map(Self::SubAck),
            PacketType::Unsubscribe => Unsubscribe::parse(&mut body, flags).map(Self::Unsubscribe),
            PacketType::UnsubAck => UnsubAck::parse(&mut body).map(Self::UnsubAck),
            PacketType::PingReq => Ok(Self::PingReq),
            PacketType::PingResp => Ok(Self::PingResp),
            PacketType::Disconnect => Ok(Self::Disconnect),
        }
        .map_err(|e| match e {
            MqttError::IncompletePacket => MqttError::InvalidPacket(format!(
                "{packet_type:?} fields exceed remaining length {remaining_length}"
            )),
            other => other,
        })?;

        if body.has_remaining() {
            return Err(MqttError::InvalidPacket(format!(
                "{packet_type:?} has {} unexpected trailing bytes",
                body.remaining()
            )));
        }

        Ok(packet)
    }

    /// Serialize the packet, fixed header included.
    pub fn encode(&self) -> MqttResult<BytesMut> {
        let mut body = BytesMut::new();
        match self {
            Self::Connect(p) => p.encode_body(&mut body)?,
            Self::ConnAck(p) => p.encode_body(&mut body),
            Self::Publish(p) => p.encode_body(&mut body)?,
            Self::PubAck(p) => body.put_u16(p.message_id),
            Self::PubRec(p) => body.put_u16(p.message_id),
            Self::PubRel(p) => body.put_u16(p.message_id),
            Self::PubComp(p) => body.put_u16(p.message_id),
            Self::Subscribe(p) => p.encode_body(&mut body)?,
            Self::SubAck(p) => p.encode_body(&mut body),
            Self::Unsubscribe(p) => p.encode_body(&mut body)?,
            Self::UnsubAck(p) => body.put_u16(p.message_id),
            Self::PingReq | Self::PingResp | Self::Disconnect => {},
        }

        build_packet(self.fixed_header(), &body)
    }

    /// First byte of the fixed header.
    pub fn fixed_header(&self) -> u8 {
        let mut byte = (self.packet_type() as u8) << 4;
        if self.dup() {
            byte |= 0x08;
        }
        byte |= (self.qos() as u8) << 1;
        if self.retain() {
            byte |= 0x01;
        }
        byte
    }
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol name.
    pub protocol_name: String,
    /// Protocol level.
    pub protocol_level: u8,
    /// Clean session flag.
    pub clean_session: bool,
    /// Will message.
    pub will: Option<Will>,
    /// Username.
    pub username: Option<String>,
    /// Password.
    pub password: Option<Bytes>,
    /// Keep alive interval in seconds.
    pub keep_alive: u16,
    /// Client identifier.
    pub client_id: String,
}

impl Connect {
    /// Create a CONNECT for the given protocol revision.
    pub fn new(version: ProtocolVersion, client_id: impl Into<String>) -> Self {
        Self {
            protocol_name: version.name().to_string(),
            protocol_level: version.level(),
            clean_session: true,
            will: None,
            username: None,
            password: None,
            keep_alive: 60,
            client_id: client_id.into(),
        }
    }

    /// Parse a CONNECT body.
    pub fn parse(buf: &mut impl Buf) -> MqttResult<Self> {
        let protocol_name = read_string(buf)?;

        if buf.remaining() < 4 {
            return Err(MqttError::IncompletePacket);
        }
        let protocol_level = buf.get_u8();

        let flags = buf.get_u8();
        if flags & 0x01 != 0 {
            return Err(MqttError::Protocol(
                "reserved CONNECT flag is set".to_string(),
            ));
        }
        let clean_session = (flags & 0x02) != 0;
        let will_flag = (flags & 0x04) != 0;
        let will_qos = (flags >> 3) & 0x03;
        let will_retain = (flags & 0x20) != 0;
        let password_flag = (flags & 0x40) != 0;
        let username_flag = (flags & 0x80) != 0;

        let keep_alive = buf.get_u16();
        let client_id = read_string(buf)?;

        let will = if will_flag {
            let topic = read_string(buf)?;
            let payload = read_binary(buf)?;
            Some(Will {
                topic,
                payload,
                qos: QoS::from_u8(will_qos)?,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            Some(read_string(buf)?)
        } else {
            None
        };

        let password = if password_flag {
            Some(read_binary(buf)?)
        } else {
            None
        };

        Ok(Self {
            protocol_name,
            protocol_level,
            clean_session,
            will,
            username,
            password,
            keep_alive,
            client_id,
        })
    }

    fn encode_body(&self, buf: &mut BytesMut) -> MqttResult<()> {
        write_string(buf, &self.protocol_name)?;
        buf.put_u8(self.protocol_level);

        let mut flags: u8 = 0;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(ref will) = self.will {
            flags |= 0x04;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        buf.put_u8(flags);
        buf.put_u16(self.keep_alive);

        write_string(buf, &self.client_id)?;

        if let Some(ref will) = self.will {
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }
        if let Some(ref username) = self.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = self.password {
            write_binary(buf, password)?;
        }
        Ok(())
    }
}

/// Will message carried in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    /// Topic.
    pub topic: String,
    /// Payload.
    pub payload: Bytes,
    /// QoS level.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    /// Return code.
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    /// Create a CONNACK.
    pub fn new(return_code: ConnectReturnCode) -> Self {
        Self { return_code }
    }

    /// Parse a CONNACK body. The first byte is reserved.
    pub fn parse(buf: &mut impl Buf) -> MqttResult<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::IncompletePacket);
        }
        let _reserved = buf.get_u8();
        let return_code = ConnectReturnCode::from_u8(buf.get_u8())?;
        Ok(Self { return_code })
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(0);
        buf.put_u8(self.return_code as u8);
    }
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Duplicate delivery flag.
    pub dup: bool,
    /// QoS level.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
    /// Topic name.
    pub topic: String,
    /// Message id. Zero for QoS 0, and for QoS 1 until the channel allocates one.
    pub message_id: u16,
    /// Payload.
    pub payload: Bytes,
}

impl Publish {
    /// Create a QoS 0 PUBLISH.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.into(),
            message_id: 0,
            payload: payload.into(),
        }
    }

    /// Set QoS.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Empty retained payload: deletes the retained message for the topic.
    pub fn is_retained_delete(&self) -> bool {
        self.retain && self.payload.is_empty()
    }

    /// Parse a PUBLISH body.
    pub fn parse(buf: &mut impl Buf, flags: u8) -> MqttResult<Self> {
        let dup = (flags & 0x08) != 0;
        let qos = QoS::from_u8((flags >> 1) & 0x03)?;
        let retain = (flags & 0x01) != 0;

        let topic = read_string(buf)?;

        let message_id = if qos != QoS::AtMostOnce {
            let id = read_u16(buf)?;
            if id == 0 {
                return Err(MqttError::InvalidMessageId(0));
            }
            id
        } else {
            0
        };

        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            message_id,
            payload,
        })
    }

    fn encode_body(&self, buf: &mut BytesMut) -> MqttResult<()> {
        write_string(buf, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            buf.put_u16(self.message_id);
        }
        buf.extend_from_slice(&self.payload);
        Ok(())
    }
}

macro_rules! id_only_packet {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            /// Message id.
            pub message_id: u16,
        }

        impl $name {
            /// Create the packet.
            pub fn new(message_id: u16) -> Self {
                Self { message_id }
            }

            /// Parse the two-byte body.
            pub fn parse(buf: &mut impl Buf) -> MqttResult<Self> {
                Ok(Self {
                    message_id: read_u16(buf)?,
                })
            }
        }
    };
}

id_only_packet!(
    /// PUBACK packet.
    PubAck
);
id_only_packet!(
    /// PUBREC packet (QoS 2, step 1).
    PubRec
);
id_only_packet!(
    /// PUBCOMP packet (QoS 2, step 3).
    PubComp
);
id_only_packet!(
    /// UNSUBACK packet.
    UnsubAck
);

/// PUBREL packet (QoS 2, step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    /// Duplicate delivery flag.
    pub dup: bool,
    /// Message id.
    pub message_id: u16,
}

impl PubRel {
    /// Create a PUBREL.
    pub fn new(message_id: u16) -> Self {
        Self {
            dup: false,
            message_id,
        }
    }

    /// Parse a PUBREL body.
    pub fn parse(buf: &mut impl Buf, flags: u8) -> MqttResult<Self> {
        Ok(Self {
            dup: (flags & 0x08) != 0,
            message_id: read_u16(buf)?,
        })
    }
}

/// Topic filter and requested QoS in a SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic filter.
    pub topic_filter: String,
    /// Requested QoS.
    pub qos: QoS,
}

impl Subscription {
    /// Create a subscription entry.
    pub fn new(topic_filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            qos,
        }
    }
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Duplicate delivery flag.
    pub dup: bool,
    /// Message id.
    pub message_id: u16,
    /// Subscriptions.
    pub subscriptions: Vec<Subscription>,
}

impl Subscribe {
    /// Create a SUBSCRIBE; the channel allocates the message id.
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        Self {
            dup: false,
            message_id: 0,
            subscriptions,
        }
    }

    /// Parse a SUBSCRIBE body.
    pub fn parse(buf: &mut impl Buf, flags: u8) -> MqttResult<Self> {
        let message_id = read_u16(buf)?;
        if message_id == 0 {
            return Err(MqttError::InvalidMessageId(0));
        }

        let mut subscriptions = Vec::new();
        while buf.has_remaining() {
            let topic_filter = read_string(buf)?;
            if !buf.has_remaining() {
                return Err(MqttError::IncompletePacket);
            }
            let qos = QoS::from_u8(buf.get_u8() & 0x03)?;
            subscriptions.push(Subscription { topic_filter, qos });
        }

        if subscriptions.is_empty() {
            return Err(MqttError::Protocol(
                "SUBSCRIBE without topic filters".to_string(),
            ));
        }

        Ok(Self {
            dup: (flags & 0x08) != 0,
            message_id,
            subscriptions,
        })
    }

    fn encode_body(&self, buf: &mut BytesMut) -> MqttResult<()> {
        buf.put_u16(self.message_id);
        for sub in &self.subscriptions {
            write_string(buf, &sub.topic_filter)?;
            buf.put_u8(sub.qos as u8);
        }
        Ok(())
    }
}

/// Granted-QoS byte signalling a rejected subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    /// Message id.
    pub message_id: u16,
    /// One granted QoS (or [`SUBACK_FAILURE`]) per requested filter.
    pub granted: Vec<u8>,
}

impl SubAck {
    /// Create a SUBACK.
    pub fn new(message_id: u16, granted: Vec<u8>) -> Self {
        Self {
            message_id,
            granted,
        }
    }

    /// Parse a SUBACK body.
    pub fn parse(buf: &mut impl Buf) -> MqttResult<Self> {
        let message_id = read_u16(buf)?;
        let granted = buf.copy_to_bytes(buf.remaining()).to_vec();
        Ok(Self {
            message_id,
            granted,
        })
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.message_id);
        buf.extend_from_slice(&self.granted);
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    /// Duplicate delivery flag.
    pub dup: bool,
    /// Message id.
    pub message_id: u16,
    /// Topic filters.
    pub topic_filters: Vec<String>,
}

impl Unsubscribe {
    /// Create an UNSUBSCRIBE; the channel allocates the message id.
    pub fn new(topic_filters: Vec<String>) -> Self {
        Self {
            dup: false,
            message_id: 0,
            topic_filters,
        }
    }

    /// Parse an UNSUBSCRIBE body.
    pub fn parse(buf: &mut impl Buf, flags: u8) -> MqttResult<Self> {
        let message_id = read_u16(buf)?;
        if message_id == 0 {
            return Err(MqttError::InvalidMessageId(0));
        }

        let mut topic_filters = Vec::new();
        while buf.has_remaining() {
            topic_filters.push(read_string(buf)?);
        }

        if topic_filters.is_empty() {
            return Err(MqttError::Protocol(
                "UNSUBSCRIBE without topic filters".to_string(),
            ));
        }

        Ok(Self {
            dup: (flags & 0x08) != 0,
            message_id,
            topic_filters,
        })
    }

    fn encode_body(&self, buf: &mut BytesMut) -> MqttResult<()> {
        buf.put_u16(self.message_id);
        for filter in &self.topic_filters {
            write_string(buf, filter)?;
        }
        Ok(())
    }
}

/// Prefix `body` with a fixed header.
fn build_packet(first_byte: u8, body: &[u8]) -> MqttResult<BytesMut> {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(first_byte);
    write_remaining_length(&mut buf, body.len())?;
    buf.extend_from_slice(body);
    Ok(buf)
}
