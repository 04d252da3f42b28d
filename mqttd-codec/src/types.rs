use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

pub(crate) const MQTT: &[u8] = b"MQTT";
pub(crate) const MQISDP: &[u8] = b"MQIsdp";
pub(crate) const WILL_QOS_SHIFT: u8 = 3;

/// Largest value a variable byte integer can carry.
pub const MAX_VARIABLE_LENGTH: u32 = 268_435_455;

prim_enum! {
    /// Quality of Service
    #[derive(Serialize, Deserialize, PartialOrd, Ord, Hash)]
    pub enum QoS {
        /// At most once delivery, no acknowledgment and no retry.
        AtMostOnce = 0,
        /// At least once delivery, acknowledged by PUBACK.
        AtLeastOnce = 1,
        /// Exactly once delivery through the PUBREC/PUBREL/PUBCOMP handshake.
        ExactlyOnce = 2
    }
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        *self as u8
    }

    #[inline]
    pub fn less_value(&self, qos: QoS) -> QoS {
        if *self < qos {
            *self
        } else {
            qos
        }
    }
}

impl Default for QoS {
    fn default() -> Self {
        QoS::AtMostOnce
    }
}

prim_enum! {
    /// Protocol revision, numbered by the level byte sent in CONNECT.
    #[derive(Serialize, Deserialize, Hash, PartialOrd, Ord)]
    pub enum ProtocolVersion {
        V31 = 3,
        V311 = 4,
        V5 = 5
    }
}

impl ProtocolVersion {
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            ProtocolVersion::V31 => "MQIsdp",
            ProtocolVersion::V311 | ProtocolVersion::V5 => "MQTT",
        }
    }

    #[inline]
    pub fn level(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn is_v5(self) -> bool {
        matches!(self, ProtocolVersion::V5)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::V311
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V31 => write!(f, "3.1"),
            ProtocolVersion::V311 => write!(f, "3.1.1"),
            ProtocolVersion::V5 => write!(f, "5.0"),
        }
    }
}

prim_enum! {
    /// Control packet type, the high nibble of the first header byte.
    #[derive(Hash)]
    pub enum PacketType {
        Connect = 1,
        ConnectAck = 2,
        Publish = 3,
        PublishAck = 4,
        PublishReceived = 5,
        PublishRelease = 6,
        PublishComplete = 7,
        Subscribe = 8,
        SubscribeAck = 9,
        Unsubscribe = 10,
        UnsubscribeAck = 11,
        PingRequest = 12,
        PingResponse = 13,
        Disconnect = 14,
        Auth = 15
    }
}

impl PacketType {
    /// Flags every packet type except PUBLISH must carry in the low nibble.
    #[inline]
    pub(crate) fn required_flags(self) -> u8 {
        match self {
            PacketType::PublishRelease | PacketType::Subscribe | PacketType::Unsubscribe => 0b0010,
            _ => 0,
        }
    }
}

/// The first one to five bytes of every packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    /// Low nibble of the first byte. For PUBLISH: dup (bit 3), QoS (bits 1-2), retain (bit 0).
    pub flags: u8,
    /// Size of the variable header plus payload.
    pub remaining_length: u32,
}

impl FixedHeader {
    pub(crate) fn parse(first_byte: u8, remaining_length: u32) -> Result<Self, DecodeError> {
        let packet_type =
            PacketType::try_from(first_byte >> 4).map_err(|_| DecodeError::UnsupportedPacketType)?;
        let flags = first_byte & 0x0F;
        if packet_type == PacketType::Publish {
            ensure!((flags >> 1) & 0b11 != 0b11, DecodeError::MalformedPacket);
        } else {
            ensure!(flags == packet_type.required_flags(), DecodeError::MalformedPacket);
        }
        Ok(FixedHeader { packet_type, flags, remaining_length })
    }

    #[inline]
    pub fn first_byte(&self) -> u8 {
        (u8::from(self.packet_type) << 4) | self.flags
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ConnectFlags: u8 {
        const USERNAME    = 0b1000_0000;
        const PASSWORD    = 0b0100_0000;
        const WILL_RETAIN = 0b0010_0000;
        const WILL_QOS    = 0b0001_1000;
        const WILL        = 0b0000_0100;
        const CLEAN_START = 0b0000_0010;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ConnectAckFlags: u8 {
        const SESSION_PRESENT = 0b0000_0001;
    }
}

/// Reason code carried by v5 acknowledgments, DISCONNECT and AUTH.
///
/// The same numeric space also holds the v3 CONNACK return codes (0 to 5)
/// and the v3 SUBACK return codes (0, 1, 2 and 0x80).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ReasonCode(pub u8);

impl ReasonCode {
    pub const SUCCESS: ReasonCode = ReasonCode(0x00);
    pub const NORMAL_DISCONNECTION: ReasonCode = ReasonCode(0x00);
    pub const GRANTED_QOS_0: ReasonCode = ReasonCode(0x00);
    pub const GRANTED_QOS_1: ReasonCode = ReasonCode(0x01);
    pub const GRANTED_QOS_2: ReasonCode = ReasonCode(0x02);
    pub const DISCONNECT_WITH_WILL_MESSAGE: ReasonCode = ReasonCode(0x04);
    pub const NO_MATCHING_SUBSCRIBERS: ReasonCode = ReasonCode(0x10);
    pub const NO_SUBSCRIPTION_EXISTED: ReasonCode = ReasonCode(0x11);
    pub const CONTINUE_AUTHENTICATION: ReasonCode = ReasonCode(0x18);
    pub const RE_AUTHENTICATE: ReasonCode = ReasonCode(0x19);
    pub const UNSPECIFIED_ERROR: ReasonCode = ReasonCode(0x80);
    pub const MALFORMED_PACKET: ReasonCode = ReasonCode(0x81);
    pub const PROTOCOL_ERROR: ReasonCode = ReasonCode(0x82);
    pub const IMPLEMENTATION_SPECIFIC_ERROR: ReasonCode = ReasonCode(0x83);
    pub const UNSUPPORTED_PROTOCOL_VERSION: ReasonCode = ReasonCode(0x84);
    pub const CLIENT_IDENTIFIER_NOT_VALID: ReasonCode = ReasonCode(0x85);
    pub const BAD_USER_NAME_OR_PASSWORD: ReasonCode = ReasonCode(0x86);
    pub const NOT_AUTHORIZED: ReasonCode = ReasonCode(0x87);
    pub const SERVER_UNAVAILABLE: ReasonCode = ReasonCode(0x88);
    pub const SERVER_BUSY: ReasonCode = ReasonCode(0x89);
    pub const KEEP_ALIVE_TIMEOUT: ReasonCode = ReasonCode(0x8D);
    pub const SESSION_TAKEN_OVER: ReasonCode = ReasonCode(0x8E);
    pub const TOPIC_FILTER_INVALID: ReasonCode = ReasonCode(0x8F);
    pub const TOPIC_NAME_INVALID: ReasonCode = ReasonCode(0x90);
    pub const PACKET_IDENTIFIER_IN_USE: ReasonCode = ReasonCode(0x91);
    pub const PACKET_IDENTIFIER_NOT_FOUND: ReasonCode = ReasonCode(0x92);
    pub const RECEIVE_MAXIMUM_EXCEEDED: ReasonCode = ReasonCode(0x93);
    pub const PACKET_TOO_LARGE: ReasonCode = ReasonCode(0x95);
    pub const QUOTA_EXCEEDED: ReasonCode = ReasonCode(0x97);
    pub const PAYLOAD_FORMAT_INVALID: ReasonCode = ReasonCode(0x99);
    pub const RETAIN_NOT_SUPPORTED: ReasonCode = ReasonCode(0x9A);
    pub const QOS_NOT_SUPPORTED: ReasonCode = ReasonCode(0x9B);
    pub const SHARED_SUBSCRIPTIONS_NOT_SUPPORTED: ReasonCode = ReasonCode(0x9E);
    pub const WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED: ReasonCode = ReasonCode(0xA2);

    /// v3 CONNACK return codes.
    pub const V3_UNACCEPTABLE_PROTOCOL_VERSION: ReasonCode = ReasonCode(0x01);
    pub const V3_IDENTIFIER_REJECTED: ReasonCode = ReasonCode(0x02);
    pub const V3_SERVER_UNAVAILABLE: ReasonCode = ReasonCode(0x03);
    pub const V3_BAD_USER_NAME_OR_PASSWORD: ReasonCode = ReasonCode(0x04);
    pub const V3_NOT_AUTHORIZED: ReasonCode = ReasonCode(0x05);
    /// v3 SUBACK failure.
    pub const V3_SUBSCRIBE_FAILURE: ReasonCode = ReasonCode(0x80);

    #[inline]
    pub fn is_success(self) -> bool {
        self.0 < 0x80
    }

    #[inline]
    pub fn value(self) -> u8 {
        self.0
    }
}

impl From<QoS> for ReasonCode {
    fn from(qos: QoS) -> Self {
        ReasonCode(qos.value())
    }
}

impl fmt::Debug for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReasonCode({:#04x})", self.0)
    }
}

pub type TimestampMillis = i64;
